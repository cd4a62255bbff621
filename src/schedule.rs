//! Tolerance schedules.

use crate::{
    error::{AbcError, Result},
    population::Population,
};

/// How the tolerance evolves over generations.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// One tolerance vector per generation, used verbatim.
    Fixed(Vec<Vec<f64>>),
    /// Start from an effectively infinite tolerance and use the `alpha`
    /// quantile of each population's distances for the next generation, until
    /// every component reaches `target`.
    Adaptive { target: Vec<f64>, alpha: f64 },
}

/// Tunables of the adaptive schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveOptions {
    /// A candidate this close to its target counts as converged.
    pub tolerance: f64,
    /// Candidates are rounded to this many decimal digits.
    pub digits: i32,
    /// Tolerance of the first generation.
    pub initial: f64,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            digits: 4,
            initial: 1e10,
        }
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        let check = |eps: &[f64], what: &str| -> Result<()> {
            if eps.is_empty() {
                return Err(AbcError::InvalidConfig(format!("{what} tolerance is empty")));
            }
            if eps.iter().any(|e| !(*e >= 0.)) {
                return Err(AbcError::InvalidConfig(format!(
                    "{what} tolerance {eps:?} has negative or NaN components"
                )));
            }
            Ok(())
        };
        match self {
            Schedule::Fixed(steps) => {
                let first = steps.first().ok_or_else(|| {
                    AbcError::InvalidConfig("fixed schedule has no generations".to_string())
                })?;
                for (generation, eps) in steps.iter().enumerate() {
                    check(eps, &format!("generation {generation}"))?;
                    if eps.len() != first.len() {
                        return Err(AbcError::InvalidConfig(format!(
                            "generation {generation} tolerance has {} components, expected {}",
                            eps.len(),
                            first.len()
                        )));
                    }
                }
            }
            Schedule::Adaptive { target, alpha } => {
                check(target, "target")?;
                if !(*alpha > 0. && *alpha < 1.) {
                    return Err(AbcError::InvalidConfig(format!(
                        "quantile {alpha} must lie in (0, 1)"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of distance components the schedule expects.
    pub fn dimension(&self) -> usize {
        match self {
            Schedule::Fixed(steps) => steps.first().map(|eps| eps.len()).unwrap_or(0),
            Schedule::Adaptive { target, .. } => target.len(),
        }
    }
}

/// Drives a [`Schedule`] across generations.
#[derive(Debug, Clone)]
pub struct Scheduler {
    schedule: Schedule,
    options: AdaptiveOptions,
    converged: bool,
}

impl Scheduler {
    pub fn new(schedule: Schedule, options: AdaptiveOptions) -> Result<Self> {
        schedule.validate()?;
        Ok(Self {
            schedule,
            options,
            converged: false,
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Tolerance of generation 0.
    pub fn first_epsilon(&self) -> Vec<f64> {
        match &self.schedule {
            Schedule::Fixed(steps) => steps[0].clone(),
            Schedule::Adaptive { target, .. } => vec![self.options.initial; target.len()],
        }
    }

    /// Tolerance of the generation after `population`, or `None` once the
    /// schedule is finished.
    ///
    /// The adaptive schedule finishes one generation after every component
    /// has been clamped to its target.
    pub fn next_epsilon(&mut self, population: &Population) -> Option<Vec<f64>> {
        match &self.schedule {
            Schedule::Fixed(steps) => steps.get(population.generation + 1).cloned(),
            Schedule::Adaptive { target, alpha } => {
                if self.converged {
                    return None;
                }
                let mut all_converged = true;
                let next = target
                    .iter()
                    .enumerate()
                    .map(|(dim, &goal)| {
                        let candidate = match quantile(population, dim, *alpha) {
                            Some(q) => round_to(q, self.options.digits),
                            None => population.epsilon.get(dim).copied().unwrap_or(goal),
                        };
                        if candidate < goal || (candidate - goal).abs() < self.options.tolerance {
                            goal
                        } else {
                            all_converged = false;
                            candidate
                        }
                    })
                    .collect::<Vec<_>>();
                tracing::debug!(?next, converged = all_converged, "adaptive tolerance");
                self.converged = all_converged;
                Some(next)
            }
        }
    }
}

/// `alpha` quantile of one distance component, pooled over every replicate
/// of every particle.
fn quantile(population: &Population, dim: usize, alpha: f64) -> Option<f64> {
    let mut pooled: Vec<f64> = population
        .distances
        .iter()
        .flatten()
        .filter_map(|d| d.get(dim).copied())
        .filter(|d| !d.is_nan())
        .collect();
    if pooled.is_empty() {
        return None;
    }
    pooled.sort_by(|a, b| a.total_cmp(b));
    let idx = ((alpha * pooled.len() as f64).floor() as usize).min(pooled.len() - 1);
    Some(pooled[idx])
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
