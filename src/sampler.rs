//! Proposal sampling from the priors or from a previous population.

use rand::Rng;

use crate::{
    error::{AbcError, Result},
    model::Model,
    model_kernel::sample_jump,
    population::Population,
    prior::sample_parameters,
};

/// A (model, parameters) pair waiting to be simulated.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub model: usize,
    pub parameters: Box<[f64]>,
}

/// Draw an index with probability proportional to `weights`.
pub(crate) fn categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let u = rng.random::<f64>() * total;
    let mut acc = 0.;
    let mut last = 0;
    for (idx, &w) in weights.iter().enumerate() {
        if w <= 0. {
            continue;
        }
        acc += w;
        last = idx;
        if acc > u {
            return idx;
        }
    }
    last
}

/// Draw `count` proposals from the model prior and the parameter priors.
pub fn sample_from_prior<R: Rng + ?Sized>(
    models: &[Model],
    model_prior: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<Proposal> {
    (0..count)
        .map(|_| {
            let model = if models.len() > 1 {
                categorical(model_prior, rng)
            } else {
                0
            };
            Proposal {
                model,
                parameters: sample_parameters(models[model].priors(), rng),
            }
        })
        .collect()
}

/// Pick a particle of `model` from `previous` with probability proportional
/// to its weight.
///
/// Draws `u` uniformly in `[0, marginal]` and walks the particles of the
/// model until their cumulative weight exceeds it. If rounding leaves `u`
/// unreached, the last particle of the model is returned. Returns `None` if
/// the model has no particles.
pub fn sample_particle_from_model<R: Rng + ?Sized>(
    previous: &Population,
    model: usize,
    rng: &mut R,
) -> Option<usize> {
    let marginal = previous.marginals.get(model).copied().unwrap_or(0.);
    let u = rng.random::<f64>() * marginal;
    let mut acc = 0.;
    let mut last = None;
    for (idx, particle) in previous.model_particles(model) {
        acc += particle.weight;
        last = Some(idx);
        if acc > u {
            break;
        }
    }
    last
}

/// Draw `count` proposals by resampling and perturbing `previous`.
///
/// Each proposal picks a model from the previous marginals and applies the
/// model-jump kernel. The source particle, perturbation and prior check are
/// then retried for that model until the perturbed parameters have positive
/// prior density, at most `max_attempts` times.
pub fn sample_from_population<R: Rng + ?Sized>(
    models: &[Model],
    previous: &Population,
    model_kernel: f64,
    max_attempts: usize,
    count: usize,
    rng: &mut R,
) -> Result<Vec<Proposal>> {
    let num_models = models.len();
    (0..count)
        .map(|_| {
            let picked = if num_models > 1 {
                categorical(&previous.marginals, rng)
            } else {
                0
            };
            let model = sample_jump(picked, num_models, model_kernel, &previous.dead_models, rng);
            let kernel = &previous.kernels[model];
            let priors = models[model].priors();

            for _ in 0..max_attempts {
                let Some(source) = sample_particle_from_model(previous, model, rng) else {
                    continue;
                };
                let mut parameters = previous.particles[source].parameters.clone();
                let density =
                    kernel.perturb(model, &mut parameters, priors, &previous.aux[source], rng)?;
                if density > 0. {
                    return Ok(Proposal { model, parameters });
                }
            }
            Err(AbcError::KernelPriorMismatch {
                model,
                attempts: max_attempts,
            })
        })
        .collect()
}
