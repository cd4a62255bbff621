//! Competing mechanistic models and their simulators.

use anyhow::Result;
use rand::RngCore;

use crate::{data::Trajectories, error::AbcError, fit::Fit, prior::Prior};

/// Trait for the external simulators that produce trajectories.
///
/// `simulate` receives one parameter vector per particle and must return a
/// tensor of shape `(parameters.len(), replicates, timepoints.len(), states)`.
/// Stochastic simulators must draw all randomness from `rng` so that runs are
/// reproducible.
///
/// Errors are not fatal to sampling: the whole sub-batch is treated as
/// rejected.
pub trait Simulator: Send + Sync {
    fn simulate(
        &self,
        parameters: &[&[f64]],
        timepoints: &[f64],
        replicates: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Trajectories>;
}

impl<F> Simulator for F
where
    F: Fn(&[&[f64]], &[f64], usize, &mut dyn RngCore) -> Result<Trajectories> + Send + Sync,
{
    fn simulate(
        &self,
        parameters: &[&[f64]],
        timepoints: &[f64],
        replicates: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Trajectories> {
        self(parameters, timepoints, replicates, rng)
    }
}

/// A candidate model: priors over its parameters, how its states map onto
/// the observed data and the simulator that produces those states.
pub struct Model {
    name: String,
    priors: Box<[Prior]>,
    fit: Fit,
    simulator: Box<dyn Simulator>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("priors", &self.priors)
            .field("fit", &self.fit)
            .finish_non_exhaustive()
    }
}

impl Model {
    pub fn new(
        name: impl Into<String>,
        priors: Vec<Prior>,
        fit: Fit,
        simulator: impl Simulator + 'static,
    ) -> std::result::Result<Self, AbcError> {
        let name = name.into();
        if priors.is_empty() {
            return Err(AbcError::InvalidConfig(format!(
                "model `{name}` has no parameters"
            )));
        }
        for prior in priors.iter() {
            prior.validate()?;
        }
        Ok(Self {
            name,
            priors: priors.into(),
            fit,
            simulator: Box::new(simulator),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priors(&self) -> &[Prior] {
        &self.priors
    }

    pub fn nparameters(&self) -> usize {
        self.priors.len()
    }

    pub fn fit(&self) -> &Fit {
        &self.fit
    }

    pub fn simulator(&self) -> &dyn Simulator {
        self.simulator.as_ref()
    }

    /// Indices of the parameters that are not fixed by a constant prior.
    pub fn free_parameters(&self) -> Vec<usize> {
        self.priors
            .iter()
            .enumerate()
            .filter(|(_, prior)| !prior.is_constant())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// True if every free parameter has a uniform prior.
    pub fn all_free_uniform(&self) -> bool {
        self.priors
            .iter()
            .all(|prior| prior.is_constant() || prior.uniform_bounds().is_some())
    }

    pub(crate) fn check_parameters(
        &self,
        model: usize,
        parameters: &[f64],
    ) -> std::result::Result<(), AbcError> {
        if parameters.len() != self.nparameters() {
            return Err(AbcError::ParameterCount {
                model,
                expected: self.nparameters(),
                found: parameters.len(),
            });
        }
        Ok(())
    }
}
