//! Particles and populations.

use faer::Mat;

use crate::kernel::{Kernel, KernelAux};

/// One weighted (model, parameters) sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub model: usize,
    pub parameters: Box<[f64]>,
    /// Normalized importance weight.
    pub weight: f64,
    /// Number of accepted replicates out of `beta`.
    pub acceptances: usize,
}

/// The particle set of one generation together with everything the next
/// generation needs to propose from it.
///
/// Populations are produced wholesale at the end of a generation and never
/// modified afterwards.
#[derive(Debug, Clone)]
pub struct Population {
    pub generation: usize,
    /// Tolerance that produced this population.
    pub epsilon: Vec<f64>,
    pub particles: Vec<Particle>,
    /// Sum of particle weights per model.
    pub marginals: Vec<f64>,
    pub dead_models: Vec<usize>,
    pub kernels: Vec<Kernel>,
    /// Kernel auxiliary information, one entry per particle.
    pub aux: Vec<KernelAux>,
    /// Number of proposals simulated to fill the population.
    pub sampled: usize,
    /// Distance vectors of every replicate, per particle.
    pub distances: Vec<Vec<Vec<f64>>>,
    /// Fitted trajectories of every replicate, per particle. Empty unless
    /// trajectories are stored.
    pub trajectories: Vec<Vec<Mat<f64>>>,
}

impl Population {
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn num_models(&self) -> usize {
        self.marginals.len()
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.sampled == 0 {
            0.
        } else {
            self.particles.len() as f64 / self.sampled as f64
        }
    }

    pub fn is_dead(&self, model: usize) -> bool {
        self.dead_models.contains(&model)
    }

    /// Particles of one model, with their index in the population.
    pub fn model_particles(&self, model: usize) -> impl Iterator<Item = (usize, &Particle)> {
        self.particles
            .iter()
            .enumerate()
            .filter(move |(_, particle)| particle.model == model)
    }

    pub fn report(&self) -> GenerationReport {
        GenerationReport {
            generation: self.generation,
            epsilon: self.epsilon.clone(),
            sampled: self.sampled,
            accepted: self.particles.len(),
            acceptance_rate: self.acceptance_rate(),
            marginals: self.marginals.clone(),
            dead_models: self.dead_models.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            epsilon: self.epsilon.clone(),
            particles: self.particles.clone(),
            kernels: self.kernels.clone(),
        }
    }
}

/// Summary statistics of one finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub generation: usize,
    pub epsilon: Vec<f64>,
    pub sampled: usize,
    pub accepted: usize,
    pub acceptance_rate: f64,
    pub marginals: Vec<f64>,
    pub dead_models: Vec<usize>,
}

/// The persisted part of a population. Everything else can be recomputed
/// from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub generation: usize,
    pub epsilon: Vec<f64>,
    pub particles: Vec<Particle>,
    /// Kernels at the end of the generation, one per model. Kernels of
    /// models with few particles may date from an earlier generation, so
    /// they cannot always be refitted from `particles`. Empty if unknown.
    pub kernels: Vec<Kernel>,
}
