//! The ABC-SMC engine.

use anyhow::Context;
use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    data::ObservedData,
    dispatch::Dispatcher,
    distance::{Distance, EuclideanDistance},
    error::{AbcError, Result},
    kernel::{auxiliary_info, rebuild_kernels, Kernel, KernelFamily, KernelParams},
    model::Model,
    population::{GenerationReport, Particle, Population, Snapshot},
    prior::joint_density,
    sampler::{sample_from_population, sample_from_prior},
    schedule::{AdaptiveOptions, Schedule, Scheduler},
    storage::PopulationStorage,
    weights::{compute_weights, dead_models, model_marginals, normalize},
};

/// Settings for the ABC-SMC sampler
#[derive(Debug, Clone, PartialEq)]
pub struct AbcSettings {
    /// Number of particles in every population.
    pub nparticles: usize,
    /// Number of proposals simulated together.
    pub nbatch: usize,
    /// Number of stochastic replicates simulated per proposal.
    pub beta: usize,
    /// Probability of a particle keeping its model between generations.
    pub model_kernel: f64,
    pub kernel: KernelFamily,
    /// Prior over models. `None` is uniform.
    pub model_prior: Option<Vec<f64>>,
    /// Maximum number of perturbations tried for one proposal before giving
    /// up with a kernel/prior mismatch.
    pub max_perturb_attempts: usize,
    pub seed: u64,
    /// Keep the fitted trajectories of every accepted particle.
    pub store_trajectories: bool,
    /// Simulate the model groups of a batch on the rayon thread pool.
    pub parallel: bool,
    pub adaptive: AdaptiveOptions,
}

impl Default for AbcSettings {
    fn default() -> Self {
        Self {
            nparticles: 100,
            nbatch: 100,
            beta: 1,
            model_kernel: 0.7,
            kernel: KernelFamily::ComponentUniform,
            model_prior: None,
            max_perturb_attempts: 10_000,
            seed: 0,
            store_trajectories: false,
            parallel: true,
            adaptive: AdaptiveOptions::default(),
        }
    }
}

impl AbcSettings {
    /// Check the settings against the number of models and return the
    /// normalized model prior.
    fn validate(&self, num_models: usize) -> Result<Vec<f64>> {
        let positive = [
            ("nparticles", self.nparticles),
            ("nbatch", self.nbatch),
            ("beta", self.beta),
            ("max_perturb_attempts", self.max_perturb_attempts),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AbcError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if !(0. ..=1.).contains(&self.model_kernel) {
            return Err(AbcError::InvalidConfig(format!(
                "model kernel {} must lie in [0, 1]",
                self.model_kernel
            )));
        }
        if let KernelFamily::NearestNeighbours { k: Some(0) } = self.kernel {
            return Err(AbcError::InvalidConfig(
                "nearest neighbour kernel needs at least one neighbour".to_string(),
            ));
        }

        let prior = match &self.model_prior {
            None => vec![1.; num_models],
            Some(prior) => prior.clone(),
        };
        if prior.len() != num_models {
            return Err(AbcError::InvalidConfig(format!(
                "model prior has {} entries for {num_models} models",
                prior.len()
            )));
        }
        if prior.iter().any(|p| !(p.is_finite() && *p >= 0.)) {
            return Err(AbcError::InvalidConfig(format!(
                "model prior {prior:?} has negative or non-finite entries"
            )));
        }
        normalize(&prior)
            .map_err(|_| AbcError::InvalidConfig("model prior sums to zero".to_string()))
    }
}

/// Where a [`Generations`] driver is in the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Sampling,
    Weighting,
    KernelRebuild,
    Done,
}

/// Particles accepted during sampling, before weighting.
struct Candidates {
    particles: Vec<Particle>,
    distances: Vec<Vec<Vec<f64>>>,
    trajectories: Vec<Vec<Mat<f64>>>,
    sampled: usize,
}

/// A draw from the prior predictive distribution.
#[derive(Debug, Clone)]
pub struct PriorSample {
    pub model: usize,
    pub parameters: Box<[f64]>,
    /// Fitted trajectory of every replicate.
    pub trajectories: Vec<Mat<f64>>,
}

/// Result of a complete run.
#[derive(Debug, Clone)]
pub struct AbcOutput {
    /// One report per generation.
    pub reports: Vec<GenerationReport>,
    /// The final population, the posterior approximation.
    pub population: Population,
}

pub struct AbcSmc {
    models: Vec<Model>,
    data: ObservedData,
    distance: Box<dyn Distance>,
    settings: AbcSettings,
    model_prior: Vec<f64>,
    kernel: KernelFamily,
}

impl std::fmt::Debug for AbcSmc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbcSmc")
            .field("models", &self.models)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AbcSmc {
    /// Set up an engine comparing with [`EuclideanDistance`].
    pub fn new(models: Vec<Model>, data: ObservedData, settings: AbcSettings) -> Result<Self> {
        if models.is_empty() {
            return Err(AbcError::InvalidConfig("no models given".to_string()));
        }
        let model_prior = settings.validate(models.len())?;
        let kernel = match settings.kernel {
            KernelFamily::NearestNeighbours { k: None } => KernelFamily::NearestNeighbours {
                k: Some((settings.nparticles / 4).max(1)),
            },
            family => family,
        };
        if kernel == KernelFamily::ComponentUniform {
            for model in models.iter().filter(|m| m.all_free_uniform()) {
                tracing::info!(
                    model = model.name(),
                    "all free priors are uniform, perturbing within the prior bounds"
                );
            }
        }
        Ok(Self {
            models,
            data,
            distance: Box::new(EuclideanDistance),
            settings,
            model_prior,
            kernel,
        })
    }

    pub fn with_distance(mut self, distance: impl Distance + 'static) -> Self {
        self.distance = Box::new(distance);
        self
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn data(&self) -> &ObservedData {
        &self.data
    }

    pub fn settings(&self) -> &AbcSettings {
        &self.settings
    }

    /// Normalized prior probability of every model.
    pub fn model_prior(&self) -> &[f64] {
        &self.model_prior
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.models, &self.data, self.distance.as_ref(), self.settings.beta)
            .parallel(self.settings.parallel)
            .keep_trajectories(self.settings.store_trajectories)
    }

    /// Simulate batches until `nparticles` proposals have been accepted at
    /// tolerance `epsilon`.
    fn sample_generation<R: Rng + ?Sized>(
        &self,
        previous: Option<&Population>,
        epsilon: &[f64],
        rng: &mut R,
    ) -> Result<Candidates> {
        let target = self.settings.nparticles;
        let dispatcher = self.dispatcher();
        let mut candidates = Candidates {
            particles: Vec::with_capacity(target),
            distances: Vec::with_capacity(target),
            trajectories: Vec::new(),
            sampled: 0,
        };

        while candidates.particles.len() < target {
            let batch = match previous {
                None => sample_from_prior(&self.models, &self.model_prior, self.settings.nbatch, rng),
                Some(previous) => sample_from_population(
                    &self.models,
                    previous,
                    self.settings.model_kernel,
                    self.settings.max_perturb_attempts,
                    self.settings.nbatch,
                    rng,
                )?,
            };
            let evaluations = dispatcher.dispatch(&batch, epsilon, false, rng)?;

            // Proposals after the quota fills are not counted as sampled.
            for (proposal, eval) in batch.into_iter().zip(evaluations) {
                if candidates.particles.len() >= target {
                    break;
                }
                candidates.sampled += 1;
                if eval.acceptances == 0 {
                    continue;
                }
                candidates.particles.push(Particle {
                    model: proposal.model,
                    parameters: proposal.parameters,
                    weight: 0.,
                    acceptances: eval.acceptances,
                });
                candidates.distances.push(eval.distances);
                if self.settings.store_trajectories {
                    candidates.trajectories.push(eval.trajectories);
                }
            }
            tracing::debug!(
                sampled = candidates.sampled,
                accepted = candidates.particles.len(),
                "batch finished"
            );
        }
        Ok(candidates)
    }

    /// Assign normalized importance weights to the candidates.
    fn weigh(&self, candidates: &mut Candidates, previous: Option<&Population>) -> Result<()> {
        let raw = compute_weights(
            &candidates.particles,
            &self.models,
            &self.model_prior,
            previous,
            self.settings.model_kernel,
        )?;
        let weights = normalize(&raw)?;
        for (particle, weight) in candidates.particles.iter_mut().zip(weights) {
            particle.weight = weight;
        }
        Ok(())
    }

    /// Compute marginals, dead models, kernels and auxiliary information of
    /// weighted particles.
    fn assemble(
        &self,
        generation: usize,
        epsilon: Vec<f64>,
        candidates: Candidates,
        previous: Option<&Population>,
    ) -> Population {
        let base: Vec<Kernel> = match previous {
            Some(prev) => prev.kernels.clone(),
            None => self.models.iter().map(Kernel::new).collect(),
        };
        let particles = &candidates.particles;
        let assignments: Vec<usize> = particles.iter().map(|p| p.model).collect();
        let parameters: Vec<&[f64]> = particles.iter().map(|p| &p.parameters[..]).collect();
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        let kernels = rebuild_kernels(
            &base,
            self.kernel,
            &self.models,
            &assignments,
            &parameters,
            &weights,
            previous.is_none(),
        );
        self.finish(generation, epsilon, candidates, kernels, previous)
    }

    fn finish(
        &self,
        generation: usize,
        epsilon: Vec<f64>,
        candidates: Candidates,
        kernels: Vec<Kernel>,
        previous: Option<&Population>,
    ) -> Population {
        let Candidates {
            particles,
            distances,
            trajectories,
            sampled,
        } = candidates;

        let marginals = model_marginals(&particles, self.models.len());
        let dead = dead_models(&marginals);
        for &m in dead.iter() {
            if previous.is_some_and(|prev| !prev.is_dead(m)) {
                tracing::warn!(
                    model = self.models[m].name(),
                    marginal = marginals[m],
                    generation,
                    "model died"
                );
            }
        }
        let aux = auxiliary_info(&kernels, &particles);

        Population {
            generation,
            epsilon,
            particles,
            marginals,
            dead_models: dead,
            kernels,
            aux,
            sampled,
            distances,
            trajectories,
        }
    }

    /// Run one full generation at tolerance `epsilon`.
    ///
    /// Without a previous population the proposals come from the priors.
    pub fn iterate_population<R: Rng + ?Sized>(
        &self,
        previous: Option<&Population>,
        epsilon: &[f64],
        rng: &mut R,
    ) -> Result<Population> {
        let mut candidates = self.sample_generation(previous, epsilon, rng)?;
        self.weigh(&mut candidates, previous)?;
        let generation = previous.map(|p| p.generation + 1).unwrap_or(0);
        Ok(self.assemble(generation, epsilon.to_vec(), candidates, previous))
    }

    /// Rebuild a population from a stored snapshot, as it was at the end of
    /// its generation.
    ///
    /// The stored kernels are reused as they are. A snapshot without kernels
    /// gets kernels fitted to its particles as in a first generation.
    /// Distances, trajectories and the number of sampled proposals are not
    /// part of a snapshot.
    pub fn restore(&self, snapshot: Snapshot) -> Result<Population> {
        let Snapshot {
            generation,
            epsilon,
            mut particles,
            kernels,
        } = snapshot;
        if particles.is_empty() {
            return Err(AbcError::DegeneratePopulation);
        }
        for (idx, particle) in particles.iter().enumerate() {
            let model = self.models.get(particle.model).ok_or_else(|| {
                AbcError::InvalidConfig(format!(
                    "particle {idx} refers to unknown model {}",
                    particle.model
                ))
            })?;
            model.check_parameters(particle.model, &particle.parameters)?;
            if joint_density(model.priors(), &particle.parameters) <= 0. {
                return Err(AbcError::InvalidConfig(format!(
                    "particle {idx} lies outside the prior support of model `{}`",
                    model.name()
                )));
            }
        }
        if !kernels.is_empty() {
            self.check_kernels(&kernels)?;
        }

        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        for (particle, weight) in particles.iter_mut().zip(normalize(&weights)?) {
            particle.weight = weight;
        }
        let candidates = Candidates {
            distances: vec![Vec::new(); particles.len()],
            particles,
            trajectories: Vec::new(),
            sampled: 0,
        };
        if kernels.is_empty() {
            Ok(self.assemble(generation, epsilon, candidates, None))
        } else {
            Ok(self.finish(generation, epsilon, candidates, kernels, None))
        }
    }

    fn check_kernels(&self, kernels: &[Kernel]) -> Result<()> {
        if kernels.len() != self.models.len() {
            return Err(AbcError::InvalidConfig(format!(
                "snapshot has {} kernels for {} models",
                kernels.len(),
                self.models.len()
            )));
        }
        for (kernel, model) in kernels.iter().zip(self.models.iter()) {
            if kernel.indices() != model.free_parameters().as_slice() {
                return Err(AbcError::InvalidConfig(format!(
                    "stored kernel of model `{}` perturbs parameters {:?}, expected {:?}",
                    model.name(),
                    kernel.indices(),
                    model.free_parameters()
                )));
            }
            let family_matches = match kernel.params() {
                KernelParams::Unfitted => true,
                KernelParams::Uniform { .. } | KernelParams::BoundedUniform { .. } => {
                    self.kernel == KernelFamily::ComponentUniform
                }
                KernelParams::Normal { .. } => self.kernel == KernelFamily::ComponentNormal,
                KernelParams::MultivariateNormal { .. } => {
                    self.kernel == KernelFamily::MultivariateNormal
                }
                KernelParams::NearestNeighbours { .. } => {
                    matches!(self.kernel, KernelFamily::NearestNeighbours { .. })
                }
            };
            if !family_matches {
                return Err(AbcError::InvalidConfig(format!(
                    "stored kernel of model `{}` does not belong to the {:?} family",
                    model.name(),
                    self.kernel
                )));
            }
        }
        Ok(())
    }

    /// Start a generation driver from the priors.
    pub fn generations(&self, schedule: Schedule) -> Result<Generations<'_>> {
        let scheduler = Scheduler::new(schedule, self.settings.adaptive)?;
        let epsilon = scheduler.first_epsilon();
        Ok(Generations {
            engine: self,
            scheduler,
            rng: ChaCha8Rng::seed_from_u64(self.settings.seed),
            current: None,
            epsilon: Some(epsilon),
            stage: Stage::Init,
        })
    }

    /// Start a generation driver that continues after `previous`.
    pub fn generations_from(
        &self,
        previous: Population,
        schedule: Schedule,
    ) -> Result<Generations<'_>> {
        let mut scheduler = Scheduler::new(schedule, self.settings.adaptive)?;
        let epsilon = scheduler.next_epsilon(&previous);
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        rng.set_stream(previous.generation as u64 + 1);
        Ok(Generations {
            engine: self,
            scheduler,
            rng,
            stage: if epsilon.is_some() {
                Stage::Sampling
            } else {
                Stage::Done
            },
            current: Some(previous),
            epsilon,
        })
    }

    /// Run the schedule from the priors, storing every generation.
    pub fn run<S: PopulationStorage + ?Sized>(
        &self,
        schedule: Schedule,
        storage: &mut S,
    ) -> anyhow::Result<AbcOutput> {
        let generations = self.generations(schedule)?;
        drive(generations, storage)
    }

    /// Continue the schedule after a restored population.
    pub fn run_from<S: PopulationStorage + ?Sized>(
        &self,
        previous: Population,
        schedule: Schedule,
        storage: &mut S,
    ) -> anyhow::Result<AbcOutput> {
        let generations = self.generations_from(previous, schedule)?;
        drive(generations, storage)
    }

    /// Draw `count` proposals from the priors and simulate them without
    /// comparing against the data.
    ///
    /// Proposals whose simulation failed are left out.
    pub fn simulate_prior(&self, count: usize) -> Result<Vec<PriorSample>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        let dispatcher = self.dispatcher().keep_trajectories(true);
        let mut samples = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let size = remaining.min(self.settings.nbatch);
            remaining -= size;
            let batch = sample_from_prior(&self.models, &self.model_prior, size, &mut rng);
            let evaluations = dispatcher.dispatch(&batch, &[], true, &mut rng)?;
            samples.extend(
                batch
                    .into_iter()
                    .zip(evaluations)
                    .filter(|(_, eval)| eval.acceptances > 0)
                    .map(|(proposal, eval)| PriorSample {
                        model: proposal.model,
                        parameters: proposal.parameters,
                        trajectories: eval.trajectories,
                    }),
            );
        }
        Ok(samples)
    }
}

fn drive<S: PopulationStorage + ?Sized>(
    mut generations: Generations<'_>,
    storage: &mut S,
) -> anyhow::Result<AbcOutput> {
    let mut reports = Vec::new();
    while let Some(population) = generations.step()? {
        let generation = population.generation;
        let report = population.report();
        storage
            .write_population_snapshot(generation, population)
            .with_context(|| format!("Failed to store population of generation {generation}"))?;
        storage
            .write_generation_report(generation, &report)
            .with_context(|| format!("Failed to store report of generation {generation}"))?;
        reports.push(report);
    }
    storage.flush().context("Failed to flush population storage")?;
    let population = match generations.into_population() {
        Some(population) if !reports.is_empty() => population,
        _ => anyhow::bail!("The schedule finished before any generation was run"),
    };
    Ok(AbcOutput {
        reports,
        population,
    })
}

/// Step-by-step driver of the generation loop.
///
/// Each call to [`Generations::step`] runs one generation through sampling,
/// weighting and kernel rebuilding, then asks the schedule for the next
/// tolerance.
pub struct Generations<'a> {
    engine: &'a AbcSmc,
    scheduler: Scheduler,
    rng: ChaCha8Rng,
    current: Option<Population>,
    epsilon: Option<Vec<f64>>,
    stage: Stage,
}

impl Generations<'_> {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The most recent finished population.
    pub fn current(&self) -> Option<&Population> {
        self.current.as_ref()
    }

    /// Tolerance of the next generation.
    pub fn next_epsilon(&self) -> Option<&[f64]> {
        self.epsilon.as_deref()
    }

    pub fn into_population(self) -> Option<Population> {
        self.current
    }

    /// Run the next generation. Returns `None` once the schedule is done.
    pub fn step(&mut self) -> Result<Option<&Population>> {
        let Some(epsilon) = self.epsilon.take() else {
            self.stage = Stage::Done;
            return Ok(None);
        };
        let engine = self.engine;
        let previous = self.current.as_ref();

        self.stage = Stage::Sampling;
        let mut candidates = engine.sample_generation(previous, &epsilon, &mut self.rng)?;

        self.stage = Stage::Weighting;
        engine.weigh(&mut candidates, previous)?;

        self.stage = Stage::KernelRebuild;
        let generation = previous.map(|p| p.generation + 1).unwrap_or(0);
        let population = engine.assemble(generation, epsilon, candidates, previous);

        self.epsilon = self.scheduler.next_epsilon(&population);
        tracing::info!(
            generation,
            sampled = population.sampled,
            accepted = population.len(),
            acceptance_rate = population.acceptance_rate(),
            marginals = ?population.marginals,
            epsilon = ?population.epsilon,
            next_epsilon = ?self.epsilon,
            "finished generation"
        );
        self.stage = if self.epsilon.is_some() {
            Stage::Sampling
        } else {
            Stage::Done
        };
        self.current = Some(population);
        Ok(self.current.as_ref())
    }
}
