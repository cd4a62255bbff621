//! Approximate Bayesian computation with sequential Monte Carlo (ABC-SMC).
//!
//! Infers posterior distributions over the parameters of one or more
//! competing models, and over the models themselves, by simulating
//! trajectories and keeping parameter draws whose simulations come close to
//! observed time series. Each generation resamples and perturbs the previous
//! population and reweights it by importance sampling, under a tolerance
//! that shrinks from generation to generation.
//!
//! ```no_run
//! use abc_smc::{AbcSettings, AbcSmc, Fit, Model, ObservedData, Prior, Schedule, Trajectories};
//! use rand::RngCore;
//!
//! # fn main() -> anyhow::Result<()> {
//! let model = Model::new(
//!     "mean",
//!     vec![Prior::Uniform { low: 0., high: 1. }; 2],
//!     Fit::Identity,
//!     |params: &[&[f64]], times: &[f64], reps: usize, _rng: &mut dyn RngCore| -> anyhow::Result<Trajectories> {
//!         Ok(Trajectories::from_fn(params.len(), reps, times.len(), 1, |p, _, _, _| {
//!             (params[p][0] + params[p][1]) / 2.
//!         }))
//!     },
//! )?;
//! let data = ObservedData::from_rows(vec![1.], &[vec![0.5]])?;
//! let settings = AbcSettings {
//!     nparticles: 200,
//!     nbatch: 50,
//!     ..Default::default()
//! };
//! let smc = AbcSmc::new(vec![model], data, settings)?;
//! let output = smc.run(Schedule::Fixed(vec![vec![0.5], vec![0.2], vec![0.05]]), &mut ())?;
//! println!("{:?}", output.population.marginals);
//! # Ok(())
//! # }
//! ```

pub(crate) mod data;
pub(crate) mod dispatch;
pub(crate) mod distance;
pub(crate) mod error;
pub(crate) mod fit;
pub(crate) mod kernel;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod model_kernel;
pub(crate) mod population;
pub(crate) mod prior;
pub(crate) mod sampler;
pub(crate) mod schedule;
pub(crate) mod smc;
pub(crate) mod storage;
pub(crate) mod weights;

pub use data::{ObservedData, Trajectories};
pub use dispatch::{evaluate_distance, Dispatcher, Evaluation};
pub use distance::{Distance, EuclideanDistance, SeriesEuclideanDistance};
pub use error::{AbcError, Result};
pub use fit::{Fit, FitExpression};
pub use kernel::{
    auxiliary_info, rebuild_kernels, Kernel, KernelAux, KernelFamily, KernelParams,
    MIN_REBUILD_PARTICLES,
};
pub use math::Gaussian;
pub use model::{Model, Simulator};
pub use model_kernel::{jump_density, sample_jump};
pub use population::{GenerationReport, Particle, Population, Snapshot};
pub use prior::{joint_density, sample_parameters, Prior};
pub use sampler::{sample_from_population, sample_from_prior, sample_particle_from_model, Proposal};
pub use schedule::{AdaptiveOptions, Schedule, Scheduler};
pub use smc::{AbcOutput, AbcSettings, AbcSmc, Generations, PriorSample, Stage};
pub use storage::{read_population_snapshot, CsvStorage, MemoryStorage, PopulationStorage};
pub use weights::{compute_weights, dead_models, model_marginals, normalize, DEAD_MODEL_THRESHOLD};
