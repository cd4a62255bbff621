//! Per-model perturbation kernels.
//!
//! A kernel is fitted to the particles of one model at the end of every
//! generation and is then used by the next generation twice: to perturb
//! resampled particles into new proposals and to evaluate the transition
//! density in the importance weights. Kernels only act on the free
//! (non-constant) parameters of a model.

mod neighbours;

use faer::Scale;
use rand::Rng;

use crate::{
    error::{AbcError, Result},
    math::{weighted_covariance, Gaussian, MIN_SCALE},
    model::Model,
    prior::{joint_density, normal_pdf, Prior},
};

pub use neighbours::{auxiliary_info, KernelAux};

/// A kernel is only refitted after the first generation if at least this many
/// particles of its model survived.
pub const MIN_REBUILD_PARTICLES: usize = 6;

/// Which proposal kernel to fit for each model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelFamily {
    /// Independent uniform windows spanning the population range of each
    /// parameter. If every free prior of a model is uniform the windows are
    /// truncated to the prior support.
    #[default]
    ComponentUniform,
    /// Independent normals with twice the weighted population variance.
    ComponentNormal,
    /// Multivariate normal with twice the weighted population covariance.
    MultivariateNormal,
    /// Multivariate normal around each particle with the covariance of its
    /// `k` nearest neighbours. `None` uses a quarter of the population size.
    NearestNeighbours { k: Option<usize> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelParams {
    /// No population has been seen yet.
    Unfitted,
    Uniform {
        windows: Vec<(f64, f64)>,
    },
    /// Uniform windows clipped to uniform prior bounds.
    BoundedUniform {
        windows: Vec<(f64, f64)>,
        bounds: Vec<(f64, f64)>,
    },
    Normal {
        std_devs: Vec<f64>,
    },
    MultivariateNormal {
        gaussian: Gaussian,
    },
    NearestNeighbours {
        k: usize,
        support: Vec<Vec<f64>>,
        weights: Vec<f64>,
        fallback: Gaussian,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    indices: Box<[usize]>,
    params: KernelParams,
}

impl Kernel {
    pub fn new(model: &Model) -> Self {
        Self {
            indices: model.free_parameters().into(),
            params: KernelParams::Unfitted,
        }
    }

    /// Reassemble a stored kernel.
    pub(crate) fn from_parts(indices: Vec<usize>, params: KernelParams) -> Self {
        Self {
            indices: indices.into(),
            params,
        }
    }

    /// Indices of the parameters this kernel perturbs.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        !matches!(self.params, KernelParams::Unfitted)
    }

    /// True for the truncated uniform kernel used when all free priors are
    /// uniform.
    pub fn is_bounded_uniform(&self) -> bool {
        matches!(self.params, KernelParams::BoundedUniform { .. })
    }

    fn free_values(&self, parameters: &[f64]) -> Vec<f64> {
        self.indices.iter().map(|&i| parameters[i]).collect()
    }

    /// Fit a new kernel to the particles of one model.
    ///
    /// Except for the first generation, a model with fewer than
    /// [`MIN_REBUILD_PARTICLES`] particles keeps its previous kernel. An empty
    /// population always keeps it.
    pub fn rebuild(
        &self,
        family: KernelFamily,
        model: &Model,
        population: &[&[f64]],
        weights: &[f64],
        first_generation: bool,
    ) -> Self {
        if population.is_empty()
            || (!first_generation && population.len() < MIN_REBUILD_PARTICLES)
        {
            tracing::debug!(
                model = model.name(),
                particles = population.len(),
                "keeping previous kernel"
            );
            return self.clone();
        }

        let points: Vec<Vec<f64>> = population.iter().map(|p| self.free_values(p)).collect();
        let dim = self.indices.len();

        let params = match family {
            KernelFamily::ComponentUniform => {
                let windows = (0..dim)
                    .map(|d| {
                        let (lo, hi) = points.iter().fold(
                            (f64::INFINITY, f64::NEG_INFINITY),
                            |(lo, hi), p| (lo.min(p[d]), hi.max(p[d])),
                        );
                        let scale = hi - lo;
                        (-scale / 2., scale / 2.)
                    })
                    .collect();
                if model.all_free_uniform() {
                    let bounds = self
                        .indices
                        .iter()
                        .filter_map(|&i| model.priors()[i].uniform_bounds())
                        .collect();
                    KernelParams::BoundedUniform { windows, bounds }
                } else {
                    KernelParams::Uniform { windows }
                }
            }
            KernelFamily::ComponentNormal => {
                let (_, cov) = weighted_covariance(&points, weights);
                let std_devs = (0..dim)
                    .map(|d| (2. * cov[(d, d)]).max(MIN_SCALE).sqrt())
                    .collect();
                KernelParams::Normal { std_devs }
            }
            KernelFamily::MultivariateNormal => {
                let (_, mut cov) = weighted_covariance(&points, weights);
                cov *= Scale(2.);
                let gaussian = Gaussian::from_covariance(&cov);
                KernelParams::MultivariateNormal { gaussian }
            }
            KernelFamily::NearestNeighbours { k } => {
                let (_, mut cov) = weighted_covariance(&points, weights);
                cov *= Scale(2.);
                let fallback = Gaussian::from_covariance(&cov);
                let k = k.unwrap_or(points.len() / 4).clamp(1, points.len());
                let total: f64 = weights.iter().sum();
                KernelParams::NearestNeighbours {
                    k,
                    weights: weights.iter().map(|w| w / total).collect(),
                    support: points,
                    fallback,
                }
            }
        };

        Self {
            indices: self.indices.clone(),
            params,
        }
    }

    /// Transition density of moving from `old` to `new` under this kernel.
    ///
    /// `aux` is the auxiliary information computed for the particle `old`
    /// belongs to. An unfitted kernel has density zero everywhere.
    pub fn density(&self, new: &[f64], old: &[f64], aux: &KernelAux) -> f64 {
        match &self.params {
            KernelParams::Unfitted => 0.,
            KernelParams::Uniform { windows } => self
                .indices
                .iter()
                .zip(windows)
                .map(|(&i, &(lo, hi))| {
                    window_density(new[i], old[i] + lo, old[i] + hi)
                })
                .product(),
            KernelParams::BoundedUniform { windows, bounds } => self
                .indices
                .iter()
                .zip(windows.iter().zip(bounds))
                .map(|(&i, (&(lo, hi), &(b_lo, b_hi)))| {
                    window_density(new[i], (old[i] + lo).max(b_lo), (old[i] + hi).min(b_hi))
                })
                .product(),
            KernelParams::Normal { std_devs } => self
                .indices
                .iter()
                .zip(std_devs)
                .map(|(&i, &sd)| normal_pdf(new[i], old[i], sd * sd))
                .product(),
            KernelParams::MultivariateNormal { gaussian } => {
                gaussian.density(&self.free_values(new), &self.free_values(old))
            }
            KernelParams::NearestNeighbours { fallback, .. } => {
                let gaussian = match aux {
                    KernelAux::Neighbourhood { local, .. } => local,
                    KernelAux::None => fallback,
                };
                gaussian.density(&self.free_values(new), &self.free_values(old))
            }
        }
    }

    /// Perturb `parameters` in place and return the joint prior density of
    /// the result, so callers can reject proposals outside the prior support.
    pub fn perturb<R: Rng + ?Sized>(
        &self,
        model: usize,
        parameters: &mut [f64],
        priors: &[Prior],
        aux: &KernelAux,
        rng: &mut R,
    ) -> Result<f64> {
        match &self.params {
            KernelParams::Unfitted => return Err(AbcError::KernelNotFitted(model)),
            KernelParams::Uniform { windows } => {
                for (&i, &(lo, hi)) in self.indices.iter().zip(windows) {
                    parameters[i] += uniform_in(lo, hi, rng);
                }
            }
            KernelParams::BoundedUniform { windows, bounds } => {
                for (&i, (&(lo, hi), &(b_lo, b_hi))) in
                    self.indices.iter().zip(windows.iter().zip(bounds))
                {
                    let lower = (parameters[i] + lo).max(b_lo);
                    let upper = (parameters[i] + hi).min(b_hi);
                    parameters[i] = uniform_in(lower, upper, rng);
                }
            }
            KernelParams::Normal { std_devs } => {
                for (&i, &sd) in self.indices.iter().zip(std_devs) {
                    let z: f64 = rng.sample(rand_distr::StandardNormal);
                    parameters[i] += sd * z;
                }
            }
            KernelParams::MultivariateNormal { gaussian } => {
                self.perturb_gaussian(gaussian, parameters, rng);
            }
            KernelParams::NearestNeighbours { fallback, .. } => {
                let gaussian = match aux {
                    KernelAux::Neighbourhood { local, .. } => local,
                    KernelAux::None => fallback,
                };
                self.perturb_gaussian(gaussian, parameters, rng);
            }
        }
        Ok(joint_density(priors, parameters))
    }

    fn perturb_gaussian<R: Rng + ?Sized>(
        &self,
        gaussian: &Gaussian,
        parameters: &mut [f64],
        rng: &mut R,
    ) {
        let mean = self.free_values(parameters);
        let mut out = vec![0f64; mean.len()];
        gaussian.sample(&mean, rng, &mut out);
        for (&i, val) in self.indices.iter().zip(out) {
            parameters[i] = val;
        }
    }
}

/// Draw from `[low, high)`; a collapsed window returns its lower end.
fn uniform_in<R: Rng + ?Sized>(low: f64, high: f64, rng: &mut R) -> f64 {
    if high > low {
        low + (high - low) * rng.random::<f64>()
    } else {
        low
    }
}

fn window_density(value: f64, low: f64, high: f64) -> f64 {
    if (low..=high).contains(&value) {
        (high - low).max(MIN_SCALE).recip()
    } else {
        0.
    }
}

/// Refit the kernel of every model to its particles in a new population.
pub fn rebuild_kernels(
    kernels: &[Kernel],
    family: KernelFamily,
    models: &[Model],
    assignments: &[usize],
    parameters: &[&[f64]],
    weights: &[f64],
    first_generation: bool,
) -> Vec<Kernel> {
    kernels
        .iter()
        .zip(models)
        .enumerate()
        .map(|(m, (kernel, model))| {
            let (points, model_weights): (Vec<&[f64]>, Vec<f64>) = assignments
                .iter()
                .zip(parameters.iter().zip(weights))
                .filter(|(&assigned, _)| assigned == m)
                .map(|(_, (&p, &w))| (p, w))
                .unzip();
            kernel.rebuild(family, model, &points, &model_weights, first_generation)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::model::test_models::mean_model;

    fn uniform_model() -> Model {
        mean_model(
            "uniform",
            vec![
                Prior::Uniform { low: 0., high: 1. },
                Prior::Constant(3.),
                Prior::Uniform { low: -1., high: 1. },
            ],
        )
    }

    fn normal_model() -> Model {
        mean_model(
            "normal",
            vec![
                Prior::Normal {
                    mean: 0.,
                    variance: 1.,
                },
                Prior::Uniform { low: -5., high: 5. },
            ],
        )
    }

    fn population(rng: &mut StdRng, n: usize, model: &Model) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                model
                    .priors()
                    .iter()
                    .map(|p| p.sample(&mut *rng))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn uniform_special_case_is_detected() {
        let model = uniform_model();
        let points = vec![vec![0.2, 3., 0.], vec![0.6, 3., 0.5], vec![0.4, 3., -0.5]];
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let kernel = Kernel::new(&model).rebuild(
            KernelFamily::ComponentUniform,
            &model,
            &refs,
            &[1., 1., 1.],
            true,
        );
        assert_eq!(kernel.indices(), &[0, 2]);
        assert!(kernel.is_bounded_uniform());
        match kernel.params() {
            KernelParams::BoundedUniform { windows, bounds } => {
                assert_relative_eq!(windows[0].1, 0.2, epsilon = 1e-12);
                assert_relative_eq!(windows[1].0, -0.5, epsilon = 1e-12);
                assert_eq!(bounds, &vec![(0., 1.), (-1., 1.)]);
            }
            other => panic!("unexpected kernel {other:?}"),
        }

        let normal = normal_model();
        let kernel = Kernel::new(&normal).rebuild(
            KernelFamily::ComponentUniform,
            &normal,
            &[[0., 0.].as_slice(), [1., 1.].as_slice()],
            &[1., 1.],
            true,
        );
        assert!(!kernel.is_bounded_uniform());
    }

    #[test]
    fn small_populations_keep_previous_kernel() {
        let model = normal_model();
        let mut rng = StdRng::seed_from_u64(5);
        let points = population(&mut rng, 50, &model);
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let weights = vec![1.; refs.len()];
        let first = Kernel::new(&model).rebuild(
            KernelFamily::ComponentNormal,
            &model,
            &refs,
            &weights,
            true,
        );
        let kept = first.rebuild(
            KernelFamily::ComponentNormal,
            &model,
            &refs[..5],
            &weights[..5],
            false,
        );
        let new = [0.3, -0.2];
        let old = [0.1, 0.4];
        assert_eq!(
            first.density(&new, &old, &KernelAux::None),
            kept.density(&new, &old, &KernelAux::None)
        );
        let refit = first.rebuild(
            KernelFamily::ComponentNormal,
            &model,
            &refs[..6],
            &weights[..6],
            false,
        );
        assert!(
            first.density(&new, &old, &KernelAux::None)
                != refit.density(&new, &old, &KernelAux::None)
        );
    }

    #[test]
    fn rebuild_is_idempotent() {
        let model = normal_model();
        let mut rng = StdRng::seed_from_u64(9);
        let points = population(&mut rng, 40, &model);
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let weights: Vec<f64> = (0..refs.len()).map(|i| 1. + i as f64).collect();
        for family in [
            KernelFamily::ComponentUniform,
            KernelFamily::ComponentNormal,
            KernelFamily::MultivariateNormal,
            KernelFamily::NearestNeighbours { k: Some(8) },
        ] {
            let base = Kernel::new(&model);
            let a = base.rebuild(family, &model, &refs, &weights, true);
            let b = base.rebuild(family, &model, &refs, &weights, true);
            let new = [0.25, 1.5];
            let old = [0.2, 1.0];
            assert_eq!(
                a.density(&new, &old, &KernelAux::None),
                b.density(&new, &old, &KernelAux::None)
            );
        }
    }

    #[test]
    fn bounded_uniform_density_integrates_to_one() {
        let model = mean_model("u", vec![Prior::Uniform { low: 0., high: 1. }]);
        let kernel = Kernel::new(&model).rebuild(
            KernelFamily::ComponentUniform,
            &model,
            &[[0.1].as_slice(), [0.7].as_slice()],
            &[1., 1.],
            true,
        );
        // window is +-0.3, old value near the lower prior bound
        let old = [0.05];
        let n = 100_000;
        let step = 1. / n as f64;
        let integral: f64 = (0..n)
            .map(|i| kernel.density(&[(i as f64 + 0.5) * step], &old, &KernelAux::None) * step)
            .sum();
        assert_relative_eq!(integral, 1., epsilon = 1e-3);
    }

    #[test]
    fn bounded_uniform_stays_in_prior() {
        let model = uniform_model();
        let points = vec![vec![0., 3., -1.], vec![1., 3., 1.]];
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let kernel = Kernel::new(&model).rebuild(
            KernelFamily::ComponentUniform,
            &model,
            &refs,
            &[1., 1.],
            true,
        );
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let mut params = [0.95, 3., -0.9];
            let density = kernel
                .perturb(0, &mut params, model.priors(), &KernelAux::None, &mut rng)
                .unwrap();
            assert!(density > 0.);
            assert_eq!(params[1], 3.);
            assert!(kernel.density(&params, &[0.95, 3., -0.9], &KernelAux::None) > 0.);
        }
    }

    #[test]
    fn zero_width_kernel_reproduces_particle() {
        let model = uniform_model();
        let points = vec![vec![0.4, 3., 0.1]; 8];
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let kernel = Kernel::new(&model).rebuild(
            KernelFamily::ComponentUniform,
            &model,
            &refs,
            &[1.; 8],
            true,
        );
        let mut rng = StdRng::seed_from_u64(2);
        let mut params = [0.4, 3., 0.1];
        kernel
            .perturb(0, &mut params, model.priors(), &KernelAux::None, &mut rng)
            .unwrap();
        assert_eq!(params, [0.4, 3., 0.1]);
    }

    #[test]
    fn unfitted_kernel_cannot_perturb() {
        let model = normal_model();
        let kernel = Kernel::new(&model);
        let mut rng = StdRng::seed_from_u64(2);
        let mut params = [0., 0.];
        assert!(matches!(
            kernel.perturb(3, &mut params, model.priors(), &KernelAux::None, &mut rng),
            Err(AbcError::KernelNotFitted(3))
        ));
        assert_eq!(kernel.density(&params, &params, &KernelAux::None), 0.);
    }

    #[test]
    fn perturbation_returns_prior_density() {
        let model = normal_model();
        let mut rng = StdRng::seed_from_u64(11);
        let points = population(&mut rng, 30, &model);
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let kernel = Kernel::new(&model).rebuild(
            KernelFamily::MultivariateNormal,
            &model,
            &refs,
            &[1.; 30],
            true,
        );
        let mut params = [0.1, 0.2];
        let density = kernel
            .perturb(0, &mut params, model.priors(), &KernelAux::None, &mut rng)
            .unwrap();
        assert_relative_eq!(density, joint_density(model.priors(), &params));
    }
}
