use std::f64::consts::PI;

use faer::{linalg::triangular_solve::solve_lower_triangular_in_place, Col, Mat, Par, Side};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

/// Smallest variance or window width used when a population has collapsed
/// onto a single value in some direction.
pub(crate) const MIN_SCALE: f64 = 1e-12;

pub(crate) fn normalized(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total > 0. && total.is_finite() {
        weights.iter().map(|w| w / total).collect()
    } else {
        vec![(weights.len() as f64).recip(); weights.len()]
    }
}

/// Weighted mean and unbiased weighted covariance (reliability weights) of
/// the rows in `points`.
pub(crate) fn weighted_covariance(points: &[Vec<f64>], weights: &[f64]) -> (Vec<f64>, Mat<f64>) {
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    let weights = normalized(weights);

    let mut mean = vec![0f64; dim];
    for (point, &w) in points.iter().zip(weights.iter()) {
        izip!(mean.iter_mut(), point.iter()).for_each(|(m, &x)| *m += w * x);
    }

    let mut cov = Mat::<f64>::zeros(dim, dim);
    for (point, &w) in points.iter().zip(weights.iter()) {
        for i in 0..dim {
            let di = point[i] - mean[i];
            for j in 0..=i {
                cov[(i, j)] += w * di * (point[j] - mean[j]);
            }
        }
    }

    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    let denom = if 1. - sum_sq > 0. { 1. - sum_sq } else { 1. };
    for i in 0..dim {
        for j in 0..=i {
            let val = cov[(i, j)] / denom;
            cov[(i, j)] = val;
            cov[(j, i)] = val;
        }
    }
    (mean, cov)
}

/// Multivariate normal with a fixed covariance, evaluated around arbitrary
/// means.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    factor: Mat<f64>,
    log_norm: f64,
}

impl Gaussian {
    /// Factorize `cov`; if it is not positive definite, fall back to its
    /// diagonal.
    pub fn from_covariance(cov: &Mat<f64>) -> Self {
        let finite = (0..cov.nrows()).all(|i| (0..cov.ncols()).all(|j| cov[(i, j)].is_finite()));
        if finite {
            if let Ok(llt) = cov.llt(Side::Lower) {
                let lower = llt.L();
                let factor = Mat::from_fn(lower.nrows(), lower.ncols(), |i, j| {
                    if j <= i {
                        lower[(i, j)]
                    } else {
                        0.
                    }
                });
                if (0..factor.nrows()).all(|i| factor[(i, i)] > MIN_SCALE.sqrt()) {
                    return Self::from_factor(factor);
                }
            }
        }
        tracing::warn!(
            dim = cov.nrows(),
            "covariance is not positive definite, using its diagonal"
        );
        let variances = (0..cov.nrows()).map(|i| cov[(i, i)]).collect::<Vec<_>>();
        Self::diagonal(&variances)
    }

    pub fn diagonal(variances: &[f64]) -> Self {
        let dim = variances.len();
        let factor = Mat::from_fn(dim, dim, |i, j| {
            if i == j {
                let var = variances[i];
                let var = if var.is_finite() { var.max(MIN_SCALE) } else { MIN_SCALE };
                var.sqrt()
            } else {
                0.
            }
        });
        Self::from_factor(factor)
    }

    /// Build from a lower triangular Cholesky factor.
    pub(crate) fn from_factor(factor: Mat<f64>) -> Self {
        let dim = factor.nrows();
        let log_det_sqrt: f64 = (0..dim).map(|i| factor[(i, i)].ln()).sum();
        let log_norm = -0.5 * dim as f64 * (2. * PI).ln() - log_det_sqrt;
        Self { factor, log_norm }
    }

    /// Lower triangular factor `L` with `L Lᵀ` the covariance.
    pub fn factor(&self) -> &Mat<f64> {
        &self.factor
    }

    pub fn dim(&self) -> usize {
        self.factor.nrows()
    }

    pub fn covariance(&self) -> Mat<f64> {
        let dim = self.dim();
        Mat::from_fn(dim, dim, |i, j| {
            (0..=i.min(j))
                .map(|k| self.factor[(i, k)] * self.factor[(j, k)])
                .sum()
        })
    }

    pub fn log_density(&self, x: &[f64], mean: &[f64]) -> f64 {
        let mut z = Col::from_fn(self.dim(), |i| x[i] - mean[i]);
        solve_lower_triangular_in_place(self.factor.as_ref(), z.as_mat_mut(), Par::Seq);
        self.log_norm - 0.5 * z.squared_norm_l2()
    }

    pub fn density(&self, x: &[f64], mean: &[f64]) -> f64 {
        self.log_density(x, mean).exp()
    }

    /// Write `mean + L z` with standard normal `z` into `out`.
    pub fn sample<R: Rng + ?Sized>(&self, mean: &[f64], rng: &mut R, out: &mut [f64]) {
        let z: Col<f64> = Col::from_fn(self.dim(), |_| rng.sample(StandardNormal));
        let draw = &self.factor * &z;
        for (i, val) in out.iter_mut().enumerate() {
            *val = mean[i] + draw[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::prior::normal_pdf;

    #[test]
    fn univariate_density() {
        let gauss = Gaussian::diagonal(&[2.5]);
        assert_relative_eq!(gauss.density(&[1.3], &[0.2]), normal_pdf(1.3, 0.2, 2.5), epsilon = 1e-14);
    }

    #[test]
    fn bivariate_density() {
        let cov = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 0.5 });
        let gauss = Gaussian::from_covariance(&cov);
        // det = 0.75, inverse = [[4/3, -2/3], [-2/3, 4/3]]
        let x = [1., -1.];
        let quad: f64 = 4. / 3. + 4. / 3. + 2. * 2. / 3.;
        let expected = (-0.5 * quad).exp() / (2. * PI * 0.75f64.sqrt());
        assert_relative_eq!(gauss.density(&x, &[0., 0.]), expected, epsilon = 1e-12);

        let back = gauss.covariance();
        assert_relative_eq!(back[(1, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(back[(1, 1)], 1., epsilon = 1e-12);
    }

    #[test]
    fn singular_covariance_falls_back_to_diagonal() {
        let cov = Mat::from_fn(2, 2, |_, _| 1.);
        let gauss = Gaussian::from_covariance(&cov);
        let density = gauss.density(&[0.5, 0.5], &[0., 0.]);
        assert!(density.is_finite() && density > 0.);
    }

    #[test]
    fn weighted_moments() {
        let points = vec![vec![0., 0.], vec![2., 2.], vec![4., 0.]];
        let (mean, cov) = weighted_covariance(&points, &[1., 1., 2.]);
        assert_relative_eq!(mean[0], 2.5);
        assert_relative_eq!(mean[1], 0.5);
        // sum w^2 = 0.375
        let var_x = (0.25 * 6.25 + 0.25 * 0.25 + 0.5 * 2.25) / 0.625;
        assert_relative_eq!(cov[(0, 0)], var_x, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], cov[(1, 0)]);
    }

    #[test]
    fn samples_have_requested_covariance() {
        let cov = Mat::from_fn(2, 2, |i, j| if i == j { 2. } else { -0.6 });
        let gauss = Gaussian::from_covariance(&cov);
        let mut rng = StdRng::seed_from_u64(3);
        let mut out = [0f64; 2];
        let draws: Vec<Vec<f64>> = (0..20_000)
            .map(|_| {
                gauss.sample(&[1., -1.], &mut rng, &mut out);
                out.to_vec()
            })
            .collect();
        let (mean, est) = weighted_covariance(&draws, &vec![1.; draws.len()]);
        assert_relative_eq!(mean[0], 1., epsilon = 0.05);
        assert_relative_eq!(est[(0, 0)], 2., epsilon = 0.1);
        assert_relative_eq!(est[(1, 0)], -0.6, epsilon = 0.1);
    }
}
