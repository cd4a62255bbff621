//! Prior distributions over model parameters.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{AbcError, Result};

/// Prior distribution of a single model parameter.
///
/// Normal and log-normal priors are parametrised by their variance, the
/// log-normal one by mean and variance of the logarithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Constant(f64),
    Normal { mean: f64, variance: f64 },
    Uniform { low: f64, high: f64 },
    LogNormal { mean: f64, variance: f64 },
}

impl Prior {
    /// Build a prior from the numeric distribution codes used by model
    /// definition files: 0 constant, 1 normal, 2 uniform, 3 log-normal.
    ///
    /// The second argument is ignored for constants.
    pub fn from_code(code: i32, first: f64, second: f64) -> Result<Self> {
        let prior = match code {
            0 => Prior::Constant(first),
            1 => Prior::Normal {
                mean: first,
                variance: second,
            },
            2 => Prior::Uniform {
                low: first,
                high: second,
            },
            3 => Prior::LogNormal {
                mean: first,
                variance: second,
            },
            other => return Err(AbcError::UnknownPrior(other)),
        };
        prior.validate()?;
        Ok(prior)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Prior::Constant(value) if !value.is_finite() => Err(AbcError::InvalidPrior(format!(
                "constant value {value} is not finite"
            ))),
            Prior::Normal { mean, variance } | Prior::LogNormal { mean, variance }
                if !(mean.is_finite() && variance.is_finite() && variance > 0.) =>
            {
                Err(AbcError::InvalidPrior(format!(
                    "{:?} needs a finite mean and a positive variance",
                    self
                )))
            }
            Prior::Uniform { low, high } if !(low.is_finite() && high.is_finite() && low < high) => {
                Err(AbcError::InvalidPrior(format!(
                    "uniform bounds [{low}, {high}] are empty or not finite"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Prior::Constant(_))
    }

    /// The support bounds of a uniform prior.
    pub fn uniform_bounds(&self) -> Option<(f64, f64)> {
        match *self {
            Prior::Uniform { low, high } => Some((low, high)),
            _ => None,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Constant(value) => value,
            Prior::Normal { mean, variance } => {
                let z: f64 = rng.sample(StandardNormal);
                mean + variance.sqrt() * z
            }
            Prior::Uniform { low, high } => low + (high - low) * rng.random::<f64>(),
            Prior::LogNormal { mean, variance } => {
                let z: f64 = rng.sample(StandardNormal);
                (mean + variance.sqrt() * z).exp()
            }
        }
    }

    /// Density of the prior at `value`.
    ///
    /// A constant prior has density one at its value and zero elsewhere.
    pub fn density(&self, value: f64) -> f64 {
        match *self {
            Prior::Constant(fixed) => {
                if value == fixed {
                    1.
                } else {
                    0.
                }
            }
            Prior::Normal { mean, variance } => normal_pdf(value, mean, variance),
            Prior::Uniform { low, high } => {
                if (low..=high).contains(&value) {
                    (high - low).recip()
                } else {
                    0.
                }
            }
            Prior::LogNormal { mean, variance } => {
                if value > 0. {
                    normal_pdf(value.ln(), mean, variance) / value
                } else {
                    0.
                }
            }
        }
    }
}

pub(crate) fn normal_pdf(value: f64, mean: f64, variance: f64) -> f64 {
    let diff = value - mean;
    (-diff * diff / (2. * variance)).exp() / (2. * PI * variance).sqrt()
}

/// Sample a full parameter vector from independent priors.
pub fn sample_parameters<R: Rng + ?Sized>(priors: &[Prior], rng: &mut R) -> Box<[f64]> {
    priors.iter().map(|prior| prior.sample(rng)).collect()
}

/// Joint density of independent priors.
pub fn joint_density(priors: &[Prior], parameters: &[f64]) -> f64 {
    priors
        .iter()
        .zip(parameters)
        .map(|(prior, &value)| prior.density(value))
        .product()
}
