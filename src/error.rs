use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbcError {
    #[error("unknown prior distribution code {0} (expected 0=constant, 1=normal, 2=uniform or 3=log-normal)")]
    UnknownPrior(i32),
    #[error("invalid prior: {0}")]
    InvalidPrior(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("model {model} expects {expected} parameters but got {found}")]
    ParameterCount {
        model: usize,
        expected: usize,
        found: usize,
    },
    #[error("could not parse fit expression `{expression}`: {message}")]
    FitExpression { expression: String, message: String },
    #[error(
        "no perturbation with positive prior density found for model {model} after {attempts} attempts; the kernel and the priors do not overlap"
    )]
    KernelPriorMismatch { model: usize, attempts: usize },
    #[error("the perturbation kernel of model {0} has not been fitted to a population")]
    KernelNotFitted(usize),
    #[error("distance function returned {found} components but the tolerance has {expected}")]
    DistanceDimension { expected: usize, found: usize },
    #[error("particle {particle} of model {model} could not have been proposed from the previous population")]
    ZeroProposalDensity { particle: usize, model: usize },
    #[error("all particle weights are zero or non-finite")]
    DegeneratePopulation,
}

pub type Result<T> = std::result::Result<T, AbcError>;
