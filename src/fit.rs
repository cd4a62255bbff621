//! Map simulated state trajectories onto the observed series.
//!
//! A fit is applied to each (timepoint × state) matrix returned by a
//! simulator and produces a (timepoint × series) matrix that can be compared
//! against observed data. Expressions refer to state columns as `species1`,
//! `species2`, ... (1-based) and are evaluated with a plain arithmetic
//! evaluator; nothing is ever executed.

use std::{fmt::Debug, str::FromStr, sync::Arc};

use faer::Mat;
use meval::{tokenizer::Token, Context, ContextProvider, Expr};

use crate::error::{AbcError, Result};

const SPECIES_PREFIX: &str = "species";

#[derive(Clone, Debug)]
pub struct FitExpression {
    source: String,
    expr: Expr,
    /// Number of state columns the expression needs.
    states: usize,
}

impl FitExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Highest 1-based `speciesN` index the expression refers to.
    pub fn required_states(&self) -> usize {
        self.states
    }

    fn error(&self, message: String) -> AbcError {
        AbcError::FitExpression {
            expression: self.source.clone(),
            message,
        }
    }
}

impl FromStr for FitExpression {
    type Err = AbcError;

    fn from_str(source: &str) -> Result<Self> {
        let invalid = |message: String| AbcError::FitExpression {
            expression: source.to_string(),
            message,
        };
        let expr = Expr::from_str(source).map_err(|err| invalid(err.to_string()))?;

        let builtins = Context::new();
        let mut states = 0;
        for token in expr.iter() {
            if let Token::Var(name) = token {
                match parse_species_variable(name) {
                    Some(idx) => states = states.max(idx + 1),
                    None if builtins.get_var(name).is_some() => {}
                    None => {
                        return Err(invalid(format!(
                            "`{name}` is not a state reference (expected `{SPECIES_PREFIX}N` with N >= 1)"
                        )));
                    }
                }
            }
        }

        // Unknown functions and wrong argument counts only show up on evaluation.
        let ones = vec![1f64; states];
        expr.eval_with_context((StateContext { state: &ones }, &builtins))
            .map_err(|err| invalid(err.to_string()))?;

        Ok(Self {
            source: source.to_string(),
            expr,
            states,
        })
    }
}

fn parse_species_variable(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(SPECIES_PREFIX)?;
    digits.parse::<usize>().ok()?.checked_sub(1)
}

struct StateContext<'a> {
    state: &'a [f64],
}

impl ContextProvider for StateContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        parse_species_variable(name).and_then(|idx| self.state.get(idx).copied())
    }
}

pub type FitFn = dyn Fn(&Mat<f64>) -> Mat<f64> + Send + Sync;

/// How simulated states become observable series.
#[derive(Clone, Default)]
pub enum Fit {
    /// Every state is observed, in order.
    #[default]
    Identity,
    /// Observe a subset of the state columns (0-based).
    Columns(Vec<usize>),
    /// One arithmetic expression of the states per observed series.
    Expressions(Vec<FitExpression>),
    Custom(Arc<FitFn>),
}

impl Debug for Fit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fit::Identity => write!(f, "Identity"),
            Fit::Columns(cols) => f.debug_tuple("Columns").field(cols).finish(),
            Fit::Expressions(exprs) => f
                .debug_tuple("Expressions")
                .field(&exprs.iter().map(|e| e.source()).collect::<Vec<_>>())
                .finish(),
            Fit::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Fit {
    /// Parse one expression per observed series, e.g. `["species1+species2", "species5"]`.
    pub fn parse<S: AsRef<str>>(expressions: &[S]) -> Result<Self> {
        expressions
            .iter()
            .map(|expr| expr.as_ref().parse())
            .collect::<Result<Vec<_>>>()
            .map(Fit::Expressions)
    }

    pub fn custom(func: impl Fn(&Mat<f64>) -> Mat<f64> + Send + Sync + 'static) -> Self {
        Fit::Custom(Arc::new(func))
    }

    /// Fail unless every state column the fit refers to exists among
    /// `num_states` simulated states.
    pub fn check_states(&self, num_states: usize) -> Result<()> {
        match self {
            Fit::Identity | Fit::Custom(_) => Ok(()),
            Fit::Columns(cols) => match cols.iter().find(|&&col| col >= num_states) {
                Some(col) => Err(AbcError::InvalidConfig(format!(
                    "fit selects state column {col} but the simulator returns {num_states} states"
                ))),
                None => Ok(()),
            },
            Fit::Expressions(exprs) => match exprs.iter().find(|e| e.states > num_states) {
                Some(expr) => Err(expr.error(format!(
                    "refers to {SPECIES_PREFIX}{} but the simulator returns {num_states} states",
                    expr.states
                ))),
                None => Ok(()),
            },
        }
    }

    /// Apply the fit to a (timepoint × state) matrix.
    pub fn apply(&self, states: &Mat<f64>) -> Result<Mat<f64>> {
        self.check_states(states.ncols())?;
        let out = match self {
            Fit::Identity => states.clone(),
            Fit::Columns(cols) => {
                Mat::from_fn(states.nrows(), cols.len(), |t, j| states[(t, cols[j])])
            }
            Fit::Expressions(exprs) => {
                let builtins = Context::new();
                let mut out = Mat::zeros(states.nrows(), exprs.len());
                let mut row = vec![0f64; states.ncols()];
                for t in 0..states.nrows() {
                    row.iter_mut()
                        .enumerate()
                        .for_each(|(s, val)| *val = states[(t, s)]);
                    for (j, expr) in exprs.iter().enumerate() {
                        let ctx = (StateContext { state: &row }, &builtins);
                        out[(t, j)] = expr
                            .expr
                            .eval_with_context(ctx)
                            .map_err(|err| expr.error(err.to_string()))?;
                    }
                }
                out
            }
            Fit::Custom(func) => func(states),
        };
        Ok(out)
    }
}
