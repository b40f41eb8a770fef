//! Error types for NLP solves.

use std::fmt;

use thiserror::Error;

use crate::problem::EvalError;

/// Which callback produced a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Objective,
    Gradient,
    Constraints,
    Jacobian,
    /// Lagrangian gradient evaluated at a perturbed point for the Hessian.
    Hessian,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Objective => "objective",
            Quantity::Gradient => "gradient",
            Quantity::Constraints => "constraints",
            Quantity::Jacobian => "jacobian",
            Quantity::Hessian => "hessian",
        };
        f.write_str(name)
    }
}

/// Errors that abort a solve.
///
/// Nonconvergence is not an error; see [`crate::SolveStatus`]. The variants
/// raised mid-solve keep the objective trace collected up to the failure.
#[derive(Error, Debug)]
pub enum NlpError {
    #[error("Invalid problem: {what}")]
    InvalidProblem { what: String },

    #[error("Non-finite {quantity} at iteration {iteration}{}", fmt_index(.index))]
    NonFinite {
        iteration: usize,
        quantity: Quantity,
        index: Option<usize>,
        trace: Vec<f64>,
    },

    #[error("Evaluation of {quantity} failed at iteration {iteration}: {source}")]
    Evaluation {
        iteration: usize,
        quantity: Quantity,
        #[source]
        source: EvalError,
        trace: Vec<f64>,
    },
}

fn fmt_index(index: &Option<usize>) -> String {
    index.map(|i| format!(" (entry {i})")).unwrap_or_default()
}

impl NlpError {
    /// Objective values of the iterations completed before the failure.
    pub fn trace(&self) -> &[f64] {
        match self {
            NlpError::InvalidProblem { .. } => &[],
            NlpError::NonFinite { trace, .. } | NlpError::Evaluation { trace, .. } => trace,
        }
    }
}

pub type NlpResult<T> = Result<T, NlpError>;
