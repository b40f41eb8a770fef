//! Error types for problem construction and solving.

use std::fmt;

use dc_expr::ExprError;
use dc_nlp::NlpError;
use thiserror::Error;

/// Where in the problem a non-finite value appeared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintLocation {
    /// Defect of `equation` between nodes `interval` and `interval + 1`.
    Defect { equation: usize, interval: usize },
    /// Instance constraint `index`, first sampled at `node` when it samples any.
    Instance { index: usize, node: Option<usize> },
    /// Path constraint `index` at `node`.
    Path { index: usize, node: usize },
    Objective,
    /// Entry of the objective gradient.
    Gradient { entry: usize },
}

impl fmt::Display for ConstraintLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintLocation::Defect { equation, interval } => {
                write!(f, "defect of equation {equation} on interval {interval}")
            }
            ConstraintLocation::Instance { index, node: Some(node) } => {
                write!(f, "instance constraint {index} at node {node}")
            }
            ConstraintLocation::Instance { index, node: None } => {
                write!(f, "instance constraint {index}")
            }
            ConstraintLocation::Path { index, node } => {
                write!(f, "path constraint {index} at node {node}")
            }
            ConstraintLocation::Objective => write!(f, "objective"),
            ConstraintLocation::Gradient { entry } => write!(f, "gradient entry {entry}"),
        }
    }
}

fn fmt_location(location: &Option<ConstraintLocation>) -> String {
    location.map(|l| format!(" in {l}")).unwrap_or_default()
}

fn fmt_node(node: &Option<usize>) -> String {
    node.map(|n| format!(" at node {n}")).unwrap_or_default()
}

/// Errors that can occur while building or solving a collocation problem.
///
/// Solver nonconvergence is not represented here; it is reported through
/// [`dc_nlp::SolveStatus`] on an otherwise successful solve.
#[derive(Error, Debug)]
pub enum CollocationError {
    #[error("Configuration error: {what}")]
    Configuration { what: String },

    #[error("Discretization error{}: {what}", fmt_node(.node))]
    Discretization { what: String, node: Option<usize> },

    #[error("Numerical error at iteration {iteration}{}: {what}", fmt_location(.location))]
    Numerical {
        iteration: usize,
        what: String,
        location: Option<ConstraintLocation>,
        /// Objective values of the iterations completed before the failure
        trace: Vec<f64>,
    },

    #[error("Expression error: {0}")]
    Expr(#[from] ExprError),

    #[error("Solver error: {0}")]
    Nlp(#[from] NlpError),
}

impl CollocationError {
    /// Objective trace of an aborted solve, empty for construction errors.
    pub fn trace(&self) -> &[f64] {
        match self {
            CollocationError::Numerical { trace, .. } => trace,
            CollocationError::Nlp(e) => e.trace(),
            _ => &[],
        }
    }

    pub(crate) fn config(what: impl Into<String>) -> Self {
        CollocationError::Configuration { what: what.into() }
    }
}

pub type CollocationResult<T> = Result<T, CollocationError>;
