//! The callback interface between a problem and an NLP backend.
//!
//! Shapes follow the usual large-scale convention:
//!
//! ```text
//! minimize    f(x)
//! subject to  g_l <= g(x) <= g_u
//!             x_l <= x    <= x_u
//! ```
//!
//! Rows with `g_l == g_u` are equalities. Bounds at or beyond
//! [`INFINITE_BOUND`] in magnitude are treated as absent.

use crate::error::NlpResult;
use crate::solution::NlpSolution;

/// Error raised by a problem callback. Backends pass it through untouched so
/// callers can downcast it back to their own error type.
pub type EvalError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type EvalResult<T> = Result<T, EvalError>;

/// Magnitude from which a bound counts as infinite.
pub const INFINITE_BOUND: f64 = 1e19;

/// A smooth constrained nonlinear program with a sparse constraint Jacobian.
pub trait NlpProblem {
    fn num_variables(&self) -> usize;

    fn num_constraints(&self) -> usize;

    fn variable_bounds(&self, lower: &mut [f64], upper: &mut [f64]);

    fn constraint_bounds(&self, lower: &mut [f64], upper: &mut [f64]);

    fn objective(&self, x: &[f64]) -> EvalResult<f64>;

    fn gradient(&self, x: &[f64], grad: &mut [f64]) -> EvalResult<()>;

    fn constraints(&self, x: &[f64], g: &mut [f64]) -> EvalResult<()>;

    /// Row and column of every structural non-zero. Fixed for the lifetime
    /// of the problem; `jacobian_values` fills values in the same order.
    fn jacobian_structure(&self) -> (Vec<usize>, Vec<usize>);

    fn jacobian_values(&self, x: &[f64], values: &mut [f64]) -> EvalResult<()>;
}

/// A backend able to solve an [`NlpProblem`] from a starting point.
pub trait NlpSolver {
    fn solve(&self, problem: &dyn NlpProblem, x0: &[f64]) -> NlpResult<NlpSolution>;
}
