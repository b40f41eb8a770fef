//! NLP backend interface and the bundled interior-point solver.
//!
//! Problems describe themselves through [`NlpProblem`] callbacks; any
//! [`NlpSolver`] can drive them. Nonconvergence is reported through
//! [`SolveStatus`], never as an error. Errors are reserved for invalid input,
//! non-finite evaluations, and failures raised by the problem itself.

pub mod error;
pub mod ipm;
pub mod jacobian;
pub mod options;
pub mod problem;
pub mod solution;

pub use error::{NlpError, NlpResult, Quantity};
pub use ipm::InteriorPoint;
pub use jacobian::{central_difference_jacobian, finite_difference_jacobian};
pub use options::IpmOptions;
pub use problem::{EvalError, EvalResult, INFINITE_BOUND, NlpProblem, NlpSolver};
pub use solution::{NlpSolution, SolveDiagnostics, SolveStatus};
