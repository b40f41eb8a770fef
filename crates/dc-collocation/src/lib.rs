//! Direct-collocation transcription of trajectory optimization and
//! parameter identification problems.
//!
//! A [`ProblemBuilder`] takes symbolic equations of motion, the state
//! symbols, a node count and a node interval, plus known values, bounds,
//! instance and path constraints, and an objective. Building classifies every
//! symbol, lays out the free vector, and compiles defect and constraint
//! kernels with their symbolic Jacobians. The resulting [`Problem`] is an
//! [`dc_nlp::NlpProblem`] that any [`dc_nlp::NlpSolver`] can drive.

mod block;
pub mod discretize;
pub mod error;
pub mod grid;
pub mod instance;
pub mod layout;
pub mod objective;
pub mod path;
pub mod problem;
pub mod solution;
pub mod symbols;

pub use discretize::{CollocationMethod, EvalBackend};
pub use error::{CollocationError, CollocationResult, ConstraintLocation};
pub use grid::{EquationsOfMotion, Interval, NodeGrid};
pub use instance::InstanceConstraint;
pub use layout::{EntityKind, FreeLayout, LayoutRange, NamedSolution, ParsedFree};
pub use objective::{Objective, control_effort, minimize_interval, parameter_sum, tracking};
pub use path::PathConstraint;
pub use problem::{Problem, ProblemBuilder};
pub use solution::{ConstraintViolations, GradientCheck, Solution, SolveOptions};
pub use symbols::{Classification, SymbolRole};
