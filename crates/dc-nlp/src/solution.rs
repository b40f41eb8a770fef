//! Solver output: final iterate plus diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a solve ended. Only `Converged` means the tolerances were met; every
/// other status still comes with the best iterate found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    IterationLimit,
    Infeasible,
    NumericalError,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        self == SolveStatus::Converged
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolveStatus::Converged => "converged",
            SolveStatus::IterationLimit => "iteration limit",
            SolveStatus::Infeasible => "infeasible",
            SolveStatus::NumericalError => "numerical error",
        };
        f.write_str(s)
    }
}

/// Diagnostics record returned with every solution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveDiagnostics {
    pub status: SolveStatus,
    pub iterations: usize,
    /// Objective at the returned iterate
    pub objective: f64,
    /// Largest violation of any constraint or variable bound at the returned iterate
    pub constraint_violation: f64,
    /// Unscaled dual infeasibility at the last iterate
    pub dual_infeasibility: f64,
    /// Objective value of every iterate, starting with the initial point
    pub objective_trace: Vec<f64>,
}

/// Final iterate of a solve.
#[derive(Clone, Debug)]
pub struct NlpSolution {
    pub x: Vec<f64>,
    /// Constraint multipliers, one per constraint row
    pub multipliers: Vec<f64>,
    pub diagnostics: SolveDiagnostics,
}

impl NlpSolution {
    pub fn status(&self) -> SolveStatus {
        self.diagnostics.status
    }
}
