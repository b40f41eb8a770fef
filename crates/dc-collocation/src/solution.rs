//! Solve options and results.

use dc_nlp::{IpmOptions, SolveDiagnostics, SolveStatus};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::layout::ParsedFree;

/// Engine-level options. Deserializes from a partial map; the backend
/// options sit at the same level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    #[serde(flatten)]
    pub ipm: IpmOptions,
    /// Compare the gradient against finite differences before solving
    pub verify_gradient: bool,
    /// Largest relative gradient error accepted by the check
    pub gradient_tolerance: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            ipm: IpmOptions::default(),
            verify_gradient: false,
            gradient_tolerance: 1e-4,
        }
    }
}

/// Result of a solve that ran to termination.
///
/// A non-converged status still comes with the best iterate the backend
/// found; check [`Solution::status`].
#[derive(Clone, Debug)]
pub struct Solution {
    pub x: Vec<f64>,
    pub free: ParsedFree,
    pub diagnostics: SolveDiagnostics,
    /// Constraint multipliers in constraint-row order
    pub multipliers: Vec<f64>,
}

impl Solution {
    pub fn status(&self) -> SolveStatus {
        self.diagnostics.status
    }
}

/// Analytic gradient compared with central differences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientCheck {
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    /// Entry with the largest relative error
    pub worst_entry: Option<usize>,
    pub passed: bool,
}

/// Constraint values at a point, grouped by origin.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintViolations {
    /// Defects, `num_states x (N - 1)`; every entry should be zero
    pub defects: DMatrix<f64>,
    /// Distance of each instance constraint outside its bounds, signed
    pub instance: Vec<f64>,
    /// Distance of each path constraint outside its bounds, `num_path x N`
    pub path: DMatrix<f64>,
}

impl ConstraintViolations {
    pub fn max_abs(&self) -> f64 {
        self.defects
            .iter()
            .chain(self.instance.iter())
            .chain(self.path.iter())
            .fold(0.0, |acc, v| acc.max(v.abs()))
    }
}

/// Signed amount by which `value` lies outside `[lower, upper]`.
pub(crate) fn outside(value: f64, (lower, upper): (f64, f64)) -> f64 {
    if value < lower {
        value - lower
    } else if value > upper {
        value - upper
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_accept_flat_partial_maps() {
        let opts: SolveOptions =
            serde_json::from_str(r#"{"max_iterations": 50, "verify_gradient": true}"#).unwrap();
        assert_eq!(opts.ipm.max_iterations, 50);
        assert!(opts.verify_gradient);
        assert_eq!(opts.gradient_tolerance, 1e-4);
        assert_eq!(opts.ipm.tol, IpmOptions::default().tol);
    }

    #[test]
    fn outside_is_signed() {
        assert_eq!(outside(2.0, (0.0, 1.0)), 1.0);
        assert_eq!(outside(-0.5, (0.0, 1.0)), -0.5);
        assert_eq!(outside(0.5, (0.0, 1.0)), 0.0);
    }
}
