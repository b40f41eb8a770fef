//! Interior-point configuration.

use serde::{Deserialize, Serialize};

/// Options for [`crate::InteriorPoint`].
///
/// Every field has a default, so a partial `solver:` section in a scenario
/// file deserializes cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpmOptions {
    /// Maximum iterations
    pub max_iterations: usize,
    /// Overall (scaled) optimality tolerance
    pub tol: f64,
    /// Constraint violation required before a point counts as feasible
    pub constr_viol_tol: f64,
    /// Looser tolerance accepted after `acceptable_iter` consecutive hits
    pub acceptable_tol: f64,
    pub acceptable_iter: usize,
    /// Initial barrier parameter
    pub mu_init: f64,
    /// Linear barrier decrease factor
    pub mu_linear_decrease: f64,
    /// Superlinear barrier decrease exponent
    pub mu_superlinear_power: f64,
    /// Lower bound on the fraction-to-boundary parameter
    pub tau_min: f64,
    /// Absolute push of the initial point into the bounds
    pub bound_push: f64,
    /// Relative push of the initial point into the bounds
    pub bound_frac: f64,
    /// Finite bounds are widened by this fraction (at least absolute) so
    /// that the barrier problem keeps an interior when a constraint pins a
    /// variable to its bound. Reported iterates are clamped back.
    pub bound_relax_factor: f64,
    /// Step used for the finite difference Lagrangian Hessian
    pub hessian_epsilon: f64,
    /// First primal regularization tried when curvature is insufficient
    pub first_hessian_perturbation: f64,
    pub max_hessian_perturbation: f64,
    /// Armijo sufficient decrease constant
    pub armijo: f64,
    /// Maximum backtracking steps per line search
    pub max_backtracks: usize,
    /// Projected constraint gradient below which an infeasible point is
    /// declared locally infeasible (relative to the violation)
    pub infeasibility_tol: f64,
}

impl Default for IpmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3000,
            tol: 1e-8,
            constr_viol_tol: 1e-6,
            acceptable_tol: 1e-6,
            acceptable_iter: 15,
            mu_init: 0.1,
            mu_linear_decrease: 0.2,
            mu_superlinear_power: 1.5,
            tau_min: 0.99,
            bound_push: 1e-2,
            bound_frac: 1e-2,
            bound_relax_factor: 1e-8,
            hessian_epsilon: 1e-7,
            first_hessian_perturbation: 1e-4,
            max_hessian_perturbation: 1e20,
            armijo: 1e-4,
            max_backtracks: 40,
            infeasibility_tol: 1e-7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let opts: IpmOptions = serde_yaml::from_str("max_iterations: 25\ntol: 1.0e-6\n").unwrap();
        assert_eq!(opts.max_iterations, 25);
        assert_eq!(opts.tol, 1e-6);
        assert_eq!(opts.mu_init, IpmOptions::default().mu_init);
    }
}
