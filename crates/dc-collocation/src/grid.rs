//! Node grid, interval, and equations-of-motion inputs.

use dc_expr::{Expr, Symbol};

use crate::error::{CollocationError, CollocationResult};

/// Node spacing: a fixed value or a free scalar solved for.
#[derive(Clone, Debug, PartialEq)]
pub enum Interval {
    Fixed(f64),
    Free(Symbol),
}

/// `num_nodes` time points starting at t = 0 with spacing h.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeGrid {
    num_nodes: usize,
    interval: Interval,
}

impl NodeGrid {
    pub fn new(num_nodes: usize, interval: Interval) -> CollocationResult<Self> {
        if num_nodes < 2 {
            return Err(CollocationError::config(format!(
                "num_nodes must be at least 2, got {num_nodes}"
            )));
        }
        if let Interval::Fixed(h) = interval {
            if !(h.is_finite() && h > 0.0) {
                return Err(CollocationError::config(format!(
                    "fixed node interval must be positive and finite, got {h}"
                )));
            }
        }
        Ok(Self { num_nodes, interval })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_intervals(&self) -> usize {
        self.num_nodes - 1
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    /// Symbol of the free interval, if the interval is free.
    pub fn interval_symbol(&self) -> Option<&Symbol> {
        match &self.interval {
            Interval::Free(s) => Some(s),
            Interval::Fixed(_) => None,
        }
    }

    pub fn fixed_interval(&self) -> Option<f64> {
        match self.interval {
            Interval::Fixed(h) => Some(h),
            Interval::Free(_) => None,
        }
    }

    /// Node times for spacing `h`.
    pub fn times(&self, h: f64) -> Vec<f64> {
        dc_core::linspace(0.0, h * self.num_intervals() as f64, self.num_nodes)
    }
}

/// Continuous dynamics, resolved once at construction.
#[derive(Clone, Debug)]
pub enum EquationsOfMotion {
    /// `G(der(x), x, r, p, t) = 0`, one expression per state.
    Implicit(Vec<Expr>),
    /// `M(x, p) der(x) = F(x, r, p, t)` with `mass` given row by row.
    MassMatrix { mass: Vec<Vec<Expr>>, forcing: Vec<Expr> },
}

impl From<Vec<Expr>> for EquationsOfMotion {
    fn from(exprs: Vec<Expr>) -> Self {
        EquationsOfMotion::Implicit(exprs)
    }
}

impl EquationsOfMotion {
    pub fn mass_matrix(mass: Vec<Vec<Expr>>, forcing: Vec<Expr>) -> Self {
        EquationsOfMotion::MassMatrix { mass, forcing }
    }

    pub fn num_equations(&self) -> usize {
        match self {
            EquationsOfMotion::Implicit(e) => e.len(),
            EquationsOfMotion::MassMatrix { forcing, .. } => forcing.len(),
        }
    }

    /// Every expression, for symbol classification.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            EquationsOfMotion::Implicit(e) => e.iter().collect(),
            EquationsOfMotion::MassMatrix { mass, forcing } => {
                mass.iter().flatten().chain(forcing.iter()).collect()
            }
        }
    }

    /// Shape checks that do not need symbol information.
    pub(crate) fn validate(&self, num_states: usize) -> CollocationResult<()> {
        if self.num_equations() != num_states {
            return Err(CollocationError::config(format!(
                "{} equations of motion for {num_states} states",
                self.num_equations()
            )));
        }
        if let EquationsOfMotion::MassMatrix { mass, .. } = self {
            if mass.len() != num_states || mass.iter().any(|row| row.len() != num_states) {
                return Err(CollocationError::config(format!(
                    "mass matrix must be {num_states}x{num_states}"
                )));
            }
            if let Some(e) = self.expressions().into_iter().find(|e| !e.derivative_symbols().is_empty()) {
                return Err(CollocationError::config(format!(
                    "mass-matrix form must not contain der(): {e}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_rejects_degenerate_input() {
        assert!(NodeGrid::new(1, Interval::Fixed(0.1)).is_err());
        assert!(NodeGrid::new(5, Interval::Fixed(0.0)).is_err());
        assert!(NodeGrid::new(5, Interval::Fixed(f64::NAN)).is_err());
        let grid = NodeGrid::new(5, Interval::Fixed(0.5)).unwrap();
        assert_eq!(grid.times(0.5), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(grid.num_intervals(), 4);
    }

    #[test]
    fn mass_matrix_shape_is_checked() {
        let x = Symbol::dynamic("x");
        let eom = EquationsOfMotion::mass_matrix(vec![vec![Expr::one(), Expr::zero()]], vec![x.expr()]);
        assert!(eom.validate(1).is_err());
        let eom = EquationsOfMotion::mass_matrix(vec![vec![Expr::one()]], vec![x.der()]);
        assert!(eom.validate(1).is_err());
        let eom = EquationsOfMotion::mass_matrix(vec![vec![Expr::one()]], vec![-x.expr()]);
        assert!(eom.validate(1).is_ok());
    }
}
