//! Free-vector layout.
//!
//! The free vector is state-major:
//!
//! ```text
//! [x_0(0..N), x_1(0..N), ..., r_0(0..N), ..., p_0, p_1, ..., h?]
//! ```
//!
//! States keep the caller's order; unknown trajectories and free parameters
//! are ordered by name. [`FreeLayout::build`] and [`FreeLayout::split`] are
//! exact inverses.

use std::collections::BTreeMap;

use dc_expr::Symbol;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::discretize::CollocationMethod;
use crate::error::{CollocationError, CollocationResult};
use crate::grid::NodeGrid;

/// Kind of entity occupying a range of the free vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    State,
    Trajectory,
    Parameter,
    Interval,
}

/// Contiguous block of the free vector owned by one named entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutRange {
    pub name: String,
    pub kind: EntityKind,
    pub start: usize,
    pub len: usize,
}

/// Mapping between named unknowns and flat positions.
#[derive(Clone, Debug, PartialEq)]
pub struct FreeLayout {
    grid: NodeGrid,
    states: Vec<Symbol>,
    trajectories: Vec<Symbol>,
    parameters: Vec<Symbol>,
    method: CollocationMethod,
}

impl FreeLayout {
    pub fn new(
        grid: NodeGrid,
        states: Vec<Symbol>,
        trajectories: Vec<Symbol>,
        parameters: Vec<Symbol>,
    ) -> Self {
        Self {
            grid,
            states,
            trajectories,
            parameters,
            method: CollocationMethod::default(),
        }
    }

    /// Collocation scheme the defects use; decides the quadrature weights.
    pub fn with_method(mut self, method: CollocationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn method(&self) -> CollocationMethod {
        self.method
    }

    /// Per-node quadrature weights matching [`FreeLayout::method`].
    pub fn node_weights(&self) -> Vec<f64> {
        self.method.node_weights(self.num_nodes())
    }

    pub fn grid(&self) -> &NodeGrid {
        &self.grid
    }

    pub fn num_nodes(&self) -> usize {
        self.grid.num_nodes()
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn num_trajectories(&self) -> usize {
        self.trajectories.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn has_free_interval(&self) -> bool {
        self.grid.interval_symbol().is_some()
    }

    pub fn states(&self) -> &[Symbol] {
        &self.states
    }

    pub fn trajectories(&self) -> &[Symbol] {
        &self.trajectories
    }

    pub fn parameters(&self) -> &[Symbol] {
        &self.parameters
    }

    /// Length of the free vector.
    pub fn num_free(&self) -> usize {
        (self.num_states() + self.num_trajectories()) * self.num_nodes()
            + self.num_parameters()
            + usize::from(self.has_free_interval())
    }

    pub fn state_index(&self, state: usize, node: usize) -> usize {
        debug_assert!(state < self.num_states() && node < self.num_nodes());
        state * self.num_nodes() + node
    }

    pub fn trajectory_index(&self, trajectory: usize, node: usize) -> usize {
        debug_assert!(trajectory < self.num_trajectories() && node < self.num_nodes());
        (self.num_states() + trajectory) * self.num_nodes() + node
    }

    pub fn parameter_index(&self, parameter: usize) -> usize {
        debug_assert!(parameter < self.num_parameters());
        (self.num_states() + self.num_trajectories()) * self.num_nodes() + parameter
    }

    /// Position of the free node interval, when there is one.
    pub fn interval_index(&self) -> Option<usize> {
        self.has_free_interval().then(|| self.num_free() - 1)
    }

    /// Node interval for the vector `x`: the free entry or the fixed value.
    pub fn interval_value(&self, x: &[f64]) -> f64 {
        match self.interval_index() {
            Some(i) => x[i],
            None => self.grid.fixed_interval().unwrap_or(f64::NAN),
        }
    }

    /// Index ranges of every entity, in vector order.
    pub fn ranges(&self) -> Vec<LayoutRange> {
        let n = self.num_nodes();
        let mut out = Vec::with_capacity(
            self.num_states() + self.num_trajectories() + self.num_parameters() + 1,
        );
        for (i, s) in self.states.iter().enumerate() {
            out.push(LayoutRange {
                name: s.name().to_string(),
                kind: EntityKind::State,
                start: self.state_index(i, 0),
                len: n,
            });
        }
        for (i, s) in self.trajectories.iter().enumerate() {
            out.push(LayoutRange {
                name: s.name().to_string(),
                kind: EntityKind::Trajectory,
                start: self.trajectory_index(i, 0),
                len: n,
            });
        }
        for (i, s) in self.parameters.iter().enumerate() {
            out.push(LayoutRange {
                name: s.name().to_string(),
                kind: EntityKind::Parameter,
                start: self.parameter_index(i),
                len: 1,
            });
        }
        if let (Some(h), Some(start)) = (self.grid.interval_symbol(), self.interval_index()) {
            out.push(LayoutRange {
                name: h.name().to_string(),
                kind: EntityKind::Interval,
                start,
                len: 1,
            });
        }
        out
    }

    /// Flatten named arrays into a free vector.
    ///
    /// `states` is `num_states x N`, `trajectories` is
    /// `num_trajectories x N`. `interval` must be given exactly when the
    /// node interval is free.
    pub fn build(
        &self,
        states: &DMatrix<f64>,
        trajectories: &DMatrix<f64>,
        parameters: &DVector<f64>,
        interval: Option<f64>,
    ) -> CollocationResult<Vec<f64>> {
        let n = self.num_nodes();
        check_shape("states", states, self.num_states(), n)?;
        check_shape("trajectories", trajectories, self.num_trajectories(), n)?;
        if parameters.len() != self.num_parameters() {
            return Err(CollocationError::config(format!(
                "expected {} free parameters, got {}",
                self.num_parameters(),
                parameters.len()
            )));
        }
        if interval.is_some() != self.has_free_interval() {
            return Err(CollocationError::config(if self.has_free_interval() {
                "the node interval is free; an initial interval value is required"
            } else {
                "the node interval is fixed; no interval value may be given"
            }));
        }

        let mut x = Vec::with_capacity(self.num_free());
        for row in states.row_iter().chain(trajectories.row_iter()) {
            x.extend(row.iter().copied());
        }
        x.extend(parameters.iter().copied());
        x.extend(interval);
        debug_assert_eq!(x.len(), self.num_free());
        Ok(x)
    }

    /// Inverse of [`FreeLayout::build`].
    pub fn split(&self, x: &[f64]) -> CollocationResult<ParsedFree> {
        self.check_len(x)?;
        let n = self.num_nodes();
        let ns = self.num_states();
        let nr = self.num_trajectories();
        let states = DMatrix::from_row_slice(ns, n, &x[..ns * n]);
        let trajectories = DMatrix::from_row_slice(nr, n, &x[ns * n..(ns + nr) * n]);
        let p0 = (ns + nr) * n;
        let parameters = DVector::from_column_slice(&x[p0..p0 + self.num_parameters()]);
        let interval = self.interval_index().map(|i| x[i]);
        let h = interval.or(self.grid.fixed_interval()).unwrap_or(f64::NAN);
        Ok(ParsedFree {
            states,
            trajectories,
            parameters,
            interval,
            times: self.grid.times(h),
            state_names: self.states.clone(),
            trajectory_names: self.trajectories.clone(),
            parameter_names: self.parameters.clone(),
        })
    }

    pub(crate) fn check_len(&self, x: &[f64]) -> CollocationResult<()> {
        if x.len() != self.num_free() {
            return Err(CollocationError::config(format!(
                "free vector has length {}, layout expects {}",
                x.len(),
                self.num_free()
            )));
        }
        Ok(())
    }
}

fn check_shape(what: &str, m: &DMatrix<f64>, rows: usize, cols: usize) -> CollocationResult<()> {
    // An empty block may come in as 0x0.
    if m.nrows() == rows && (m.ncols() == cols || rows == 0) {
        return Ok(());
    }
    Err(CollocationError::config(format!(
        "{what} must be {rows}x{cols}, got {}x{}",
        m.nrows(),
        m.ncols()
    )))
}

/// A free vector split into named arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFree {
    /// `num_states x N`, rows in state order
    pub states: DMatrix<f64>,
    /// `num_trajectories x N`, rows in name order
    pub trajectories: DMatrix<f64>,
    pub parameters: DVector<f64>,
    /// Free node interval, if the interval is free
    pub interval: Option<f64>,
    /// Node times `k * h`
    pub times: Vec<f64>,
    state_names: Vec<Symbol>,
    trajectory_names: Vec<Symbol>,
    parameter_names: Vec<Symbol>,
}

fn position(names: &[Symbol], name: &str) -> Option<usize> {
    names.iter().position(|s| s.name() == name)
}

impl ParsedFree {
    pub fn state(&self, name: &str) -> Option<Vec<f64>> {
        position(&self.state_names, name).map(|i| self.states.row(i).iter().copied().collect())
    }

    pub fn trajectory(&self, name: &str) -> Option<Vec<f64>> {
        position(&self.trajectory_names, name)
            .map(|i| self.trajectories.row(i).iter().copied().collect())
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        position(&self.parameter_names, name).map(|i| self.parameters[i])
    }

    /// Name-keyed copy for serialization.
    pub fn to_named(&self) -> NamedSolution {
        let rows = |names: &[Symbol], m: &DMatrix<f64>| -> BTreeMap<String, Vec<f64>> {
            names
                .iter()
                .enumerate()
                .map(|(i, s)| (s.name().to_string(), m.row(i).iter().copied().collect()))
                .collect()
        };
        NamedSolution {
            times: self.times.clone(),
            states: rows(&self.state_names, &self.states),
            trajectories: rows(&self.trajectory_names, &self.trajectories),
            parameters: self
                .parameter_names
                .iter()
                .zip(self.parameters.iter())
                .map(|(s, v)| (s.name().to_string(), *v))
                .collect(),
            interval: self.interval,
        }
    }
}

/// Serializable form of [`ParsedFree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedSolution {
    pub times: Vec<f64>,
    pub states: BTreeMap<String, Vec<f64>>,
    pub trajectories: BTreeMap<String, Vec<f64>>,
    pub parameters: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Interval;
    use dc_expr::dynamic_symbols;
    use proptest::prelude::*;

    fn layout(free_interval: bool) -> FreeLayout {
        let interval = if free_interval {
            Interval::Free(Symbol::constant("h"))
        } else {
            Interval::Fixed(0.1)
        };
        FreeLayout::new(
            NodeGrid::new(4, interval).unwrap(),
            dynamic_symbols("x v"),
            dynamic_symbols("u"),
            dc_expr::symbols("c k"),
        )
    }

    #[test]
    fn indices_are_state_major() {
        let l = layout(true);
        assert_eq!(l.num_free(), (2 + 1) * 4 + 2 + 1);
        assert_eq!(l.state_index(1, 2), 6);
        assert_eq!(l.trajectory_index(0, 3), 11);
        assert_eq!(l.parameter_index(1), 13);
        assert_eq!(l.interval_index(), Some(14));
        assert_eq!(layout(false).interval_index(), None);
    }

    #[test]
    fn ranges_cover_the_vector() {
        let l = layout(true);
        let ranges = l.ranges();
        let total: usize = ranges.iter().map(|r| r.len).sum();
        assert_eq!(total, l.num_free());
        assert_eq!(ranges.last().unwrap().kind, EntityKind::Interval);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].start + pair[0].len, pair[1].start);
        }
    }

    #[test]
    fn build_rejects_wrong_shapes() {
        let l = layout(false);
        let states = DMatrix::zeros(2, 3);
        let traj = DMatrix::zeros(1, 4);
        let params = DVector::zeros(2);
        assert!(l.build(&states, &traj, &params, None).is_err());
        let states = DMatrix::zeros(2, 4);
        assert!(l.build(&states, &traj, &params, Some(0.1)).is_err());
        assert!(l.build(&states, &traj, &params, None).is_ok());
        assert!(l.split(&[0.0; 3]).is_err());
    }

    #[test]
    fn named_lookup() {
        let l = layout(false);
        let x: Vec<f64> = (0..l.num_free()).map(|i| i as f64).collect();
        let parsed = l.split(&x).unwrap();
        assert_eq!(parsed.state("v"), Some(vec![4.0, 5.0, 6.0, 7.0]));
        assert_eq!(parsed.trajectory("u"), Some(vec![8.0, 9.0, 10.0, 11.0]));
        assert_eq!(parsed.parameter("k"), Some(13.0));
        assert_eq!(parsed.state("nope"), None);
        assert_eq!(parsed.times.len(), 4);
        assert!((parsed.times[3] - 0.3).abs() < 1e-15);
        let named = parsed.to_named();
        assert_eq!(named.parameters["c"], 12.0);
        assert!(named.interval.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn split_inverts_build(
            ns in 1usize..4,
            nr in 0usize..3,
            np in 0usize..3,
            n in 2usize..6,
            free in any::<bool>(),
            empty_as_zero_by_zero in any::<bool>(),
            pool in prop::collection::vec(-10.0f64..10.0, 64),
        ) {
            let interval = if free {
                Interval::Free(Symbol::constant("h"))
            } else {
                Interval::Fixed(0.25)
            };
            let l = FreeLayout::new(
                NodeGrid::new(n, interval).unwrap(),
                (0..ns).map(|i| Symbol::dynamic(format!("x{i}"))).collect(),
                (0..nr).map(|i| Symbol::dynamic(format!("r{i}"))).collect(),
                (0..np).map(|i| Symbol::constant(format!("p{i}"))).collect(),
            );
            let states = DMatrix::from_fn(ns, n, |r, c| pool[r * n + c]);
            let trajectories = if nr == 0 && empty_as_zero_by_zero {
                DMatrix::zeros(0, 0)
            } else {
                DMatrix::from_fn(nr, n, |r, c| pool[20 + r * n + c])
            };
            let parameters = DVector::from_fn(np, |i, _| pool[40 + i]);
            let h = free.then_some(0.3);

            let x = l.build(&states, &trajectories, &parameters, h).unwrap();
            prop_assert_eq!(x.len(), l.num_free());
            let parsed = l.split(&x).unwrap();
            prop_assert_eq!(&parsed.states, &states);
            prop_assert_eq!(parsed.trajectories.shape(), (nr, n));
            prop_assert_eq!(parsed.trajectories.as_slice(), trajectories.as_slice());
            prop_assert_eq!(&parsed.parameters, &parameters);
            prop_assert_eq!(parsed.interval, h);
            prop_assert_eq!(parsed.times.len(), n);

            let again = l
                .build(&parsed.states, &parsed.trajectories, &parsed.parameters, parsed.interval)
                .unwrap();
            prop_assert_eq!(again, x);
        }
    }
}
