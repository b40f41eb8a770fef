//! Objective and gradient callables over the free vector.
//!
//! There is no default objective. The helpers below build the common ones
//! against a [`FreeLayout`]; anything else is supplied as a pair of
//! closures.

use std::fmt;
use std::sync::Arc;

use dc_expr::Symbol;

use crate::error::{CollocationError, CollocationResult};
use crate::layout::FreeLayout;

type ValueFn = dyn Fn(&[f64]) -> f64 + Send + Sync;
type GradientFn = dyn Fn(&[f64]) -> Vec<f64> + Send + Sync;

/// Caller-supplied objective `f(x)` and its gradient.
pub struct Objective {
    value: Box<ValueFn>,
    gradient: Box<GradientFn>,
}

impl fmt::Debug for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Objective { .. }")
    }
}

impl Objective {
    pub fn new<F, G>(value: F, gradient: G) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
        G: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        Self {
            value: Box::new(value),
            gradient: Box::new(gradient),
        }
    }

    pub fn value(&self, x: &[f64]) -> f64 {
        (self.value)(x)
    }

    pub fn gradient(&self, x: &[f64]) -> Vec<f64> {
        (self.gradient)(x)
    }

    /// Probe the gradient once and check its length.
    pub(crate) fn validate(&self, num_free: usize) -> CollocationResult<()> {
        let probe = self.gradient(&vec![0.0; num_free]);
        if probe.len() != num_free {
            return Err(CollocationError::config(format!(
                "gradient returns {} entries, free vector has {num_free}",
                probe.len()
            )));
        }
        Ok(())
    }
}

fn lookup(names: &[Symbol], name: &Symbol, what: &str) -> CollocationResult<usize> {
    names
        .iter()
        .position(|s| s == name)
        .ok_or_else(|| CollocationError::config(format!("'{name}' is not {what}")))
}

/// Fixed interval or position of the free one.
#[derive(Clone, Copy)]
enum Step {
    Fixed(f64),
    Free(usize),
}

impl Step {
    fn of(layout: &FreeLayout) -> Self {
        match (layout.interval_index(), layout.grid().fixed_interval()) {
            (Some(i), _) => Step::Free(i),
            (None, Some(h)) => Step::Fixed(h),
            (None, None) => unreachable!("grid has either a fixed or a free interval"),
        }
    }

    fn value(self, x: &[f64]) -> f64 {
        match self {
            Step::Fixed(h) => h,
            Step::Free(i) => x[i],
        }
    }
}

/// `h * sum_j w_j * term(x[i_j], j)` over weighted node entries `(i_j, w_j)`,
/// with its gradient. Repeated indices accumulate.
fn weighted_sum<T, D>(layout: &FreeLayout, entries: Vec<(usize, f64)>, term: T, dterm: D) -> Objective
where
    T: Fn(f64, usize) -> f64 + Send + Sync + 'static,
    D: Fn(f64, usize) -> f64 + Send + Sync + 'static,
{
    let step = Step::of(layout);
    let n = layout.num_free();
    let entries = Arc::new(entries);
    let entries_g = entries.clone();
    let term_g = Arc::new(term);
    let term_v = term_g.clone();
    let sum = move |entries: &[(usize, f64)], term: &T, x: &[f64]| -> f64 {
        entries
            .iter()
            .enumerate()
            .map(|(j, &(i, w))| w * term(x[i], j))
            .sum()
    };
    Objective::new(
        move |x| step.value(x) * sum(entries.as_slice(), &*term_v, x),
        move |x| {
            let h = step.value(x);
            let mut g = vec![0.0; n];
            for (j, &(i, w)) in entries_g.iter().enumerate() {
                g[i] += h * w * dterm(x[i], j);
            }
            if let Step::Free(hi) = step {
                g[hi] += sum(entries_g.as_slice(), &*term_g, x);
            }
            g
        },
    )
}

/// Minimize the free node interval (minimum-time problems).
pub fn minimize_interval(layout: &FreeLayout) -> CollocationResult<Objective> {
    let Some(i) = layout.interval_index() else {
        return Err(CollocationError::config(
            "minimize_interval needs a free node interval",
        ));
    };
    let n = layout.num_free();
    Ok(Objective::new(
        move |x| x[i],
        move |_| {
            let mut g = vec![0.0; n];
            g[i] = 1.0;
            g
        },
    ))
}

/// Quadrature of `r(t)^2` over the named unknown trajectories:
/// `h * sum_k w_k r(k)^2` with the layout's [`FreeLayout::node_weights`].
pub fn control_effort(layout: &FreeLayout, trajectories: &[Symbol]) -> CollocationResult<Objective> {
    let weights = layout.node_weights();
    let mut entries = Vec::new();
    for name in trajectories {
        let r = lookup(layout.trajectories(), name, "an unknown trajectory")?;
        entries.extend(
            weights
                .iter()
                .enumerate()
                .map(|(k, &w)| (layout.trajectory_index(r, k), w)),
        );
    }
    Ok(weighted_sum(layout, entries, |v, _| v * v, |v, _| 2.0 * v))
}

/// `h * sum_k w_k (x(k) - measured(k))^2` over the named states.
pub fn tracking(
    layout: &FreeLayout,
    measurements: &[(Symbol, Vec<f64>)],
) -> CollocationResult<Objective> {
    let n = layout.num_nodes();
    let weights = layout.node_weights();
    let mut entries = Vec::new();
    let mut targets = Vec::new();
    for (name, values) in measurements {
        let s = lookup(layout.states(), name, "a state")?;
        if values.len() != n {
            return Err(CollocationError::config(format!(
                "measurement of '{name}' has {} samples, expected {n}",
                values.len()
            )));
        }
        if let Some(k) = dc_core::first_non_finite(values) {
            return Err(CollocationError::config(format!(
                "measurement of '{name}' is non-finite at node {k}"
            )));
        }
        entries.extend(
            weights
                .iter()
                .enumerate()
                .map(|(k, &w)| (layout.state_index(s, k), w)),
        );
        targets.extend_from_slice(values);
    }
    let targets_g = targets.clone();
    Ok(weighted_sum(
        layout,
        entries,
        move |v, j| (v - targets[j]).powi(2),
        move |v, j| 2.0 * (v - targets_g[j]),
    ))
}

/// Sum of the named free parameters.
pub fn parameter_sum(layout: &FreeLayout, parameters: &[Symbol]) -> CollocationResult<Objective> {
    let indices = parameters
        .iter()
        .map(|name| -> CollocationResult<usize> {
            let p = lookup(layout.parameters(), name, "a free parameter")?;
            Ok(layout.parameter_index(p))
        })
        .collect::<CollocationResult<Vec<usize>>>()?;
    let n = layout.num_free();
    let indices_g = indices.clone();
    Ok(Objective::new(
        move |x| indices.iter().map(|&i| x[i]).sum(),
        move |_| {
            let mut g = vec![0.0; n];
            for &i in &indices_g {
                g[i] += 1.0;
            }
            g
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretize::CollocationMethod;
    use crate::grid::{Interval, NodeGrid};
    use dc_expr::{dynamic_symbols, symbols};

    fn layout(free: bool) -> FreeLayout {
        let interval = if free {
            Interval::Free(Symbol::constant("h"))
        } else {
            Interval::Fixed(0.5)
        };
        FreeLayout::new(
            NodeGrid::new(3, interval).unwrap(),
            dynamic_symbols("x"),
            dynamic_symbols("u"),
            symbols("k"),
        )
    }

    fn check_gradient(obj: &Objective, x: &[f64]) {
        let g = obj.gradient(x);
        for i in 0..x.len() {
            let mut xp = x.to_vec();
            let mut xm = x.to_vec();
            xp[i] += 1e-6;
            xm[i] -= 1e-6;
            let fd = (obj.value(&xp) - obj.value(&xm)) / 2e-6;
            assert!((fd - g[i]).abs() < 1e-6, "entry {i}: {fd} vs {}", g[i]);
        }
    }

    #[test]
    fn control_effort_scales_with_interval() {
        let l = layout(false);
        let obj = control_effort(&l, &dynamic_symbols("u")).unwrap();
        let x = [0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 7.0];
        // Trapezoid: 0.5 * (0.5 * 1 + 4 + 0.5 * 9)
        assert!((obj.value(&x) - 4.5).abs() < 1e-12);
        check_gradient(&obj, &x);

        let l = layout(true);
        let obj = control_effort(&l, &dynamic_symbols("u")).unwrap();
        check_gradient(&obj, &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 7.0, 0.3]);
    }

    #[test]
    fn tracking_and_parameter_sum_gradients() {
        let l = layout(true);
        let obj = tracking(&l, &[(Symbol::dynamic("x"), vec![1.0, 0.5, 0.0])]).unwrap();
        check_gradient(&obj, &[0.9, 0.7, 0.1, 0.0, 0.0, 0.0, 1.0, 0.2]);
        let obj = parameter_sum(&l, &symbols("k")).unwrap();
        assert_eq!(obj.value(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0, 0.2]), 4.0);
    }

    #[test]
    fn backward_euler_skips_the_first_node() {
        let l = layout(false).with_method(CollocationMethod::BackwardEuler);
        assert_eq!(l.node_weights(), vec![0.0, 1.0, 1.0]);
        let obj = control_effort(&l, &dynamic_symbols("u")).unwrap();
        let x = [0.0, 0.0, 0.0, 100.0, 2.0, 3.0, 7.0];
        assert!((obj.value(&x) - 0.5 * 13.0).abs() < 1e-12);
        assert_eq!(obj.gradient(&x)[3], 0.0);
    }

    #[test]
    fn repeated_names_count_in_value_and_gradient() {
        let l = layout(false);
        let once = control_effort(&l, &dynamic_symbols("u")).unwrap();
        let twice = control_effort(&l, &[Symbol::dynamic("u"), Symbol::dynamic("u")]).unwrap();
        let x = [0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 7.0];
        assert!((twice.value(&x) - 2.0 * once.value(&x)).abs() < 1e-12);
        check_gradient(&twice, &x);

        let data = vec![1.0, 0.5, 0.0];
        let obj = tracking(
            &l,
            &[(Symbol::dynamic("x"), data.clone()), (Symbol::dynamic("x"), data)],
        )
        .unwrap();
        check_gradient(&obj, &[0.9, 0.7, 0.1, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn helpers_reject_unknown_names() {
        let l = layout(false);
        assert!(control_effort(&l, &dynamic_symbols("x")).is_err());
        assert!(tracking(&l, &[(Symbol::dynamic("x"), vec![1.0])]).is_err());
        assert!(minimize_interval(&l).is_err());
        assert!(minimize_interval(&layout(true)).is_ok());
    }

    #[test]
    fn gradient_length_is_validated() {
        let obj = Objective::new(|_| 0.0, |_| vec![0.0; 2]);
        assert!(obj.validate(3).is_err());
        assert!(obj.validate(2).is_ok());
    }
}
