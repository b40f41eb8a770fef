//! Transcription checks that need no solver: defect values on known
//! trajectories and the analytic Jacobian against finite differences.

use std::collections::BTreeMap;

use dc_collocation::{
    CollocationMethod, EquationsOfMotion, EvalBackend, InstanceConstraint, Interval,
    PathConstraint, Problem, ProblemBuilder,
};
use dc_expr::{Expr, Symbol};
use dc_nlp::{EvalError, NlpProblem, central_difference_jacobian};
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

fn zero_objective(builder: ProblemBuilder) -> ProblemBuilder {
    builder.objective(|_| 0.0, |x| vec![0.0; x.len()])
}

fn decay(num_nodes: usize, method: CollocationMethod) -> Problem {
    let x = Symbol::dynamic("x");
    let h = 1.0 / (num_nodes - 1) as f64;
    let builder = ProblemBuilder::new(
        vec![x.der() + x.expr()],
        vec![x.clone()],
        num_nodes,
        Interval::Fixed(h),
    )
    .integration_method(method);
    zero_objective(builder).build().unwrap()
}

fn max_defect_on_exact_decay(num_nodes: usize, method: CollocationMethod) -> f64 {
    let problem = decay(num_nodes, method);
    let h = 1.0 / (num_nodes - 1) as f64;
    let x: Vec<f64> = (0..num_nodes).map(|k| (-(k as f64) * h).exp()).collect();
    problem.constraint_violations(&x).unwrap().max_abs()
}

#[test]
fn constant_trajectory_has_zero_defects() {
    let x = Symbol::dynamic("x");
    let y = Symbol::dynamic("y");
    let builder = ProblemBuilder::new(
        vec![x.der(), y.der()],
        vec![x.clone(), y.clone()],
        7,
        Interval::Fixed(0.3),
    );
    let problem = zero_objective(builder).build().unwrap();
    let mut guess = vec![2.5; 7];
    guess.extend(vec![-1.0; 7]);
    let violations = problem.constraint_violations(&guess).unwrap();
    assert_eq!(violations.defects.shape(), (2, 6));
    assert_eq!(violations.max_abs(), 0.0);
}

#[test]
fn backward_euler_defects_are_first_order() {
    let coarse = max_defect_on_exact_decay(11, CollocationMethod::BackwardEuler);
    let fine = max_defect_on_exact_decay(21, CollocationMethod::BackwardEuler);
    let finer = max_defect_on_exact_decay(41, CollocationMethod::BackwardEuler);
    for ratio in [coarse / fine, fine / finer] {
        assert!((1.8..2.2).contains(&ratio), "ratio {ratio}");
    }
}

#[test]
fn midpoint_defects_are_second_order() {
    let coarse = max_defect_on_exact_decay(11, CollocationMethod::Midpoint);
    let fine = max_defect_on_exact_decay(21, CollocationMethod::Midpoint);
    let finer = max_defect_on_exact_decay(41, CollocationMethod::Midpoint);
    for ratio in [coarse / fine, fine / finer] {
        assert!((3.6..4.4).contains(&ratio), "ratio {ratio}");
    }
}

#[test]
fn constraint_rows_are_ordered_defects_instance_path() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let builder = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        5,
        Interval::Fixed(0.25),
    )
    .instance_constraints([x.at(0.0), x.at(1.0) - 1.0])
    .path_constraints(vec![PathConstraint::new(u.expr(), -1.0, 1.0)])
    .free_symbols([u.clone()]);
    let problem = zero_objective(builder).build().unwrap();

    assert_eq!(problem.num_free(), 10);
    assert_eq!(problem.num_constraints(), 4 + 2 + 5);
    let mut lower = vec![0.0; 11];
    let mut upper = vec![0.0; 11];
    problem.constraint_bounds(&mut lower, &mut upper);
    assert_eq!(&lower[..6], &[0.0; 6]);
    assert_eq!(&upper[6..], &[1.0; 5]);

    use dc_collocation::ConstraintLocation::*;
    assert_eq!(
        problem.locate_row(3),
        Some(Defect {
            equation: 0,
            interval: 3
        })
    );
    assert_eq!(
        problem.locate_row(5),
        Some(Instance {
            index: 1,
            node: Some(4)
        })
    );
    assert_eq!(problem.locate_row(8), Some(Path { index: 0, node: 2 }));
    assert_eq!(problem.locate_row(11), None);
}

/// Two-state oscillator in mass-matrix form with a free node interval, time
/// dependence, known and unknown inputs, and every constraint kind.
fn oscillator(backend: EvalBackend) -> Problem {
    let [x, v, u, w] = ["x", "v", "u", "w"].map(Symbol::dynamic);
    let [c, k, h, t] = ["c", "k", "h", "t"].map(Symbol::constant);
    let n = 6;

    let mass = vec![
        vec![1.0 + x.expr() * &x, Expr::from(0.0)],
        vec![Expr::from(0.0), Expr::from(2.0)],
    ];
    let forcing = vec![
        v.expr(),
        -(&k * &x) - &c * &v + &u + &w * t.expr().cos(),
    ];
    let known_trajectories = BTreeMap::from([(
        w.clone(),
        (0..n).map(|i| 0.3 * i as f64 - 0.5).collect::<Vec<_>>(),
    )]);
    let builder = ProblemBuilder::new(
        EquationsOfMotion::mass_matrix(mass, forcing),
        vec![x.clone(), v.clone()],
        n,
        Interval::Free(h.clone()),
    )
    .known_parameters(BTreeMap::from([(k.clone(), 1.7)]))
    .known_trajectories(known_trajectories)
    .instance_constraints([
        InstanceConstraint::with_target(x.at(0.0), 1.0),
        InstanceConstraint::equality(x.at(0.0) * &c - v.at(2.0 * &h)),
    ])
    .path_constraints(vec![PathConstraint::new(&u * &u + &x, -10.0, 10.0)])
    .free_symbols([u.clone(), c.clone()])
    .eval_backend(backend);
    zero_objective(builder).build().unwrap()
}

fn dense_jacobian(problem: &Problem, x: &[f64]) -> DMatrix<f64> {
    let (rows, cols) = problem.jacobian_structure();
    let mut values = vec![0.0; rows.len()];
    problem.jacobian_values(x, &mut values).unwrap();
    let mut dense = DMatrix::zeros(problem.num_constraints(), problem.num_free());
    for ((&r, &c), v) in rows.iter().zip(&cols).zip(values) {
        dense[(r, c)] += v;
    }
    dense
}

fn numeric_jacobian(problem: &Problem, x: &[f64]) -> DMatrix<f64> {
    let m = problem.num_constraints();
    central_difference_jacobian(
        &DVector::from_column_slice(x),
        |p: &DVector<f64>| {
            let mut g = vec![0.0; m];
            problem.constraints(p.as_slice(), &mut g)?;
            Ok::<_, EvalError>(DVector::from_vec(g))
        },
        1e-6,
    )
    .unwrap()
}

#[test]
fn oscillator_layout_counts() {
    let problem = oscillator(EvalBackend::Serial);
    let layout = problem.layout();
    assert_eq!(layout.num_states(), 2);
    assert_eq!(layout.num_trajectories(), 1);
    assert_eq!(layout.num_parameters(), 1);
    assert!(layout.has_free_interval());
    assert_eq!(problem.num_free(), 2 * 6 + 6 + 1 + 1);
    assert_eq!(problem.num_constraints(), 2 * 5 + 2 + 6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn analytic_jacobian_matches_central_differences(
        values in prop::collection::vec(-1.0f64..1.0, 20),
        h in 0.1f64..0.5,
        parallel in any::<bool>(),
    ) {
        let backend = if parallel { EvalBackend::Parallel } else { EvalBackend::Serial };
        let problem = oscillator(backend);
        let mut x = values;
        let hi = problem.layout().interval_index().unwrap();
        x[hi] = h;

        let analytic = dense_jacobian(&problem, &x);
        let numeric = numeric_jacobian(&problem, &x);
        for r in 0..analytic.nrows() {
            for c in 0..analytic.ncols() {
                let (a, n) = (analytic[(r, c)], numeric[(r, c)]);
                prop_assert!(
                    (a - n).abs() <= 1e-5 * a.abs().max(1.0),
                    "entry ({}, {}): analytic {} numeric {}", r, c, a, n
                );
            }
        }
    }

    #[test]
    fn backends_agree(values in prop::collection::vec(-1.0f64..1.0, 20), h in 0.1f64..0.5) {
        let serial = oscillator(EvalBackend::Serial);
        let parallel = oscillator(EvalBackend::Parallel);
        let mut x = values;
        x[serial.layout().interval_index().unwrap()] = h;

        let m = serial.num_constraints();
        let (mut a, mut b) = (vec![0.0; m], vec![0.0; m]);
        serial.constraints(&x, &mut a).unwrap();
        parallel.constraints(&x, &mut b).unwrap();
        prop_assert_eq!(a, b);
        prop_assert_eq!(dense_jacobian(&serial, &x), dense_jacobian(&parallel, &x));
    }
}
