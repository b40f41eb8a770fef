//! End-to-end solves with the bundled interior-point backend.

use std::collections::BTreeMap;

use dc_collocation::{
    CollocationError, CollocationMethod, ConstraintLocation, EquationsOfMotion, Interval,
    ProblemBuilder, SolveOptions, control_effort, tracking,
};
use dc_expr::{Expr, Symbol};
use dc_nlp::SolveStatus;

fn options(max_iterations: usize) -> SolveOptions {
    let mut options = SolveOptions::default();
    options.ipm.max_iterations = max_iterations;
    options
}

#[test]
fn single_integrator_reaches_target_with_constant_control() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let effort = u.clone();
    let problem = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        21,
        Interval::Fixed(0.05),
    )
    .integration_method(CollocationMethod::BackwardEuler)
    .instance_constraints([x.at(0.0), x.at(1.0) - 1.0])
    .free_symbols([u.clone()])
    .objective_from(move |layout| control_effort(layout, &[effort]))
    .build()
    .unwrap();

    let solution = problem.solve(&vec![0.0; problem.num_free()]).unwrap();
    assert_eq!(solution.status(), SolveStatus::Converged);

    let states = solution.free.state("x").unwrap();
    let control = solution.free.trajectory("u").unwrap();
    for (k, (&xk, &uk)) in states.iter().zip(&control).enumerate() {
        assert!((xk - 0.05 * k as f64).abs() < 1e-3, "x[{k}] = {xk}");
        // u(0) never enters a backward Euler defect.
        if k > 0 {
            assert!((uk - 1.0).abs() < 1e-3, "u[{k}] = {uk}");
        }
    }
    assert!(!solution.diagnostics.objective_trace.is_empty());
}

#[test]
fn bounds_hold_at_the_solution() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let n = 11;
    let ramp: Vec<f64> = (0..n).map(|k| 0.2 * k as f64).collect();
    let tracked = x.clone();
    let problem = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        n,
        Interval::Fixed(0.1),
    )
    .integration_method(CollocationMethod::BackwardEuler)
    .instance_constraints([x.at(0.0)])
    .bounds(BTreeMap::from([(u.clone(), (-1.0, 1.0))]))
    .objective_from(move |layout| tracking(layout, &[(tracked, ramp)]))
    .build()
    .unwrap();

    let solution = problem.solve(&vec![0.0; problem.num_free()]).unwrap();
    assert_eq!(solution.status(), SolveStatus::Converged);
    let control = solution.free.trajectory("u").unwrap();
    for (k, &uk) in control.iter().enumerate() {
        assert!((-1.0..=1.0).contains(&uk), "u[{k}] = {uk}");
        if k > 0 {
            assert!(uk > 1.0 - 1e-3, "u[{k}] = {uk}");
        }
    }
}

#[test]
fn midpoint_effort_gives_uniform_control() {
    // x' = u, x(0) = 0, x(T) = 1, minimize the integral of u^2: u = 1/T.
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let effort = u.clone();
    let problem = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        21,
        Interval::Fixed(0.05),
    )
    .instance_constraints([x.at(0.0), x.at(1.0) - 1.0])
    .free_symbols([u.clone()])
    .objective_from(move |layout| control_effort(layout, &[effort]))
    .build()
    .unwrap();
    assert_eq!(problem.layout().method(), CollocationMethod::Midpoint);

    let solution = problem.solve(&vec![0.0; problem.num_free()]).unwrap();
    assert_eq!(solution.status(), SolveStatus::Converged);
    let control = solution.free.trajectory("u").unwrap();
    for (k, &uk) in control.iter().enumerate() {
        assert!((uk - 1.0).abs() < 1e-3, "u[{k}] = {uk}");
    }
    // Integral of 1^2 over [0, 1].
    assert!((solution.diagnostics.objective - 1.0).abs() < 1e-3);
}

#[test]
fn bounds_hold_from_an_infeasible_guess() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let n = 11;
    let ramp: Vec<f64> = (0..n).map(|k| 0.2 * k as f64).collect();
    let tracked = x.clone();
    for method in [CollocationMethod::BackwardEuler, CollocationMethod::Midpoint] {
        let problem = ProblemBuilder::new(
            vec![x.der() - &u],
            vec![x.clone()],
            n,
            Interval::Fixed(0.1),
        )
        .integration_method(method)
        .instance_constraints([x.at(0.0)])
        .bounds(BTreeMap::from([
            (x.clone(), (0.0, 0.45)),
            (u.clone(), (-1.0, 1.0)),
        ]))
        .objective_from({
            let tracked = tracked.clone();
            let ramp = ramp.clone();
            move |layout| tracking(layout, &[(tracked, ramp)])
        })
        .build()
        .unwrap();

        // Every entry starts far outside its bounds.
        let solution = problem.solve(&vec![5.0; problem.num_free()]).unwrap();
        assert_eq!(solution.status(), SolveStatus::Converged, "{method:?}");
        let states = solution.free.state("x").unwrap();
        let control = solution.free.trajectory("u").unwrap();
        for (k, (&xk, &uk)) in states.iter().zip(&control).enumerate() {
            assert!((0.0..=0.45).contains(&xk), "{method:?} x[{k}] = {xk}");
            assert!((-1.0..=1.0).contains(&uk), "{method:?} u[{k}] = {uk}");
        }
        // The ramp outruns the control, so x saturates at its upper bound.
        assert!((states[n - 1] - 0.45).abs() < 1e-4, "{method:?} x[N-1] = {}", states[n - 1]);
    }
}

#[test]
fn contradictory_initial_conditions_do_not_converge() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let effort = u.clone();
    let problem = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        6,
        Interval::Fixed(0.2),
    )
    .instance_constraints([x.at(0.0), x.at(0.0) - 1.0])
    .free_symbols([u.clone()])
    .objective_from(move |layout| control_effort(layout, &[effort]))
    .solve_options(options(200))
    .build()
    .unwrap();

    let solution = problem.solve(&vec![0.0; problem.num_free()]).unwrap();
    assert_ne!(solution.status(), SolveStatus::Converged);
}

#[test]
fn non_finite_defect_is_located() {
    let x = Symbol::dynamic("x");
    let problem = ProblemBuilder::new(
        vec![x.der() - x.expr().ln()],
        vec![x.clone()],
        5,
        Interval::Fixed(0.25),
    )
    .objective(|_| 0.0, |x| vec![0.0; x.len()])
    .build()
    .unwrap();

    let err = problem.solve(&[-1.0; 5]).unwrap_err();
    match err {
        CollocationError::Numerical { location, .. } => assert_eq!(
            location,
            Some(ConstraintLocation::Defect {
                equation: 0,
                interval: 0
            })
        ),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn singular_mass_matrix_is_a_discretization_error() {
    let x = Symbol::dynamic("x");
    let problem = ProblemBuilder::new(
        EquationsOfMotion::mass_matrix(vec![vec![x.expr()]], vec![Expr::from(1.0)]),
        vec![x.clone()],
        4,
        Interval::Fixed(0.5),
    )
    .integration_method(CollocationMethod::BackwardEuler)
    .objective(|_| 0.0, |x| vec![0.0; x.len()])
    .build()
    .unwrap();

    let err = problem.solve(&[1.0, 0.0, 1.0, 1.0]).unwrap_err();
    match err {
        CollocationError::Discretization { node, .. } => assert_eq!(node, Some(1)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn warm_start_from_previous_solution() {
    let x = Symbol::dynamic("x");
    let u = Symbol::dynamic("u");
    let effort = u.clone();
    let mut problem = ProblemBuilder::new(
        vec![x.der() - &u],
        vec![x.clone()],
        11,
        Interval::Fixed(0.1),
    )
    .integration_method(CollocationMethod::BackwardEuler)
    .instance_constraints([x.at(0.0), x.at(1.0) - 1.0])
    .free_symbols([u.clone()])
    .objective_from(move |layout| control_effort(layout, &[effort]))
    .build()
    .unwrap();

    let first = problem.solve(&vec![0.0; problem.num_free()]).unwrap();
    assert_eq!(first.status(), SolveStatus::Converged);

    problem.set_bounds(&u, (-0.5, 2.0)).unwrap();
    let second = problem.solve(&first.x).unwrap();
    assert_eq!(second.status(), SolveStatus::Converged);
    for (a, b) in first.x.iter().zip(&second.x) {
        assert!((a - b).abs() < 1e-4);
    }
}

#[test]
fn gradient_check_flags_wrong_gradient() {
    let x = Symbol::dynamic("x");
    let p = Symbol::constant("p");
    let problem = ProblemBuilder::new(
        vec![x.der() - &p],
        vec![x.clone()],
        3,
        Interval::Fixed(1.0),
    )
    .free_symbols([p.clone()])
    .objective(
        |x| x.iter().map(|v| v * v).sum(),
        |x| {
            let mut g: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
            g[2] += 3.0;
            g
        },
    )
    .build()
    .unwrap();

    let check = problem.check_gradient(&[1.0, 2.0, 3.0, 0.5]).unwrap();
    assert!(!check.passed);
    assert_eq!(check.worst_entry, Some(2));
    assert!((check.max_abs_error - 3.0).abs() < 1e-6);
}
