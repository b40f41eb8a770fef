//! Primal-dual interior point method with a filter line search.
//!
//! Inequality rows get a slack `s` so that every constraint becomes an
//! equality `c(z) = 0` over `z = (x, s)` with simple bounds on `z`. Each
//! iteration solves the regularized primal-dual system
//!
//! ```text
//! [ W + Σ + δw·I    Jᵀ   ] [ dz ]     [ ∇φ_μ ]
//! [     J         -δc·I  ] [ λ⁺ ] = - [  c   ]
//! ```
//!
//! densely with an LU factorization. `W` is the Lagrangian Hessian obtained by
//! forward differences of `∇f + Jᵀλ`. The dense factorization limits this
//! backend to small and medium problems; larger ones should plug a sparse
//! solver in through [`NlpSolver`].

use dc_core::inf_norm;
use dc_core::timing::eval_timing;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::error::{NlpError, NlpResult, Quantity};
use crate::jacobian::{add_transpose_product, dense_from_triplets, finite_difference_jacobian};
use crate::options::IpmOptions;
use crate::problem::{EvalError, INFINITE_BOUND, NlpProblem, NlpSolver};
use crate::solution::{NlpSolution, SolveDiagnostics, SolveStatus};

/// Barrier error must drop below this multiple of μ before μ is decreased.
const BARRIER_TOL_FACTOR: f64 = 10.0;
/// Bound multipliers are kept within this factor of their central values.
const KAPPA_SIGMA: f64 = 1e10;
const CURVATURE_TOL: f64 = 1e-10;
const SCALING_MAX: f64 = 100.0;

// Filter constants.
const GAMMA_THETA: f64 = 1e-5;
const GAMMA_PHI: f64 = 1e-8;
const GAMMA_ALPHA: f64 = 0.05;
const S_THETA: f64 = 1.1;
const S_PHI: f64 = 2.3;
const DELTA_SWITCH: f64 = 1.0;

/// Iterations without progress in the constraint violation before an
/// infeasible solve is abandoned.
const STALL_WINDOW: usize = 25;
/// Consecutive unchecked full steps allowed after the line search fails at a
/// feasible point.
const WATCHDOG_STEPS: usize = 3;

/// The bundled dense interior-point backend.
#[derive(Clone, Debug, Default)]
pub struct InteriorPoint {
    pub options: IpmOptions,
}

impl InteriorPoint {
    pub fn new(options: IpmOptions) -> Self {
        Self { options }
    }
}

impl NlpSolver for InteriorPoint {
    fn solve(&self, problem: &dyn NlpProblem, x0: &[f64]) -> NlpResult<NlpSolution> {
        Ipm::new(problem, &self.options)?.run(x0)
    }
}

/// Objective/constraint values at a point.
struct Values {
    f: f64,
    g: Vec<f64>,
}

/// First derivatives at a point.
struct Derivs {
    grad: Vec<f64>,
    jac: Vec<f64>,
}

/// Termination-relevant error measures at the current iterate.
struct Errors {
    primal: f64,
    dual: f64,
    dual_scaled: f64,
    compl_scaled: f64,
    barrier_compl_scaled: f64,
}

impl Errors {
    fn overall(&self) -> f64 {
        self.dual_scaled.max(self.primal).max(self.compl_scaled)
    }

    fn barrier(&self) -> f64 {
        self.dual_scaled.max(self.primal).max(self.barrier_compl_scaled)
    }
}

struct Best {
    x: Vec<f64>,
    lam: Vec<f64>,
    f: f64,
    violation: f64,
}

struct Ipm<'a> {
    problem: &'a dyn NlpProblem,
    opts: &'a IpmOptions,
    n: usize,
    m: usize,
    nz: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    /// Variable bounds as given, for reporting violations.
    xl: Vec<f64>,
    xu: Vec<f64>,
    gl: Vec<f64>,
    gu: Vec<f64>,
    /// Slack index for inequality rows.
    slack_of_row: Vec<Option<usize>>,
    /// Bounds on z = (x, s); infinite when absent.
    lower: Vec<f64>,
    upper: Vec<f64>,
    trace: Vec<f64>,
    iteration: usize,
}

fn finite_or(b: f64, inf: f64) -> f64 {
    if b.abs() >= INFINITE_BOUND { inf } else { b }
}

/// Widen finite bounds by `factor` relative to their magnitude.
fn relax(l: f64, u: f64, factor: f64) -> (f64, f64) {
    let l = if l.is_finite() { l - factor * l.abs().max(1.0) } else { l };
    let u = if u.is_finite() { u + factor * u.abs().max(1.0) } else { u };
    (l, u)
}

/// A direction too small to change any component in floating point.
fn is_tiny_step(z: &[f64], dz: &[f64]) -> bool {
    z.iter()
        .zip(dz)
        .all(|(zi, di)| di.abs() <= 10.0 * f64::EPSILON * (1.0 + zi.abs()))
}

/// Push `v` strictly inside `[l, u]`.
fn push_inside(v: f64, l: f64, u: f64, push: f64, frac: f64) -> f64 {
    let mut v = v;
    let both = l.is_finite() && u.is_finite();
    if l.is_finite() {
        let mut p = push * l.abs().max(1.0);
        if both {
            p = p.min(frac * (u - l));
        }
        v = v.max(l + p);
    }
    if u.is_finite() {
        let mut p = push * u.abs().max(1.0);
        if both {
            p = p.min(frac * (u - l));
        }
        v = v.min(u - p);
    }
    if both && !(v > l && v < u) {
        v = 0.5 * (l + u);
    }
    v
}

impl<'a> Ipm<'a> {
    fn new(problem: &'a dyn NlpProblem, opts: &'a IpmOptions) -> NlpResult<Self> {
        let n = problem.num_variables();
        let m = problem.num_constraints();

        let mut xl = vec![0.0; n];
        let mut xu = vec![0.0; n];
        problem.variable_bounds(&mut xl, &mut xu);
        let mut gl = vec![0.0; m];
        let mut gu = vec![0.0; m];
        problem.constraint_bounds(&mut gl, &mut gu);

        for j in 0..n {
            if xl[j].is_nan() || xu[j].is_nan() || xl[j] > xu[j] {
                return Err(NlpError::InvalidProblem {
                    what: format!("variable {j} has lower bound {} above upper bound {}", xl[j], xu[j]),
                });
            }
        }
        for r in 0..m {
            if gl[r].is_nan() || gu[r].is_nan() || gl[r] > gu[r] {
                return Err(NlpError::InvalidProblem {
                    what: format!("constraint {r} has lower bound {} above upper bound {}", gl[r], gu[r]),
                });
            }
        }

        let (rows, cols) = problem.jacobian_structure();
        if rows.len() != cols.len() {
            return Err(NlpError::InvalidProblem {
                what: format!("jacobian structure has {} rows but {} cols", rows.len(), cols.len()),
            });
        }
        if let Some(k) = (0..rows.len()).find(|&k| rows[k] >= m || cols[k] >= n) {
            return Err(NlpError::InvalidProblem {
                what: format!("jacobian entry {k} at ({}, {}) is outside {m}x{n}", rows[k], cols[k]),
            });
        }

        let mut slack_of_row = vec![None; m];
        let mut ns = 0;
        for r in 0..m {
            if gl[r] != gu[r] {
                slack_of_row[r] = Some(ns);
                ns += 1;
            }
        }
        let nz = n + ns;

        let mut lower = Vec::with_capacity(nz);
        let mut upper = Vec::with_capacity(nz);
        let factor = opts.bound_relax_factor;
        for j in 0..n {
            let (l, u) = relax(
                finite_or(xl[j], f64::NEG_INFINITY),
                finite_or(xu[j], f64::INFINITY),
                factor,
            );
            lower.push(l);
            upper.push(u);
        }
        for r in 0..m {
            if slack_of_row[r].is_some() {
                let (l, u) = relax(
                    finite_or(gl[r], f64::NEG_INFINITY),
                    finite_or(gu[r], f64::INFINITY),
                    factor,
                );
                lower.push(l);
                upper.push(u);
            }
        }

        Ok(Self {
            problem,
            opts,
            n,
            m,
            nz,
            rows,
            cols,
            xl,
            xu,
            gl,
            gu,
            slack_of_row,
            lower,
            upper,
            trace: Vec::new(),
            iteration: 0,
        })
    }

    fn eval_error(&self, quantity: Quantity, source: EvalError) -> NlpError {
        NlpError::Evaluation {
            iteration: self.iteration,
            quantity,
            source,
            trace: self.trace.clone(),
        }
    }

    fn non_finite(&self, quantity: Quantity, index: Option<usize>) -> NlpError {
        NlpError::NonFinite {
            iteration: self.iteration,
            quantity,
            index,
            trace: self.trace.clone(),
        }
    }

    fn values(&self, x: &[f64]) -> NlpResult<Values> {
        let f = eval_timing::OBJECTIVE
            .time(|| self.problem.objective(x))
            .map_err(|e| self.eval_error(Quantity::Objective, e))?;
        if !f.is_finite() {
            return Err(self.non_finite(Quantity::Objective, None));
        }
        let mut g = vec![0.0; self.m];
        eval_timing::CONSTRAINTS
            .time(|| self.problem.constraints(x, &mut g))
            .map_err(|e| self.eval_error(Quantity::Constraints, e))?;
        if let Some(i) = dc_core::first_non_finite(&g) {
            return Err(self.non_finite(Quantity::Constraints, Some(i)));
        }
        Ok(Values { f, g })
    }

    /// Gradient and Jacobian. Failures during Hessian probes are reported as
    /// [`Quantity::Hessian`].
    fn derivs(&self, x: &[f64], hessian_probe: bool) -> NlpResult<Derivs> {
        let tag = |q| if hessian_probe { Quantity::Hessian } else { q };
        let mut grad = vec![0.0; self.n];
        eval_timing::GRADIENT
            .time(|| self.problem.gradient(x, &mut grad))
            .map_err(|e| self.eval_error(tag(Quantity::Gradient), e))?;
        if let Some(i) = dc_core::first_non_finite(&grad) {
            return Err(self.non_finite(tag(Quantity::Gradient), Some(i)));
        }
        let mut jac = vec![0.0; self.rows.len()];
        eval_timing::JACOBIAN
            .time(|| self.problem.jacobian_values(x, &mut jac))
            .map_err(|e| self.eval_error(tag(Quantity::Jacobian), e))?;
        if let Some(i) = dc_core::first_non_finite(&jac) {
            return Err(self.non_finite(tag(Quantity::Jacobian), Some(i)));
        }
        Ok(Derivs { grad, jac })
    }

    /// Equality form of the constraints over z.
    fn residual(&self, z: &[f64], g: &[f64]) -> Vec<f64> {
        (0..self.m)
            .map(|r| match self.slack_of_row[r] {
                Some(k) => g[r] - z[self.n + k],
                None => g[r] - self.gl[r],
            })
            .collect()
    }

    fn barrier_value(&self, f: f64, z: &[f64], mu: f64) -> f64 {
        let mut phi = f;
        for j in 0..self.nz {
            if self.lower[j].is_finite() {
                phi -= mu * (z[j] - self.lower[j]).ln();
            }
            if self.upper[j].is_finite() {
                phi -= mu * (self.upper[j] - z[j]).ln();
            }
        }
        phi
    }

    fn barrier_gradient(&self, grad: &[f64], z: &[f64], mu: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.nz];
        out[..self.n].copy_from_slice(grad);
        for j in 0..self.nz {
            if self.lower[j].is_finite() {
                out[j] -= mu / (z[j] - self.lower[j]);
            }
            if self.upper[j].is_finite() {
                out[j] += mu / (self.upper[j] - z[j]);
            }
        }
        out
    }

    /// `∇f + Jᵀλ` with respect to x.
    fn lagrangian_gradient(&self, d: &Derivs, lam: &[f64]) -> Vec<f64> {
        let mut out = d.grad.clone();
        add_transpose_product(&self.rows, &self.cols, &d.jac, lam, &mut out);
        out
    }

    /// Dense Jacobian of the equality form over z.
    fn dense_jacobian(&self, jac: &[f64]) -> DMatrix<f64> {
        let mut out = dense_from_triplets(self.m, self.nz, &self.rows, &self.cols, jac);
        for r in 0..self.m {
            if let Some(k) = self.slack_of_row[r] {
                out[(r, self.n + k)] = -1.0;
            }
        }
        out
    }

    fn hessian(&self, x: &[f64], lam: &[f64]) -> NlpResult<DMatrix<f64>> {
        eval_timing::HESSIAN.time(|| {
            let xv = DVector::from_column_slice(x);
            let h = finite_difference_jacobian(
                &xv,
                |p: &DVector<f64>| -> NlpResult<DVector<f64>> {
                    let d = self.derivs(p.as_slice(), true)?;
                    Ok(DVector::from_vec(self.lagrangian_gradient(&d, lam)))
                },
                self.opts.hessian_epsilon,
            )?;
            Ok((&h + h.transpose()) * 0.5)
        })
    }

    /// Largest violation of the original constraints and variable bounds.
    fn violation(&self, x: &[f64], g: &[f64]) -> f64 {
        let mut v: f64 = 0.0;
        for j in 0..self.n {
            v = v.max(self.xl[j] - x[j]).max(x[j] - self.xu[j]);
        }
        for r in 0..self.m {
            v = v.max(self.gl[r] - g[r]).max(g[r] - self.gu[r]);
        }
        v
    }

    #[allow(clippy::too_many_arguments)]
    fn errors(
        &self,
        z: &[f64],
        c: &[f64],
        grad_lag_z: &[f64],
        lam: &[f64],
        vl: &[f64],
        vu: &[f64],
        mu: f64,
    ) -> Errors {
        let mut compl: f64 = 0.0;
        let mut compl_mu: f64 = 0.0;
        for j in 0..self.nz {
            if self.lower[j].is_finite() {
                let p = (z[j] - self.lower[j]) * vl[j];
                compl = compl.max(p.abs());
                compl_mu = compl_mu.max((p - mu).abs());
            }
            if self.upper[j].is_finite() {
                let p = (self.upper[j] - z[j]) * vu[j];
                compl = compl.max(p.abs());
                compl_mu = compl_mu.max((p - mu).abs());
            }
        }

        let mult_sum: f64 = lam.iter().chain(vl).chain(vu).map(|v| v.abs()).sum();
        let bound_sum: f64 = vl.iter().chain(vu).map(|v| v.abs()).sum();
        let count = (self.m + 2 * self.nz).max(1) as f64;
        let s_d = (mult_sum / count).max(SCALING_MAX) / SCALING_MAX;
        let s_c = (bound_sum / (2 * self.nz).max(1) as f64).max(SCALING_MAX) / SCALING_MAX;

        let dual = inf_norm(grad_lag_z);
        Errors {
            primal: inf_norm(c),
            dual,
            dual_scaled: dual / s_d,
            compl_scaled: compl / s_c,
            barrier_compl_scaled: compl_mu / s_c,
        }
    }

    /// Largest α in (0, 1] keeping `v + α dv` a fraction τ away from `bound`.
    fn fraction_to_boundary(&self, z: &[f64], dz: &[f64], tau: f64) -> f64 {
        let mut alpha: f64 = 1.0;
        for j in 0..self.nz {
            if self.lower[j].is_finite() && dz[j] < 0.0 {
                alpha = alpha.min(-tau * (z[j] - self.lower[j]) / dz[j]);
            }
            if self.upper[j].is_finite() && dz[j] > 0.0 {
                alpha = alpha.min(tau * (self.upper[j] - z[j]) / dz[j]);
            }
        }
        alpha
    }

    fn multiplier_step_bound(v: &[f64], dv: &[f64], tau: f64) -> f64 {
        let mut alpha: f64 = 1.0;
        for (vi, di) in v.iter().zip(dv) {
            if *di < 0.0 && *vi > 0.0 {
                alpha = alpha.min(-tau * vi / di);
            }
        }
        alpha
    }

    /// Curvature of the primal block along the component of `dz` tangent to
    /// the linearized constraints.
    fn curvature_ok(&self, hess: &DMatrix<f64>, sigma: &[f64], delta_w: f64, jt: &DMatrix<f64>, dz: &DVector<f64>) -> bool {
        let mut dt = dz.clone();
        if self.m > 0 {
            let a = jt * dz;
            let mut jjt = jt * jt.transpose();
            for i in 0..self.m {
                jjt[(i, i)] += 1e-12;
            }
            if let Some(y) = jjt.lu().solve(&a) {
                dt -= jt.transpose() * y;
            }
        }
        let tnorm2 = dt.norm_squared();
        if tnorm2.sqrt() <= 1e-10 * (1.0 + dz.norm()) {
            return true;
        }
        let xpart = dt.rows(0, self.n);
        let mut curv = (xpart.transpose() * hess * xpart)[(0, 0)];
        for j in 0..self.nz {
            curv += (sigma[j] + delta_w) * dt[j] * dt[j];
        }
        curv >= CURVATURE_TOL * tnorm2
    }

    fn assemble_kkt(&self, hess: &DMatrix<f64>, sigma: &[f64], jt: &DMatrix<f64>, delta_w: f64, delta_c: f64) -> DMatrix<f64> {
        let (n, nz, m) = (self.n, self.nz, self.m);
        let mut kkt = DMatrix::zeros(nz + m, nz + m);
        kkt.view_mut((0, 0), (n, n)).copy_from(hess);
        for j in 0..nz {
            kkt[(j, j)] += sigma[j] + delta_w;
        }
        if m > 0 {
            kkt.view_mut((nz, 0), (m, nz)).copy_from(jt);
            kkt.view_mut((0, nz), (nz, m)).copy_from(&jt.transpose());
            for r in 0..m {
                kkt[(nz + r, nz + r)] = -delta_c;
            }
        }
        kkt
    }

    fn solve_kkt(kkt: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        eval_timing::KKT_SOLVE.time(|| {
            let sol = kkt.clone().lu().solve(rhs)?;
            if sol.iter().any(|v| !v.is_finite()) {
                return None;
            }
            let residual = (&kkt * &sol - rhs).amax();
            let scale = kkt.amax() * sol.amax() + rhs.amax();
            (residual <= 1e-8 * scale.max(1.0)).then_some(sol)
        })
    }

    fn run(mut self, x0: &[f64]) -> NlpResult<NlpSolution> {
        let opts = self.opts;
        let (n, m, nz) = (self.n, self.m, self.nz);
        if x0.len() != n {
            return Err(NlpError::InvalidProblem {
                what: format!("initial guess has length {} but the problem has {n} variables", x0.len()),
            });
        }

        // Starting point.
        let mut z = vec![0.0; nz];
        let mut outside = 0usize;
        for j in 0..n {
            if x0[j] < self.xl[j] || x0[j] > self.xu[j] {
                outside += 1;
            }
            z[j] = push_inside(x0[j], self.lower[j], self.upper[j], opts.bound_push, opts.bound_frac);
        }
        if outside > 0 {
            warn!(count = outside, "initial guess violates variable bounds; moved inside");
        }

        let mut vals = self.values(&z[..n])?;
        for r in 0..m {
            if let Some(k) = self.slack_of_row[r] {
                let j = n + k;
                z[j] = push_inside(vals.g[r], self.lower[j], self.upper[j], opts.bound_push, opts.bound_frac);
            }
        }
        let mut derivs = self.derivs(&z[..n], false)?;
        self.trace.push(vals.f);

        let mut lam = vec![0.0; m];
        let mut vl: Vec<f64> = self.lower.iter().map(|l| if l.is_finite() { 1.0 } else { 0.0 }).collect();
        let mut vu: Vec<f64> = self.upper.iter().map(|u| if u.is_finite() { 1.0 } else { 0.0 }).collect();

        let mut mu = opts.mu_init;
        let mu_min = opts.tol / (BARRIER_TOL_FACTOR + 1.0);
        let mut tau = opts.tau_min.max(1.0 - mu);

        let mut c = self.residual(&z, &vals.g);
        let theta0 = norm2(&c);
        let theta_max = 1e4 * theta0.max(1.0);
        let theta_min = 1e-4 * theta0.max(1.0);
        let mut filter: Vec<(f64, f64)> = Vec::new();

        let mut last_delta_w: f64 = 0.0;
        let mut acceptable_count = 0;
        let mut forced_steps = 0;
        let mut force_mu_decrease = false;
        let mut theta_history: Vec<f64> = Vec::new();

        let mut best = Best {
            x: z[..n].to_vec(),
            lam: lam.clone(),
            f: vals.f,
            violation: self.violation(&z[..n], &vals.g),
        };

        let status = loop {
            // Optimality measures at the current iterate.
            let mut grad_lag = vec![0.0; nz];
            grad_lag[..n].copy_from_slice(&self.lagrangian_gradient(&derivs, &lam));
            for r in 0..m {
                if let Some(k) = self.slack_of_row[r] {
                    grad_lag[n + k] -= lam[r];
                }
            }
            for j in 0..nz {
                grad_lag[j] += vu[j] - vl[j];
            }
            let mut err = self.errors(&z, &c, &grad_lag, &lam, &vl, &vu, mu);

            debug!(
                iteration = self.iteration,
                objective = vals.f,
                inf_pr = err.primal,
                inf_du = err.dual,
                mu,
                "interior point iteration"
            );

            if err.overall() <= opts.tol {
                break SolveStatus::Converged;
            }
            if err.overall() <= opts.acceptable_tol {
                acceptable_count += 1;
                if acceptable_count >= opts.acceptable_iter {
                    break SolveStatus::Converged;
                }
            } else {
                acceptable_count = 0;
            }

            let theta = norm2(&c);
            theta_history.push(err.primal);
            if self.iteration > 0 && err.primal > opts.constr_viol_tol {
                let mut jtc = vec![0.0; nz];
                add_transpose_product(&self.rows, &self.cols, &derivs.jac, &c, &mut jtc);
                for r in 0..m {
                    if let Some(k) = self.slack_of_row[r] {
                        jtc[n + k] -= c[r];
                    }
                }
                if inf_norm(&jtc) <= opts.infeasibility_tol * theta.max(1.0) {
                    break SolveStatus::Infeasible;
                }
                if stalled(&theta_history) {
                    break SolveStatus::Infeasible;
                }
            }
            if self.iteration >= opts.max_iterations {
                break SolveStatus::IterationLimit;
            }

            // Barrier update; the filter is restarted for each new subproblem.
            while (force_mu_decrease || err.barrier() <= BARRIER_TOL_FACTOR * mu) && mu > mu_min {
                force_mu_decrease = false;
                mu = mu_min.max((opts.mu_linear_decrease * mu).min(mu.powf(opts.mu_superlinear_power)));
                tau = opts.tau_min.max(1.0 - mu);
                filter.clear();
                err = self.errors(&z, &c, &grad_lag, &lam, &vl, &vu, mu);
            }
            force_mu_decrease = false;

            // Newton step.
            let hess = self.hessian(&z[..n], &lam)?;
            let jt = self.dense_jacobian(&derivs.jac);
            let sigma: Vec<f64> = (0..nz)
                .map(|j| {
                    let mut s = 0.0;
                    if self.lower[j].is_finite() {
                        s += vl[j] / (z[j] - self.lower[j]);
                    }
                    if self.upper[j].is_finite() {
                        s += vu[j] / (self.upper[j] - z[j]);
                    }
                    s
                })
                .collect();
            let grad_phi = self.barrier_gradient(&derivs.grad, &z, mu);
            let mut rhs = DVector::zeros(nz + m);
            for j in 0..nz {
                rhs[j] = -grad_phi[j];
            }
            for r in 0..m {
                rhs[nz + r] = -c[r];
            }

            let mut delta_w = 0.0;
            let mut delta_c = 0.0;
            let sol = loop {
                let kkt = self.assemble_kkt(&hess, &sigma, &jt, delta_w, delta_c);
                match Self::solve_kkt(kkt, &rhs) {
                    None if delta_c == 0.0 && m > 0 => {
                        delta_c = 1e-8 * mu.powf(0.25);
                        continue;
                    }
                    Some(sol) if self.curvature_ok(&hess, &sigma, delta_w, &jt, &sol.rows(0, nz).into_owned()) => {
                        break Some(sol);
                    }
                    _ => {}
                }
                delta_w = if delta_w == 0.0 {
                    if last_delta_w == 0.0 {
                        opts.first_hessian_perturbation
                    } else {
                        (last_delta_w / 3.0).max(1e-20)
                    }
                } else if last_delta_w == 0.0 {
                    delta_w * 100.0
                } else {
                    delta_w * 8.0
                };
                if delta_w > opts.max_hessian_perturbation {
                    break None;
                }
            };
            let Some(sol) = sol else {
                warn!(iteration = self.iteration, "primal-dual system could not be regularized");
                break SolveStatus::NumericalError;
            };
            if delta_w > 0.0 {
                last_delta_w = delta_w;
            }

            let dz: Vec<f64> = sol.rows(0, nz).iter().copied().collect();
            let lam_plus: Vec<f64> = sol.rows(nz, m).iter().copied().collect();
            let mut dvl = vec![0.0; nz];
            let mut dvu = vec![0.0; nz];
            for j in 0..nz {
                if self.lower[j].is_finite() {
                    let d = z[j] - self.lower[j];
                    dvl[j] = mu / d - vl[j] - vl[j] / d * dz[j];
                }
                if self.upper[j].is_finite() {
                    let d = self.upper[j] - z[j];
                    dvu[j] = mu / d - vu[j] + vu[j] / d * dz[j];
                }
            }

            let alpha_max = self.fraction_to_boundary(&z, &dz, tau);
            let alpha_v = Self::multiplier_step_bound(&vl, &dvl, tau).min(Self::multiplier_step_bound(&vu, &dvu, tau));

            // Filter line search on (θ, φ).
            let phi = self.barrier_value(vals.f, &z, mu);
            let slope: f64 = grad_phi.iter().zip(&dz).map(|(g, d)| g * d).sum();
            let alpha_min = if slope < 0.0 {
                GAMMA_ALPHA
                    * GAMMA_THETA
                        .min(GAMMA_PHI * theta / -slope)
                        .min(DELTA_SWITCH * theta.powf(S_THETA) / (-slope).powf(S_PHI))
            } else {
                GAMMA_ALPHA * GAMMA_THETA
            };

            let mut alpha = alpha_max;
            let mut accepted: Option<(Vec<f64>, Values, Vec<f64>)> = None;
            if is_tiny_step(&z, &dz) {
                // Nothing left to gain at this μ.
                debug!(iteration = self.iteration, "tiny step accepted");
                accepted = Some(self.trial(&z, &dz, alpha)?);
                force_mu_decrease = true;
            }
            for _ in 0..=opts.max_backtracks {
                if accepted.is_some() {
                    break;
                }
                let (trial, tv, tc) = self.trial(&z, &dz, alpha)?;
                let t_theta = norm2(&tc);
                let t_phi = self.barrier_value(tv.f, &trial, mu);

                let in_filter = filter.iter().any(|&(ft, fp)| t_theta >= ft && t_phi >= fp);
                if t_theta <= theta_max && t_phi.is_finite() && !in_filter {
                    let switching = slope < 0.0
                        && alpha * (-slope).powf(S_PHI) > DELTA_SWITCH * theta.powf(S_THETA)
                        && theta <= theta_min;
                    let ok = if switching {
                        t_phi <= phi + opts.armijo * alpha * slope
                    } else {
                        t_theta <= (1.0 - GAMMA_THETA) * theta || t_phi <= phi - GAMMA_PHI * theta
                    };
                    if ok {
                        if !switching {
                            filter.push(((1.0 - GAMMA_THETA) * theta, phi - GAMMA_PHI * theta));
                        }
                        accepted = Some((trial, tv, tc));
                        break;
                    }
                }
                alpha *= 0.5;
                if alpha < alpha_min {
                    break;
                }
            }

            let (trial, tv, tc) = match accepted {
                Some(a) => {
                    forced_steps = 0;
                    a
                }
                None => match self.feasibility_step(&z, &c, &jt, tau)? {
                    Some(step) => {
                        filter.push(((1.0 - GAMMA_THETA) * theta, phi - GAMMA_PHI * theta));
                        alpha = 0.0;
                        step
                    }
                    // Feasible but blocked by the filter: fall back to the
                    // barrier objective alone, then to a few full steps.
                    None if err.primal <= opts.constr_viol_tol => {
                        filter.clear();
                        match self.barrier_backtrack(&z, &dz, alpha_max, phi, slope, mu)? {
                            Some((a, step)) => {
                                forced_steps = 0;
                                alpha = a;
                                step
                            }
                            None if forced_steps < WATCHDOG_STEPS => {
                                forced_steps += 1;
                                debug!(iteration = self.iteration, forced_steps, "watchdog full step");
                                alpha = alpha_max;
                                self.trial(&z, &dz, alpha)?
                            }
                            None if err.overall() <= opts.acceptable_tol => break SolveStatus::Converged,
                            None => {
                                warn!(iteration = self.iteration, "line search failed at a feasible point");
                                break SolveStatus::NumericalError;
                            }
                        }
                    }
                    None if err.overall() <= opts.acceptable_tol => break SolveStatus::Converged,
                    None if err.primal > opts.constr_viol_tol => break SolveStatus::Infeasible,
                    None => {
                        warn!(iteration = self.iteration, "line search failed");
                        break SolveStatus::NumericalError;
                    }
                },
            };

            // Accept.
            z = trial;
            vals = tv;
            c = tc;
            for r in 0..m {
                lam[r] += alpha * (lam_plus[r] - lam[r]);
            }
            for j in 0..nz {
                if self.lower[j].is_finite() {
                    let d = z[j] - self.lower[j];
                    vl[j] = (vl[j] + alpha_v * dvl[j]).clamp(mu / (KAPPA_SIGMA * d), KAPPA_SIGMA * mu / d);
                }
                if self.upper[j].is_finite() {
                    let d = self.upper[j] - z[j];
                    vu[j] = (vu[j] + alpha_v * dvu[j]).clamp(mu / (KAPPA_SIGMA * d), KAPPA_SIGMA * mu / d);
                }
            }
            self.iteration += 1;
            derivs = self.derivs(&z[..n], false)?;
            self.trace.push(vals.f);

            let violation = self.violation(&z[..n], &vals.g);
            if is_better(violation, vals.f, &best, opts.constr_viol_tol) {
                best = Best {
                    x: z[..n].to_vec(),
                    lam: lam.clone(),
                    f: vals.f,
                    violation,
                };
            }
        };

        let dual = {
            let mut g = self.lagrangian_gradient(&derivs, &lam);
            for j in 0..n {
                g[j] += vu[j] - vl[j];
            }
            inf_norm(&g)
        };

        let (mut x, multipliers, mut objective, mut constraint_violation) = if status == SolveStatus::Converged {
            let violation = self.violation(&z[..n], &vals.g);
            (z[..n].to_vec(), lam, vals.f, violation)
        } else {
            (best.x, best.lam, best.f, best.violation)
        };
        // Relaxed bounds let iterates sit slightly outside the declared ones.
        let mut clamped = false;
        for j in 0..n {
            let v = x[j].clamp(self.xl[j], self.xu[j]);
            if v != x[j] {
                x[j] = v;
                clamped = true;
            }
        }
        if clamped {
            let v = self.values(&x)?;
            objective = v.f;
            constraint_violation = self.violation(&x, &v.g);
        }

        info!(
            %status,
            iterations = self.iteration,
            objective,
            constraint_violation,
            "interior point finished"
        );

        Ok(NlpSolution {
            x,
            multipliers,
            diagnostics: SolveDiagnostics {
                status,
                iterations: self.iteration,
                objective,
                constraint_violation,
                dual_infeasibility: dual,
                objective_trace: self.trace,
            },
        })
    }

    /// Values at `z + alpha * dz`.
    fn trial(&self, z: &[f64], dz: &[f64], alpha: f64) -> NlpResult<(Vec<f64>, Values, Vec<f64>)> {
        let trial: Vec<f64> = z.iter().zip(dz).map(|(zi, di)| zi + alpha * di).collect();
        let tv = self.values(&trial[..self.n])?;
        let tc = self.residual(&trial, &tv.g);
        Ok((trial, tv, tc))
    }

    /// Armijo backtracking on the barrier objective alone, keeping the point
    /// feasible.
    fn barrier_backtrack(
        &self,
        z: &[f64],
        dz: &[f64],
        alpha_max: f64,
        phi: f64,
        slope: f64,
        mu: f64,
    ) -> NlpResult<Option<(f64, (Vec<f64>, Values, Vec<f64>))>> {
        let mut alpha = alpha_max;
        for _ in 0..=self.opts.max_backtracks {
            let (trial, tv, tc) = self.trial(z, dz, alpha)?;
            let t_phi = self.barrier_value(tv.f, &trial, mu);
            if norm2(&tc) <= self.opts.constr_viol_tol
                && t_phi <= phi + self.opts.armijo * alpha * slope.min(0.0)
            {
                debug!(iteration = self.iteration, alpha, "barrier backtracking step accepted");
                return Ok(Some((alpha, (trial, tv, tc))));
            }
            alpha *= 0.5;
        }
        Ok(None)
    }

    /// Minimum-norm Gauss-Newton step on the constraint violation, used when
    /// the filter rejects every trial point.
    fn feasibility_step(
        &self,
        z: &[f64],
        c: &[f64],
        jt: &DMatrix<f64>,
        tau: f64,
    ) -> NlpResult<Option<(Vec<f64>, Values, Vec<f64>)>> {
        let theta = norm2(c);
        if self.m == 0 || theta <= self.opts.constr_viol_tol {
            return Ok(None);
        }
        let mut jjt = jt * jt.transpose();
        for i in 0..self.m {
            jjt[(i, i)] += 1e-8;
        }
        let Some(y) = jjt.lu().solve(&DVector::from_column_slice(c)) else {
            return Ok(None);
        };
        let dz: Vec<f64> = (-(jt.transpose() * y)).iter().copied().collect();
        let mut alpha = self.fraction_to_boundary(z, &dz, tau);
        for _ in 0..=self.opts.max_backtracks {
            let (trial, tv, tc) = self.trial(z, &dz, alpha)?;
            if norm2(&tc) <= (1.0 - GAMMA_THETA) * theta {
                debug!(iteration = self.iteration, alpha, "feasibility step accepted");
                return Ok(Some((trial, tv, tc)));
            }
            alpha *= 0.5;
        }
        Ok(None)
    }
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn is_better(violation: f64, f: f64, best: &Best, tol: f64) -> bool {
    let feasible = violation <= tol;
    let best_feasible = best.violation <= tol;
    match (feasible, best_feasible) {
        (true, false) => true,
        (false, true) => false,
        (true, true) => f <= best.f,
        (false, false) => violation <= best.violation,
    }
}

/// True when the primal infeasibility has not improved over the last window.
fn stalled(history: &[f64]) -> bool {
    if history.len() <= 2 * STALL_WINDOW {
        return false;
    }
    let recent = &history[history.len() - STALL_WINDOW..];
    let before = history[history.len() - STALL_WINDOW - 1];
    let best_recent = recent.iter().copied().fold(f64::INFINITY, f64::min);
    best_recent >= 0.999 * before
}
