//! The collocation problem: construction, NLP callbacks, and solving.

use std::collections::{BTreeMap, BTreeSet};

use dc_core::first_non_finite;
use dc_expr::Symbol;
use dc_nlp::{
    EvalResult, InteriorPoint, NlpError, NlpProblem, NlpSolver, Quantity,
};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::block::{EvalContext, KnownValues};
use crate::discretize::{CollocationMethod, DefectEngine, EvalBackend};
use crate::error::{CollocationError, CollocationResult, ConstraintLocation};
use crate::grid::{EquationsOfMotion, Interval, NodeGrid};
use crate::instance::{InstanceConstraint, InstanceSet};
use crate::layout::{FreeLayout, ParsedFree};
use crate::objective::Objective;
use crate::path::{PathConstraint, PathSet};
use crate::solution::{ConstraintViolations, GradientCheck, Solution, SolveOptions, outside};
use crate::symbols::{Classification, ClassifyInput, SymbolRole};

type DeferredObjective = Box<dyn FnOnce(&FreeLayout) -> CollocationResult<Objective>>;

enum ObjectiveSource {
    Ready(Objective),
    Deferred(DeferredObjective),
}

/// Collects everything a [`Problem`] is built from.
///
/// ```ignore
/// let x = Symbol::dynamic("x");
/// let u = Symbol::dynamic("u");
/// let problem = ProblemBuilder::new(vec![x.der() - &u], vec![x.clone()], 51, Interval::Fixed(0.02))
///     .instance_constraints([x.at(0.0), x.at(1.0) - 1.0])
///     .free_symbols([u.clone()])
///     .objective_from(|layout| control_effort(layout, &[u]))
///     .build()?;
/// ```
pub struct ProblemBuilder {
    equations: EquationsOfMotion,
    states: Vec<Symbol>,
    num_nodes: usize,
    interval: Interval,
    time: Symbol,
    known_parameters: BTreeMap<Symbol, f64>,
    known_trajectories: BTreeMap<Symbol, Vec<f64>>,
    instance_constraints: Vec<InstanceConstraint>,
    path_constraints: Vec<PathConstraint>,
    bounds: BTreeMap<Symbol, (f64, f64)>,
    free_symbols: BTreeSet<Symbol>,
    method: CollocationMethod,
    backend: EvalBackend,
    options: SolveOptions,
    objective: Option<ObjectiveSource>,
}

impl ProblemBuilder {
    pub fn new(
        equations: impl Into<EquationsOfMotion>,
        states: Vec<Symbol>,
        num_nodes: usize,
        interval: Interval,
    ) -> Self {
        Self {
            equations: equations.into(),
            states,
            num_nodes,
            interval,
            time: Symbol::constant("t"),
            known_parameters: BTreeMap::new(),
            known_trajectories: BTreeMap::new(),
            instance_constraints: Vec::new(),
            path_constraints: Vec::new(),
            bounds: BTreeMap::new(),
            free_symbols: BTreeSet::new(),
            method: CollocationMethod::default(),
            backend: EvalBackend::default(),
            options: SolveOptions::default(),
            objective: None,
        }
    }

    /// Symbol standing for time in the equations (default `t`).
    pub fn time_symbol(mut self, time: Symbol) -> Self {
        self.time = time;
        self
    }

    pub fn known_parameters(mut self, values: BTreeMap<Symbol, f64>) -> Self {
        self.known_parameters = values;
        self
    }

    /// Node values of specified trajectories, each of length N.
    pub fn known_trajectories(mut self, values: BTreeMap<Symbol, Vec<f64>>) -> Self {
        self.known_trajectories = values;
        self
    }

    pub fn instance_constraints<I, C>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<InstanceConstraint>,
    {
        self.instance_constraints = constraints.into_iter().map(Into::into).collect();
        self
    }

    pub fn path_constraints(mut self, constraints: Vec<PathConstraint>) -> Self {
        self.path_constraints = constraints;
        self
    }

    /// Inclusive bounds. A bounded symbol that is not otherwise known
    /// becomes a free unknown.
    pub fn bounds(mut self, bounds: BTreeMap<Symbol, (f64, f64)>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Declare unbounded free unknowns.
    pub fn free_symbols(mut self, symbols: impl IntoIterator<Item = Symbol>) -> Self {
        self.free_symbols.extend(symbols);
        self
    }

    pub fn integration_method(mut self, method: CollocationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn eval_backend(mut self, backend: EvalBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn solve_options(mut self, options: SolveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn objective<F, G>(mut self, value: F, gradient: G) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
        G: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.objective = Some(ObjectiveSource::Ready(Objective::new(value, gradient)));
        self
    }

    /// Objective built once the layout is known.
    pub fn objective_from<F>(mut self, make: F) -> Self
    where
        F: FnOnce(&FreeLayout) -> CollocationResult<Objective> + 'static,
    {
        self.objective = Some(ObjectiveSource::Deferred(Box::new(make)));
        self
    }

    fn prepare(&self) -> CollocationResult<(NodeGrid, Classification)> {
        let grid = NodeGrid::new(self.num_nodes, self.interval.clone())?;
        if self.states.is_empty() {
            return Err(CollocationError::config("at least one state is required"));
        }
        self.equations.validate(self.states.len())?;
        if let Some(e) = self
            .equations
            .expressions()
            .into_iter()
            .find(|e| !e.evaluated_trajectories().is_empty())
        {
            return Err(CollocationError::config(format!(
                "equations of motion cannot sample trajectories at fixed times: {e}"
            )));
        }

        let mut exprs = self.equations.expressions();
        exprs.extend(self.instance_constraints.iter().map(|c| &c.expr));
        exprs.extend(self.path_constraints.iter().map(|c| &c.expr));
        let cls = Classification::classify(&ClassifyInput {
            exprs,
            states: &self.states,
            time: &self.time,
            interval: grid.interval_symbol(),
            known_parameters: &self.known_parameters,
            known_trajectories: &self.known_trajectories,
            bounds: &self.bounds,
            declared_free: &self.free_symbols,
        })?;
        Ok((grid, cls))
    }

    /// Layout the built problem will use, without compiling anything.
    pub fn layout(&self) -> CollocationResult<FreeLayout> {
        let (grid, cls) = self.prepare()?;
        Ok(layout_of(grid, &cls, self.method))
    }

    pub fn build(self) -> CollocationResult<Problem> {
        let (grid, cls) = self.prepare()?;
        let n = grid.num_nodes();

        let mut known = KnownValues::default();
        for s in cls.known_trajectories() {
            let values = &self.known_trajectories[s];
            check_known_trajectory(s, values, n)?;
            known.trajectories.push(values.clone());
        }
        for s in cls.known_parameters() {
            let v = self.known_parameters[s];
            check_known_parameter(s, v)?;
            known.parameters.push(v);
        }
        for (s, &b) in &self.bounds {
            check_bounds(s, b)?;
        }

        let layout = layout_of(grid, &cls, self.method);
        let defects = DefectEngine::new(&self.equations, &cls, n, self.method, self.backend)?;
        let instance =
            InstanceSet::compile(&self.instance_constraints, &cls, layout.grid(), &known.parameters)?;
        let path = PathSet::compile(&self.path_constraints, &cls, n, self.backend)?;

        let objective = match self.objective {
            Some(ObjectiveSource::Ready(o)) => o,
            Some(ObjectiveSource::Deferred(make)) => make(&layout)?,
            None => {
                return Err(CollocationError::config(
                    "an objective and its gradient are required",
                ));
            }
        };
        objective.validate(layout.num_free())?;

        let mut problem = Problem {
            layout,
            classification: cls,
            known,
            defects,
            instance,
            path,
            objective,
            bounds: self.bounds,
            lower: Vec::new(),
            upper: Vec::new(),
            jac_rows: Vec::new(),
            jac_cols: Vec::new(),
            options: self.options,
        };
        problem.refresh_bounds();
        problem.refresh_structure();

        info!(
            states = problem.layout.num_states(),
            trajectories = problem.layout.num_trajectories(),
            parameters = problem.layout.num_parameters(),
            free_interval = problem.layout.has_free_interval(),
            nodes = n,
            method = ?problem.defects.method(),
            num_free = problem.num_free(),
            num_constraints = problem.num_constraints(),
            nonzeros = problem.jacobian_nonzeros(),
            "collocation problem built"
        );
        Ok(problem)
    }
}

fn layout_of(grid: NodeGrid, cls: &Classification, method: CollocationMethod) -> FreeLayout {
    FreeLayout::new(
        grid,
        cls.states().to_vec(),
        cls.unknown_trajectories().to_vec(),
        cls.free_parameters().to_vec(),
    )
    .with_method(method)
}

fn check_known_trajectory(s: &Symbol, values: &[f64], n: usize) -> CollocationResult<()> {
    if values.len() != n {
        return Err(CollocationError::config(format!(
            "known trajectory '{s}' has {} values, expected {n}",
            values.len()
        )));
    }
    if let Some(k) = first_non_finite(values) {
        return Err(CollocationError::config(format!(
            "known trajectory '{s}' is non-finite at node {k}"
        )));
    }
    Ok(())
}

fn check_known_parameter(s: &Symbol, v: f64) -> CollocationResult<()> {
    if !v.is_finite() {
        return Err(CollocationError::config(format!(
            "known parameter '{s}' is non-finite ({v})"
        )));
    }
    Ok(())
}

fn check_bounds(s: &Symbol, (lower, upper): (f64, f64)) -> CollocationResult<()> {
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(CollocationError::config(format!(
            "invalid bounds for '{s}': [{lower}, {upper}]"
        )));
    }
    Ok(())
}

fn boxed(e: CollocationError) -> dc_nlp::EvalError {
    Box::new(e)
}

/// A discretized trajectory-optimization problem, ready to solve.
///
/// Constraint rows are ordered
/// `[defects (equation-major), instance constraints, path constraints
/// (constraint-major)]`. The sparsity pattern is fixed at construction.
pub struct Problem {
    layout: FreeLayout,
    classification: Classification,
    known: KnownValues,
    defects: DefectEngine,
    instance: InstanceSet,
    path: PathSet,
    objective: Objective,
    bounds: BTreeMap<Symbol, (f64, f64)>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    jac_rows: Vec<usize>,
    jac_cols: Vec<usize>,
    options: SolveOptions,
}

impl Problem {
    fn ctx(&self) -> EvalContext<'_> {
        EvalContext {
            layout: &self.layout,
            known: &self.known,
        }
    }

    fn refresh_bounds(&mut self) {
        let layout = &self.layout;
        let n = layout.num_free();
        self.lower = vec![f64::NEG_INFINITY; n];
        self.upper = vec![f64::INFINITY; n];
        for (s, &(lo, hi)) in &self.bounds {
            let indices: Vec<usize> = match self.classification.role(s) {
                Some(SymbolRole::State(id)) => (0..layout.num_nodes())
                    .map(|k| layout.state_index(id.index(), k))
                    .collect(),
                Some(SymbolRole::UnknownTrajectory(id)) => (0..layout.num_nodes())
                    .map(|k| layout.trajectory_index(id.index(), k))
                    .collect(),
                Some(SymbolRole::FreeParameter(id)) => vec![layout.parameter_index(id.index())],
                Some(SymbolRole::Interval) => layout.interval_index().into_iter().collect(),
                _ => Vec::new(),
            };
            for i in indices {
                self.lower[i] = lo;
                self.upper[i] = hi;
            }
        }
    }

    fn refresh_structure(&mut self) {
        let ctx = self.ctx();
        let mut rows = Vec::with_capacity(self.jacobian_nonzeros());
        let mut cols = Vec::with_capacity(self.jacobian_nonzeros());
        let nd = self.defects.num_rows();
        self.defects.structure(&ctx, &mut rows, &mut cols);
        self.instance.structure(&ctx, nd, &mut rows, &mut cols);
        self.path
            .structure(&ctx, nd + self.instance.num_rows(), &mut rows, &mut cols);
        self.jac_rows = rows;
        self.jac_cols = cols;
    }

    pub fn layout(&self) -> &FreeLayout {
        &self.layout
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn num_free(&self) -> usize {
        self.layout.num_free()
    }

    pub fn num_constraints(&self) -> usize {
        self.defects.num_rows() + self.instance.num_rows() + self.path.num_rows()
    }

    pub fn jacobian_nonzeros(&self) -> usize {
        self.defects.nnz() + self.instance.nnz() + self.path.nnz()
    }

    pub fn solve_options(&self) -> &SolveOptions {
        &self.options
    }

    pub fn set_solve_options(&mut self, options: SolveOptions) {
        self.options = options;
    }

    /// Split a free vector into named arrays.
    pub fn parse_free(&self, x: &[f64]) -> CollocationResult<ParsedFree> {
        self.layout.split(x)
    }

    /// Build a free vector from named arrays; see [`FreeLayout::build`].
    pub fn initial_guess_from(
        &self,
        states: &DMatrix<f64>,
        trajectories: &DMatrix<f64>,
        parameters: &DVector<f64>,
        interval: Option<f64>,
    ) -> CollocationResult<Vec<f64>> {
        self.layout.build(states, trajectories, parameters, interval)
    }

    /// Replace the bounds of a state, unknown trajectory, free parameter,
    /// or the free interval.
    pub fn set_bounds(&mut self, symbol: &Symbol, bounds: (f64, f64)) -> CollocationResult<()> {
        match self.classification.role(symbol) {
            Some(
                SymbolRole::State(_)
                | SymbolRole::UnknownTrajectory(_)
                | SymbolRole::FreeParameter(_)
                | SymbolRole::Interval,
            ) => {}
            _ => {
                return Err(CollocationError::config(format!(
                    "'{symbol}' is not an unknown of this problem"
                )));
            }
        }
        check_bounds(symbol, bounds)?;
        self.bounds.insert(symbol.clone(), bounds);
        self.refresh_bounds();
        Ok(())
    }

    pub fn set_known_trajectory(&mut self, symbol: &Symbol, values: Vec<f64>) -> CollocationResult<()> {
        let Some(SymbolRole::KnownTrajectory(k)) = self.classification.role(symbol) else {
            return Err(CollocationError::config(format!(
                "'{symbol}' is not a known trajectory of this problem"
            )));
        };
        check_known_trajectory(symbol, &values, self.layout.num_nodes())?;
        self.known.trajectories[k] = values;
        Ok(())
    }

    pub fn set_known_parameter(&mut self, symbol: &Symbol, value: f64) -> CollocationResult<()> {
        let Some(SymbolRole::KnownParameter(q)) = self.classification.role(symbol) else {
            return Err(CollocationError::config(format!(
                "'{symbol}' is not a known parameter of this problem"
            )));
        };
        if self.instance.places_samples(symbol) {
            return Err(CollocationError::config(format!(
                "'{symbol}' places an instance constraint in time; rebuild the problem to change it"
            )));
        }
        check_known_parameter(symbol, value)?;
        self.known.parameters[q] = value;
        Ok(())
    }

    fn eval_constraints(&self, x: &[f64], g: &mut [f64]) -> CollocationResult<()> {
        let ctx = self.ctx();
        let nd = self.defects.num_rows();
        let ni = self.instance.num_rows();
        let (defects, rest) = g.split_at_mut(nd);
        let (instance, path) = rest.split_at_mut(ni);
        self.defects.residuals(&ctx, x, defects)?;
        self.instance.values(&ctx, x, instance);
        self.path.values(&ctx, x, path);
        Ok(())
    }

    fn eval_jacobian(&self, x: &[f64], values: &mut [f64]) -> CollocationResult<()> {
        let ctx = self.ctx();
        let (defects, rest) = values.split_at_mut(self.defects.nnz());
        let (instance, path) = rest.split_at_mut(self.instance.nnz());
        self.defects.jacobian_values(&ctx, x, defects)?;
        self.instance.jacobian_values(&ctx, x, instance);
        self.path.jacobian_values(&ctx, x, path);
        Ok(())
    }

    /// Constraint values at `x`, grouped by origin.
    pub fn constraint_violations(&self, x: &[f64]) -> CollocationResult<ConstraintViolations> {
        self.layout.check_len(x)?;
        let mut g = vec![0.0; self.num_constraints()];
        self.eval_constraints(x, &mut g)?;
        let nd = self.defects.num_rows();
        let ni = self.instance.num_rows();
        let intervals = self.layout.num_nodes() - 1;
        let nodes = self.layout.num_nodes();
        let instance = g[nd..nd + ni]
            .iter()
            .zip(self.instance.bounds())
            .map(|(&v, &b)| outside(v, b))
            .collect();
        let path_values: Vec<f64> = g[nd + ni..]
            .iter()
            .zip(self.path.row_bounds())
            .map(|(&v, b)| outside(v, b))
            .collect();
        Ok(ConstraintViolations {
            defects: DMatrix::from_row_slice(self.layout.num_states(), intervals, &g[..nd]),
            instance,
            path: DMatrix::from_row_slice(self.path.num_constraints(), nodes, &path_values),
        })
    }

    /// Compare the objective gradient with central differences at `x`.
    pub fn check_gradient(&self, x: &[f64]) -> CollocationResult<GradientCheck> {
        self.layout.check_len(x)?;
        let analytic = self.objective.gradient(x);
        if analytic.len() != x.len() {
            return Err(CollocationError::config(format!(
                "gradient returns {} entries, free vector has {}",
                analytic.len(),
                x.len()
            )));
        }
        let mut max_abs_error: f64 = 0.0;
        let mut max_rel_error: f64 = 0.0;
        let mut worst_entry = None;
        let mut probe = x.to_vec();
        for (i, &g) in analytic.iter().enumerate() {
            let step = 1e-6 * x[i].abs().max(1.0);
            probe[i] = x[i] + step;
            let up = self.objective.value(&probe);
            probe[i] = x[i] - step;
            let down = self.objective.value(&probe);
            probe[i] = x[i];
            let fd = (up - down) / (2.0 * step);
            let abs = (fd - g).abs();
            let rel = abs / g.abs().max(fd.abs()).max(1.0);
            max_abs_error = max_abs_error.max(abs);
            if rel > max_rel_error || worst_entry.is_none() {
                max_rel_error = max_rel_error.max(rel);
                worst_entry = Some(i);
            }
        }
        let passed = max_rel_error <= self.options.gradient_tolerance;
        if passed {
            debug!(max_abs_error, max_rel_error, "gradient check passed");
        } else {
            warn!(
                max_abs_error,
                max_rel_error,
                worst_entry = ?worst_entry,
                tolerance = self.options.gradient_tolerance,
                "objective gradient disagrees with finite differences"
            );
        }
        Ok(GradientCheck {
            max_abs_error,
            max_rel_error,
            worst_entry,
            passed,
        })
    }

    /// Solve with the bundled interior-point backend.
    pub fn solve(&self, x0: &[f64]) -> CollocationResult<Solution> {
        let solver = InteriorPoint::new(self.options.ipm.clone());
        self.solve_with(&solver, x0)
    }

    /// Solve from `x0` with any backend. `x0` may be a previous solution.
    pub fn solve_with(&self, solver: &dyn NlpSolver, x0: &[f64]) -> CollocationResult<Solution> {
        self.layout.check_len(x0)?;
        if let Some(i) = first_non_finite(x0) {
            return Err(CollocationError::config(format!(
                "initial guess is non-finite at entry {i}"
            )));
        }
        if self.options.verify_gradient {
            self.check_gradient(x0)?;
        }
        let nlp = solver.solve(self, x0).map_err(|e| self.map_nlp_error(e))?;
        info!(
            status = %nlp.diagnostics.status,
            iterations = nlp.diagnostics.iterations,
            objective = nlp.diagnostics.objective,
            constraint_violation = nlp.diagnostics.constraint_violation,
            "collocation solve finished"
        );
        Ok(Solution {
            free: self.layout.split(&nlp.x)?,
            x: nlp.x,
            diagnostics: nlp.diagnostics,
            multipliers: nlp.multipliers,
        })
    }

    /// Where constraint row `row` comes from.
    pub fn locate_row(&self, row: usize) -> Option<ConstraintLocation> {
        let nd = self.defects.num_rows();
        let ni = self.instance.num_rows();
        let n = self.layout.num_nodes();
        if row < nd {
            Some(ConstraintLocation::Defect {
                equation: row / (n - 1),
                interval: row % (n - 1),
            })
        } else if row < nd + ni {
            let index = row - nd;
            Some(ConstraintLocation::Instance {
                index,
                node: self.instance.first_node(index),
            })
        } else if row < self.num_constraints() {
            let r = row - nd - ni;
            Some(ConstraintLocation::Path {
                index: r / n,
                node: r % n,
            })
        } else {
            None
        }
    }

    fn locate(&self, quantity: Quantity, index: Option<usize>) -> Option<ConstraintLocation> {
        match quantity {
            Quantity::Objective => Some(ConstraintLocation::Objective),
            Quantity::Gradient => index.map(|entry| ConstraintLocation::Gradient { entry }),
            Quantity::Constraints => index.and_then(|row| self.locate_row(row)),
            Quantity::Jacobian => index
                .and_then(|nz| self.jac_rows.get(nz).copied())
                .and_then(|row| self.locate_row(row)),
            Quantity::Hessian => None,
        }
    }

    fn map_nlp_error(&self, e: NlpError) -> CollocationError {
        match e {
            NlpError::NonFinite {
                iteration,
                quantity,
                index,
                trace,
            } => CollocationError::Numerical {
                iteration,
                what: format!("non-finite {quantity}"),
                location: self.locate(quantity, index),
                trace,
            },
            NlpError::Evaluation {
                iteration,
                quantity,
                source,
                trace,
            } => match source.downcast::<CollocationError>() {
                Ok(inner) => *inner,
                Err(source) => CollocationError::Nlp(NlpError::Evaluation {
                    iteration,
                    quantity,
                    source,
                    trace,
                }),
            },
            other => CollocationError::Nlp(other),
        }
    }
}

impl NlpProblem for Problem {
    fn num_variables(&self) -> usize {
        self.num_free()
    }

    fn num_constraints(&self) -> usize {
        Problem::num_constraints(self)
    }

    fn variable_bounds(&self, lower: &mut [f64], upper: &mut [f64]) {
        lower.copy_from_slice(&self.lower);
        upper.copy_from_slice(&self.upper);
    }

    fn constraint_bounds(&self, lower: &mut [f64], upper: &mut [f64]) {
        let nd = self.defects.num_rows();
        let bounds = std::iter::repeat_n((0.0, 0.0), nd)
            .chain(self.instance.bounds().iter().copied())
            .chain(self.path.row_bounds());
        for ((lo, hi), (l, u)) in lower.iter_mut().zip(upper.iter_mut()).zip(bounds) {
            *lo = l;
            *hi = u;
        }
    }

    fn objective(&self, x: &[f64]) -> EvalResult<f64> {
        Ok(self.objective.value(x))
    }

    fn gradient(&self, x: &[f64], grad: &mut [f64]) -> EvalResult<()> {
        let g = self.objective.gradient(x);
        if g.len() != grad.len() {
            return Err(boxed(CollocationError::config(format!(
                "gradient returns {} entries, free vector has {}",
                g.len(),
                grad.len()
            ))));
        }
        grad.copy_from_slice(&g);
        Ok(())
    }

    fn constraints(&self, x: &[f64], g: &mut [f64]) -> EvalResult<()> {
        self.eval_constraints(x, g).map_err(boxed)
    }

    fn jacobian_structure(&self) -> (Vec<usize>, Vec<usize>) {
        (self.jac_rows.clone(), self.jac_cols.clone())
    }

    fn jacobian_values(&self, x: &[f64], values: &mut [f64]) -> EvalResult<()> {
        self.eval_jacobian(x, values).map_err(boxed)
    }
}
