//! Discretization engine.
//!
//! Each interval `i` between nodes `i` and `i + 1` contributes one defect
//! per equation. Defects are evaluated interval by interval from compiled
//! tapes, either serially or with rayon; results land in pre-assigned
//! slices so the output does not depend on scheduling.
//!
//! Interval slot layout:
//!
//! ```text
//! [x_a(ns), x_b(ns), r_a(nr), r_b(nr), k_a(nk), k_b(nk), p(np), q(nq), h, t_a, t_b]
//! ```
//!
//! where `a` is node `i`, `b` is node `i + 1`, `r` are unknown
//! trajectories, `k` known trajectories, `p` free and `q` known parameters.

use std::collections::{BTreeSet, HashMap};

use dc_expr::{Atom, Expr, Tape};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::block::{
    EvalContext, Entry, ExprBlock, LocalVar, Scratch, Source, check_finite, differentiable, fold,
    local, local_expr, local_slot,
};
use crate::error::{CollocationError, CollocationResult};
use crate::grid::EquationsOfMotion;
use crate::symbols::{Classification, SymbolRole};

/// Pivots below this fraction of the largest pivot mark a singular mass matrix.
const SINGULAR_PIVOT_RATIO: f64 = 1e-14;

/// Collocation scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollocationMethod {
    /// First order; dynamics evaluated at the right node.
    BackwardEuler,
    /// Second order; dynamics evaluated at the interval midpoint.
    #[default]
    Midpoint,
}

impl CollocationMethod {
    /// Quadrature weights (in units of the node interval) that integrate a
    /// node-sampled running cost consistently with the defects: trapezoid
    /// for the midpoint rule, right-endpoint rectangle for backward Euler.
    pub fn node_weights(self, num_nodes: usize) -> Vec<f64> {
        let mut w = vec![1.0; num_nodes];
        match self {
            CollocationMethod::BackwardEuler => {
                if let Some(first) = w.first_mut() {
                    *first = 0.0;
                }
            }
            CollocationMethod::Midpoint => {
                if let Some(first) = w.first_mut() {
                    *first = 0.5;
                }
                if let Some(last) = w.last_mut() {
                    *last = 0.5;
                }
            }
        }
        w
    }
}

/// How intervals are evaluated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalBackend {
    Serial,
    #[default]
    Parallel,
}

impl EvalBackend {
    /// Run `f` on consecutive `width`-sized chunks of `buf`, one chunk per
    /// block index. Returns the failure of the lowest failing index.
    pub(crate) fn for_each_chunk<F, E>(self, buf: &mut [f64], width: usize, f: F) -> Result<(), E>
    where
        F: Fn(usize, &mut Scratch, &mut [f64]) -> Result<(), E> + Sync + Send,
        E: Send,
    {
        if width == 0 {
            return Ok(());
        }
        let failures: Vec<Option<E>> = match self {
            EvalBackend::Serial => {
                let mut scratch = Scratch::default();
                buf.chunks_mut(width)
                    .enumerate()
                    .map(|(i, chunk)| f(i, &mut scratch, chunk).err())
                    .collect()
            }
            EvalBackend::Parallel => buf
                .par_chunks_mut(width)
                .enumerate()
                .map_init(Scratch::default, |scratch, (i, chunk)| f(i, scratch, chunk).err())
                .collect(),
        };
        match failures.into_iter().flatten().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct IntervalSlots {
    ns: usize,
    nr: usize,
    nk: usize,
    np: usize,
    nq: usize,
}

impl IntervalSlots {
    fn xa(&self, s: usize) -> usize {
        s
    }
    fn xb(&self, s: usize) -> usize {
        self.ns + s
    }
    fn ra(&self, r: usize) -> usize {
        2 * self.ns + r
    }
    fn rb(&self, r: usize) -> usize {
        2 * self.ns + self.nr + r
    }
    fn ka(&self, k: usize) -> usize {
        2 * (self.ns + self.nr) + k
    }
    fn kb(&self, k: usize) -> usize {
        2 * (self.ns + self.nr) + self.nk + k
    }
    fn p(&self, p: usize) -> usize {
        2 * (self.ns + self.nr + self.nk) + p
    }
    fn q(&self, q: usize) -> usize {
        2 * (self.ns + self.nr + self.nk) + self.np + q
    }
    fn h(&self) -> usize {
        2 * (self.ns + self.nr + self.nk) + self.np + self.nq
    }
    fn ta(&self) -> usize {
        self.h() + 1
    }
    fn tb(&self) -> usize {
        self.h() + 2
    }

    fn sources(&self) -> Vec<Source> {
        let mut out = Vec::with_capacity(self.tb() + 1);
        for o in 0..2 {
            out.extend((0..self.ns).map(|s| Source::Var(LocalVar::State(s, o))));
        }
        for o in 0..2 {
            out.extend((0..self.nr).map(|r| Source::Var(LocalVar::Trajectory(r, o))));
        }
        for o in 0..2 {
            out.extend((0..self.nk).map(|k| Source::Known(k, o)));
        }
        out.extend((0..self.np).map(|p| Source::Var(LocalVar::Parameter(p))));
        out.extend((0..self.nq).map(Source::KnownParameter));
        out.push(Source::Var(LocalVar::Interval));
        out.push(Source::Var(LocalVar::Time(0)));
        out.push(Source::Var(LocalVar::Time(1)));
        debug_assert_eq!(out.len(), self.tb() + 1);
        out
    }
}

/// Replacement of every classified symbol by its interval-local value.
fn interval_substitution(
    cls: &Classification,
    slots: &IntervalSlots,
    method: CollocationMethod,
) -> HashMap<Atom, Expr> {
    let blend = |a: usize, b: usize| match method {
        CollocationMethod::BackwardEuler => local_expr(b),
        CollocationMethod::Midpoint => (local_expr(a) + local_expr(b)) * 0.5,
    };
    let mut map = HashMap::new();
    for (s, sym) in cls.states().iter().enumerate() {
        map.insert(Atom::Sym(sym.clone()), blend(slots.xa(s), slots.xb(s)));
        map.insert(
            Atom::Der(sym.clone()),
            (local_expr(slots.xb(s)) - local_expr(slots.xa(s))) / local_expr(slots.h()),
        );
    }
    for (r, sym) in cls.unknown_trajectories().iter().enumerate() {
        map.insert(Atom::Sym(sym.clone()), blend(slots.ra(r), slots.rb(r)));
    }
    for (k, sym) in cls.known_trajectories().iter().enumerate() {
        map.insert(Atom::Sym(sym.clone()), blend(slots.ka(k), slots.kb(k)));
    }
    for (p, sym) in cls.free_parameters().iter().enumerate() {
        map.insert(Atom::Sym(sym.clone()), local_expr(slots.p(p)));
    }
    for (q, sym) in cls.known_parameters().iter().enumerate() {
        map.insert(Atom::Sym(sym.clone()), local_expr(slots.q(q)));
    }
    map.insert(Atom::Sym(cls.time().clone()), blend(slots.ta(), slots.tb()));
    if let Some(h) = cls.interval() {
        debug_assert_eq!(cls.role(h), Some(SymbolRole::Interval));
        map.insert(Atom::Sym(h.clone()), local_expr(slots.h()));
    }
    map
}

fn localize(e: &Expr, map: &HashMap<Atom, Expr>) -> Expr {
    e.substitute(map).simplify()
}

/// `M(x) der(x) = F(x)` solved per interval with an LU factorization.
#[derive(Debug)]
struct MassMatrixKernel {
    ns: usize,
    sources: Vec<Source>,
    /// `[M row-major, F]`
    values: Tape,
    /// For each variable in `vars`: `[dM row-major, dF]`
    sensitivities: Tape,
    /// Slot and variable of every unknown M or F depends on
    vars: Vec<LocalVar>,
    /// Every variable a defect row can depend on, sorted
    columns: Vec<LocalVar>,
    /// (row, position in `columns`) of each partial
    partial_cells: Vec<(usize, usize)>,
    entries: Vec<Entry>,
    xa: usize,
    xb: usize,
    h: usize,
}

struct Factored {
    lu: nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>,
    v: DVector<f64>,
}

impl MassMatrixKernel {
    fn compile(
        mass: &[Vec<Expr>],
        forcing: &[Expr],
        map: &HashMap<Atom, Expr>,
        slots: &IntervalSlots,
        free_interval: bool,
    ) -> CollocationResult<Self> {
        let ns = slots.ns;
        let sources = slots.sources();
        let mut value_exprs: Vec<Expr> = mass.iter().flatten().map(|e| localize(e, map)).collect();
        value_exprs.extend(forcing.iter().map(|e| localize(e, map)));
        for e in &value_exprs {
            check_finite(e, "mass-matrix equations")?;
        }

        let mut vars = Vec::new();
        let mut sensitivity_exprs = Vec::new();
        for (slot, var) in differentiable(&sources, free_interval) {
            let d: Vec<Expr> = value_exprs
                .iter()
                .map(|e| e.diff(&local(slot)).simplify())
                .collect();
            if d.iter().all(Expr::is_zero) {
                continue;
            }
            for e in &d {
                check_finite(e, "mass-matrix equations")?;
            }
            vars.push(var);
            sensitivity_exprs.extend(d);
        }

        let mut column_set: BTreeSet<LocalVar> = vars.iter().copied().collect();
        for s in 0..ns {
            column_set.insert(LocalVar::State(s, 0));
            column_set.insert(LocalVar::State(s, 1));
        }
        if free_interval {
            column_set.insert(LocalVar::Interval);
        }
        let columns: Vec<LocalVar> = column_set.into_iter().collect();

        let mut partials = Vec::new();
        let mut partial_cells = Vec::new();
        for row in 0..ns {
            for (c, &var) in columns.iter().enumerate() {
                let present = vars.contains(&var)
                    || var == LocalVar::State(row, 0)
                    || var == LocalVar::State(row, 1)
                    || var == LocalVar::Interval;
                if present {
                    partials.push((row, var));
                    partial_cells.push((row, c));
                }
            }
        }

        let n = sources.len();
        Ok(Self {
            ns,
            values: Tape::compile(&value_exprs, &local_slot, n)?,
            sensitivities: Tape::compile(&sensitivity_exprs, &local_slot, n)?,
            vars,
            columns,
            partial_cells,
            entries: fold(&partials),
            sources,
            xa: slots.xa(0),
            xb: slots.xb(0),
            h: slots.h(),
        })
    }

    /// Factor M and solve for `v = M^-1 F`. `None` when M is singular.
    fn factor(&self, scratch: &mut Scratch) -> Option<Factored> {
        let ns = self.ns;
        scratch.values.resize(self.values.num_outputs(), 0.0);
        self.values
            .eval(&scratch.inputs, &mut scratch.tape, &mut scratch.values);
        let m = DMatrix::from_row_slice(ns, ns, &scratch.values[..ns * ns]);
        let f = DVector::from_column_slice(&scratch.values[ns * ns..]);
        let lu = m.lu();
        let pivots = lu.u().diagonal();
        let scale = pivots.amax();
        if !scale.is_finite()
            || scale == 0.0
            || pivots.iter().any(|d| d.abs() <= SINGULAR_PIVOT_RATIO * scale)
        {
            return None;
        }
        let v = lu.solve(&f)?;
        Some(Factored { lu, v })
    }

    fn residuals(&self, scratch: &mut Scratch, out: &mut [f64]) -> Option<()> {
        let Factored { v, .. } = self.factor(scratch)?;
        let h = scratch.inputs[self.h];
        for (j, o) in out.iter_mut().enumerate() {
            *o = scratch.inputs[self.xb + j] - scratch.inputs[self.xa + j] - h * v[j];
        }
        Some(())
    }

    fn jacobian(&self, base: usize, scratch: &mut Scratch, out: &mut [f64]) -> Option<()> {
        let ns = self.ns;
        let Factored { lu, v } = self.factor(scratch)?;
        let h = scratch.inputs[self.h];
        let width = self.columns.len();
        let mut dense = DMatrix::<f64>::zeros(ns, width);
        let column = |var: LocalVar| self.columns.binary_search(&var).ok();

        for j in 0..ns {
            if let Some(c) = column(LocalVar::State(j, 1)) {
                dense[(j, c)] += 1.0;
            }
            if let Some(c) = column(LocalVar::State(j, 0)) {
                dense[(j, c)] -= 1.0;
            }
            if let Some(c) = column(LocalVar::Interval) {
                dense[(j, c)] -= v[j];
            }
        }

        if !self.vars.is_empty() {
            let block = ns * ns + ns;
            scratch.partials.resize(self.sensitivities.num_outputs(), 0.0);
            self.sensitivities
                .eval(&scratch.inputs, &mut scratch.tape, &mut scratch.partials);
            for (q, &var) in self.vars.iter().enumerate() {
                let chunk = &scratch.partials[q * block..(q + 1) * block];
                let dm = DMatrix::from_row_slice(ns, ns, &chunk[..ns * ns]);
                let df = DVector::from_column_slice(&chunk[ns * ns..]);
                let w = lu.solve(&(df - dm * &v))?;
                if let Some(c) = column(var) {
                    for j in 0..ns {
                        dense[(j, c)] -= h * w[j];
                    }
                }
            }
        }

        let gathered: Vec<f64> = self
            .partial_cells
            .iter()
            .map(|&(row, c)| dense[(row, c)])
            .collect();
        for (o, e) in out.iter_mut().zip(&self.entries) {
            *o = e.value(&gathered, base);
        }
        Some(())
    }
}

#[derive(Debug)]
enum Kernel {
    Implicit(ExprBlock),
    MassMatrix(MassMatrixKernel),
}

/// Defect constraints of all intervals.
#[derive(Debug)]
pub(crate) struct DefectEngine {
    kernel: Kernel,
    method: CollocationMethod,
    backend: EvalBackend,
    num_states: usize,
    num_intervals: usize,
}

impl DefectEngine {
    pub fn new(
        equations: &EquationsOfMotion,
        cls: &Classification,
        num_nodes: usize,
        method: CollocationMethod,
        backend: EvalBackend,
    ) -> CollocationResult<Self> {
        let slots = IntervalSlots {
            ns: cls.states().len(),
            nr: cls.unknown_trajectories().len(),
            nk: cls.known_trajectories().len(),
            np: cls.free_parameters().len(),
            nq: cls.known_parameters().len(),
        };
        let free_interval = cls.interval().is_some();
        let map = interval_substitution(cls, &slots, method);
        let kernel = match equations {
            EquationsOfMotion::Implicit(exprs) => {
                let rows: Vec<Expr> = exprs.iter().map(|e| localize(e, &map)).collect();
                Kernel::Implicit(ExprBlock::compile(
                    &rows,
                    slots.sources(),
                    free_interval,
                    "equation of motion",
                )?)
            }
            EquationsOfMotion::MassMatrix { mass, forcing } => Kernel::MassMatrix(
                MassMatrixKernel::compile(mass, forcing, &map, &slots, free_interval)?,
            ),
        };
        Ok(Self {
            kernel,
            method,
            backend,
            num_states: slots.ns,
            num_intervals: num_nodes - 1,
        })
    }

    pub fn method(&self) -> CollocationMethod {
        self.method
    }

    pub fn num_rows(&self) -> usize {
        self.num_states * self.num_intervals
    }

    fn entries(&self) -> &[Entry] {
        match &self.kernel {
            Kernel::Implicit(block) => block.entries(),
            Kernel::MassMatrix(k) => &k.entries,
        }
    }

    fn nnz_per_interval(&self) -> usize {
        self.entries().len()
    }

    pub fn nnz(&self) -> usize {
        self.nnz_per_interval() * self.num_intervals
    }

    /// Row of equation `j` on interval `i`.
    pub fn row(&self, equation: usize, interval: usize) -> usize {
        equation * self.num_intervals + interval
    }

    /// Node whose dynamics a defect on `interval` evaluates.
    fn evaluated_node(&self, interval: usize) -> usize {
        match self.method {
            CollocationMethod::BackwardEuler => interval + 1,
            CollocationMethod::Midpoint => interval,
        }
    }

    fn singular(&self, interval: usize) -> CollocationError {
        CollocationError::Discretization {
            what: "singular mass matrix".into(),
            node: Some(self.evaluated_node(interval)),
        }
    }

    /// Structure in the order of [`DefectEngine::jacobian_values`].
    pub fn structure(&self, ctx: &EvalContext<'_>, rows: &mut Vec<usize>, cols: &mut Vec<usize>) {
        for i in 0..self.num_intervals {
            for e in self.entries() {
                rows.push(self.row(e.row, i));
                cols.push(e.column(ctx, i));
            }
        }
    }

    pub fn residuals(
        &self,
        ctx: &EvalContext<'_>,
        x: &[f64],
        out: &mut [f64],
    ) -> CollocationResult<()> {
        let ns = self.num_states;
        let mut by_interval = vec![0.0; self.num_rows()];
        self.backend
            .for_each_chunk(&mut by_interval, ns, |i, scratch, chunk| {
                match &self.kernel {
                    Kernel::Implicit(block) => {
                        block.eval_rows(ctx, x, i, scratch, chunk);
                        Ok(())
                    }
                    Kernel::MassMatrix(k) => {
                        ctx.fill(&k.sources, i, x, &mut scratch.inputs);
                        k.residuals(scratch, chunk).ok_or(i)
                    }
                }
            })
            .map_err(|i| self.singular(i))?;
        for i in 0..self.num_intervals {
            for j in 0..ns {
                out[self.row(j, i)] = by_interval[i * ns + j];
            }
        }
        Ok(())
    }

    /// Jacobian values, interval-major, matching [`DefectEngine::structure`].
    pub fn jacobian_values(
        &self,
        ctx: &EvalContext<'_>,
        x: &[f64],
        out: &mut [f64],
    ) -> CollocationResult<()> {
        self.backend
            .for_each_chunk(out, self.nnz_per_interval(), |i, scratch, chunk| {
                match &self.kernel {
                    Kernel::Implicit(block) => {
                        block.eval_jacobian(ctx, x, i, scratch, chunk);
                        Ok(())
                    }
                    Kernel::MassMatrix(k) => {
                        ctx.fill(&k.sources, i, x, &mut scratch.inputs);
                        k.jacobian(i, scratch, chunk).ok_or(i)
                    }
                }
            })
            .map_err(|i| self.singular(i))
    }
}
