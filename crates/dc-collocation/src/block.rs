//! Compiled expression blocks.
//!
//! Defects, path constraints, and instance constraints are all written in
//! terms of local slot symbols (`@0`, `@1`, ...) whose values are gathered
//! from the free vector and the known data at a base node. A block compiles
//! its rows and their nonzero partial derivatives to tapes once; evaluating
//! it at another base node only changes where the inputs come from.

use dc_expr::{Atom, Expr, Symbol, Tape};

use crate::error::{CollocationError, CollocationResult};
use crate::layout::FreeLayout;

/// Unknown referenced by a block, relative to the block's base node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum LocalVar {
    /// State index, node offset
    State(usize, usize),
    /// Unknown trajectory index, node offset
    Trajectory(usize, usize),
    Parameter(usize),
    Interval,
    /// Time at node offset, `(base + offset) * h`
    Time(usize),
}

impl LocalVar {
    /// Interval and time both resolve to the interval column.
    pub fn follows_interval(self) -> bool {
        matches!(self, LocalVar::Interval | LocalVar::Time(_))
    }

    /// d(var)/d(column) through `t_k = k * h`.
    fn chain_factor(self, base: usize) -> f64 {
        match self {
            LocalVar::Time(offset) => (base + offset) as f64,
            _ => 1.0,
        }
    }
}

/// Where a slot value comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Source {
    Var(LocalVar),
    /// Known trajectory index, node offset
    Known(usize, usize),
    KnownParameter(usize),
}

/// Supplied numeric data, in classification order.
#[derive(Clone, Debug, Default)]
pub(crate) struct KnownValues {
    pub trajectories: Vec<Vec<f64>>,
    pub parameters: Vec<f64>,
}

/// Read-only view shared by every block evaluation.
#[derive(Clone, Copy)]
pub(crate) struct EvalContext<'a> {
    pub layout: &'a FreeLayout,
    pub known: &'a KnownValues,
}

impl EvalContext<'_> {
    fn value(&self, source: Source, base: usize, x: &[f64], h: f64) -> f64 {
        let layout = self.layout;
        match source {
            Source::Var(LocalVar::State(s, o)) => x[layout.state_index(s, base + o)],
            Source::Var(LocalVar::Trajectory(r, o)) => x[layout.trajectory_index(r, base + o)],
            Source::Var(LocalVar::Parameter(p)) => x[layout.parameter_index(p)],
            Source::Var(LocalVar::Interval) => h,
            Source::Var(LocalVar::Time(o)) => (base + o) as f64 * h,
            Source::Known(k, o) => self.known.trajectories[k][base + o],
            Source::KnownParameter(q) => self.known.parameters[q],
        }
    }

    pub fn fill(&self, sources: &[Source], base: usize, x: &[f64], out: &mut Vec<f64>) {
        let h = self.layout.interval_value(x);
        out.clear();
        out.extend(sources.iter().map(|&s| self.value(s, base, x, h)));
    }

    /// Global column of a local unknown.
    pub fn column(&self, var: LocalVar, base: usize) -> usize {
        let layout = self.layout;
        match var {
            LocalVar::State(s, o) => layout.state_index(s, base + o),
            LocalVar::Trajectory(r, o) => layout.trajectory_index(r, base + o),
            LocalVar::Parameter(p) => layout.parameter_index(p),
            // Only differentiated against when the interval is free.
            LocalVar::Interval | LocalVar::Time(_) => layout.interval_index().unwrap_or(usize::MAX),
        }
    }
}

/// Slot symbol `@slot`. The `@` cannot appear in parsed names.
pub(crate) fn local(slot: usize) -> Symbol {
    Symbol::constant(format!("@{slot}"))
}

pub(crate) fn local_expr(slot: usize) -> Expr {
    local(slot).expr()
}

pub(crate) fn local_slot(atom: &Atom) -> Option<usize> {
    match atom {
        Atom::Sym(s) => s.name().strip_prefix('@')?.parse().ok(),
        Atom::Der(_) => None,
    }
}

/// Jacobian column target of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Var(LocalVar),
    Interval,
}

/// One structural Jacobian non-zero of a block: the sum of one or more
/// local partials that land in the same column.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub row: usize,
    pub target: Target,
    /// (index into the partial values, variable the partial is taken against)
    pub terms: Vec<(usize, LocalVar)>,
}

impl Entry {
    pub fn column(&self, ctx: &EvalContext<'_>, base: usize) -> usize {
        match self.target {
            Target::Var(v) => ctx.column(v, base),
            Target::Interval => ctx.column(LocalVar::Interval, base),
        }
    }

    pub fn value(&self, partials: &[f64], base: usize) -> f64 {
        self.terms
            .iter()
            .map(|&(p, var)| partials[p] * var.chain_factor(base))
            .sum()
    }
}

/// Group partials `(row, var)` into entries, merging interval and time
/// partials of a row into one interval entry. Entry order follows the
/// first appearance of each (row, target).
pub(crate) fn fold(partials: &[(usize, LocalVar)]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::new();
    for (p, &(row, var)) in partials.iter().enumerate() {
        let target = if var.follows_interval() {
            Target::Interval
        } else {
            Target::Var(var)
        };
        match entries
            .iter_mut()
            .find(|e| e.row == row && e.target == target)
        {
            Some(e) => e.terms.push((p, var)),
            None => entries.push(Entry {
                row,
                target,
                terms: vec![(p, var)],
            }),
        }
    }
    entries
}

/// Reusable buffers for one evaluating thread.
#[derive(Default)]
pub(crate) struct Scratch {
    pub inputs: Vec<f64>,
    pub tape: Vec<f64>,
    pub values: Vec<f64>,
    pub partials: Vec<f64>,
}

/// Slots that are differentiated against.
pub(crate) fn differentiable(sources: &[Source], free_interval: bool) -> Vec<(usize, LocalVar)> {
    sources
        .iter()
        .enumerate()
        .filter_map(|(slot, source)| match *source {
            Source::Var(v) if !v.follows_interval() || free_interval => Some((slot, v)),
            _ => None,
        })
        .collect()
}

pub(crate) fn check_finite(e: &Expr, what: &str) -> CollocationResult<()> {
    if e.has_non_finite_constant() {
        return Err(CollocationError::Discretization {
            what: format!("{what} simplifies to a non-finite constant: {e}"),
            node: None,
        });
    }
    Ok(())
}

/// Rows of local expressions with their symbolic Jacobian.
#[derive(Clone, Debug)]
pub(crate) struct ExprBlock {
    sources: Vec<Source>,
    rows: Tape,
    partial_tape: Tape,
    entries: Vec<Entry>,
}

impl ExprBlock {
    pub fn compile(
        rows: &[Expr],
        sources: Vec<Source>,
        free_interval: bool,
        what: &str,
    ) -> CollocationResult<Self> {
        let vars = differentiable(&sources, free_interval);
        let mut partials = Vec::new();
        let mut partial_exprs = Vec::new();
        for (r, row) in rows.iter().enumerate() {
            check_finite(row, what)?;
            for &(slot, var) in &vars {
                let d = row.diff(&local(slot)).simplify();
                if d.is_zero() {
                    continue;
                }
                check_finite(&d, what)?;
                partials.push((r, var));
                partial_exprs.push(d);
            }
        }
        let n = sources.len();
        Ok(Self {
            rows: Tape::compile(rows, &local_slot, n)?,
            partial_tape: Tape::compile(&partial_exprs, &local_slot, n)?,
            entries: fold(&partials),
            sources,
        })
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn eval_rows(
        &self,
        ctx: &EvalContext<'_>,
        x: &[f64],
        base: usize,
        scratch: &mut Scratch,
        out: &mut [f64],
    ) {
        ctx.fill(&self.sources, base, x, &mut scratch.inputs);
        self.rows.eval(&scratch.inputs, &mut scratch.tape, out);
    }

    pub fn eval_jacobian(
        &self,
        ctx: &EvalContext<'_>,
        x: &[f64],
        base: usize,
        scratch: &mut Scratch,
        out: &mut [f64],
    ) {
        ctx.fill(&self.sources, base, x, &mut scratch.inputs);
        scratch.partials.resize(self.partial_tape.num_outputs(), 0.0);
        self.partial_tape
            .eval(&scratch.inputs, &mut scratch.tape, &mut scratch.partials);
        for (o, e) in out.iter_mut().zip(&self.entries) {
            *o = e.value(&scratch.partials, base);
        }
    }
}
