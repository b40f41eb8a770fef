//! Path constraints: `lower <= g(x, r, p, t) <= upper` at every node.

use std::collections::HashMap;
use std::convert::Infallible;

use dc_expr::{Atom, Expr};

use crate::block::{EvalContext, ExprBlock, LocalVar, Source, local_expr};
use crate::discretize::EvalBackend;
use crate::error::{CollocationError, CollocationResult};
use crate::symbols::Classification;

#[derive(Clone, Debug, PartialEq)]
pub struct PathConstraint {
    pub expr: Expr,
    pub lower: f64,
    pub upper: f64,
}

impl PathConstraint {
    pub fn new(expr: impl Into<Expr>, lower: f64, upper: f64) -> Self {
        Self {
            expr: expr.into(),
            lower,
            upper,
        }
    }
}

/// Node-local slots `[x(ns), r(nr), k(nk), p(np), q(nq), h, t]` and the
/// substitution of every classified symbol into them.
fn node_slots(cls: &Classification) -> (Vec<Source>, HashMap<Atom, Expr>) {
    let mut sources = Vec::new();
    let mut map = HashMap::new();
    let mut bind = |atom: Atom, source: Source, sources: &mut Vec<Source>| {
        map.insert(atom, local_expr(sources.len()));
        sources.push(source);
    };
    for (s, sym) in cls.states().iter().enumerate() {
        bind(Atom::Sym(sym.clone()), Source::Var(LocalVar::State(s, 0)), &mut sources);
    }
    for (r, sym) in cls.unknown_trajectories().iter().enumerate() {
        bind(Atom::Sym(sym.clone()), Source::Var(LocalVar::Trajectory(r, 0)), &mut sources);
    }
    for (k, sym) in cls.known_trajectories().iter().enumerate() {
        bind(Atom::Sym(sym.clone()), Source::Known(k, 0), &mut sources);
    }
    for (p, sym) in cls.free_parameters().iter().enumerate() {
        bind(Atom::Sym(sym.clone()), Source::Var(LocalVar::Parameter(p)), &mut sources);
    }
    for (q, sym) in cls.known_parameters().iter().enumerate() {
        bind(Atom::Sym(sym.clone()), Source::KnownParameter(q), &mut sources);
    }
    let interval = cls.interval().cloned();
    match interval {
        Some(h) => bind(Atom::Sym(h), Source::Var(LocalVar::Interval), &mut sources),
        None => sources.push(Source::Var(LocalVar::Interval)),
    }
    bind(Atom::Sym(cls.time().clone()), Source::Var(LocalVar::Time(0)), &mut sources);
    (sources, map)
}

/// All path constraints; row of constraint `c` at node `k` is `c * N + k`.
#[derive(Debug)]
pub(crate) struct PathSet {
    block: ExprBlock,
    bounds: Vec<(f64, f64)>,
    num_nodes: usize,
    backend: EvalBackend,
}

impl PathSet {
    pub fn compile(
        constraints: &[PathConstraint],
        cls: &Classification,
        num_nodes: usize,
        backend: EvalBackend,
    ) -> CollocationResult<Self> {
        for (i, c) in constraints.iter().enumerate() {
            let fail = |what: &str| {
                Err(CollocationError::config(format!("path constraint {i}: {what}")))
            };
            if !c.expr.derivative_symbols().is_empty() {
                return fail("der() is not allowed");
            }
            if !c.expr.evaluated_trajectories().is_empty() {
                return fail("trajectories cannot be sampled at a fixed time");
            }
            if !(c.lower <= c.upper) {
                return fail("lower bound exceeds upper bound");
            }
        }
        let (sources, map) = node_slots(cls);
        let rows: Vec<Expr> = constraints
            .iter()
            .map(|c| c.expr.substitute(&map).simplify())
            .collect();
        Ok(Self {
            block: ExprBlock::compile(&rows, sources, cls.interval().is_some(), "path constraint")?,
            bounds: constraints.iter().map(|c| (c.lower, c.upper)).collect(),
            num_nodes,
            backend,
        })
    }

    pub fn num_constraints(&self) -> usize {
        self.bounds.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_constraints() * self.num_nodes
    }

    pub fn nnz(&self) -> usize {
        self.block.nnz() * self.num_nodes
    }

    /// Bounds of every row, constraint-major.
    pub fn row_bounds(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.bounds
            .iter()
            .flat_map(|&b| std::iter::repeat_n(b, self.num_nodes))
    }

    pub fn structure(&self, ctx: &EvalContext<'_>, row0: usize, rows: &mut Vec<usize>, cols: &mut Vec<usize>) {
        for k in 0..self.num_nodes {
            for e in self.block.entries() {
                rows.push(row0 + e.row * self.num_nodes + k);
                cols.push(e.column(ctx, k));
            }
        }
    }

    pub fn values(&self, ctx: &EvalContext<'_>, x: &[f64], out: &mut [f64]) {
        let m = self.num_constraints();
        let mut by_node = vec![0.0; self.num_rows()];
        let Ok(()) = self
            .backend
            .for_each_chunk::<_, Infallible>(&mut by_node, m, |k, scratch, chunk| {
                self.block.eval_rows(ctx, x, k, scratch, chunk);
                Ok(())
            });
        for k in 0..self.num_nodes {
            for c in 0..m {
                out[c * self.num_nodes + k] = by_node[k * m + c];
            }
        }
    }

    pub fn jacobian_values(&self, ctx: &EvalContext<'_>, x: &[f64], out: &mut [f64]) {
        let Ok(()) = self
            .backend
            .for_each_chunk::<_, Infallible>(out, self.block.nnz(), |k, scratch, chunk| {
                self.block.eval_jacobian(ctx, x, k, scratch, chunk);
                Ok(())
            });
    }
}
