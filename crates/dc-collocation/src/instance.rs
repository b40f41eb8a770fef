//! Instance constraints: conditions anchored to specific node times.

use std::collections::{BTreeSet, HashMap};

use dc_expr::{Atom, Expr, Symbol};

use crate::block::{EvalContext, ExprBlock, LocalVar, Scratch, Source, local_expr};
use crate::error::{CollocationError, CollocationResult};
use crate::grid::NodeGrid;
use crate::symbols::{Classification, SymbolRole};

/// Relative slack allowed when a sample time is matched to a node.
const NODE_MATCH_TOL: f64 = 1e-6;

/// `lower <= expr <= upper`, where `expr` samples trajectories with `x(T)`.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceConstraint {
    pub expr: Expr,
    pub lower: f64,
    pub upper: f64,
}

impl InstanceConstraint {
    /// `expr == 0`
    pub fn equality(expr: impl Into<Expr>) -> Self {
        Self::with_target(expr, 0.0)
    }

    /// `expr == target`
    pub fn with_target(expr: impl Into<Expr>, target: f64) -> Self {
        Self::bounded(expr, target, target)
    }

    pub fn bounded(expr: impl Into<Expr>, lower: f64, upper: f64) -> Self {
        Self {
            expr: expr.into(),
            lower,
            upper,
        }
    }
}

impl From<Expr> for InstanceConstraint {
    fn from(expr: Expr) -> Self {
        Self::equality(expr)
    }
}

/// Resolve a sample time to a node index.
///
/// With a fixed interval the time must land on a node. With a free interval
/// the time must be an integer multiple `k * h` of the interval symbol.
fn resolve_node(
    time: &Expr,
    cls: &Classification,
    grid: &NodeGrid,
    known_parameters: &[f64],
    used_parameters: &mut BTreeSet<Symbol>,
) -> CollocationResult<usize> {
    for s in time.free_symbols() {
        match cls.role(&s) {
            Some(SymbolRole::KnownParameter(_)) => {
                used_parameters.insert(s);
            }
            Some(SymbolRole::Interval) => {}
            _ => {
                return Err(CollocationError::config(format!(
                    "sample time {time} may only use known parameters and the node interval, found '{s}'"
                )));
            }
        }
    }
    let at = |h: f64| {
        time.eval_with(&|atom: &Atom| match atom {
            Atom::Sym(s) => match cls.role(s) {
                Some(SymbolRole::KnownParameter(q)) => Some(known_parameters[q]),
                Some(SymbolRole::Interval) => Some(h),
                _ => None,
            },
            Atom::Der(_) => None,
        })
    };

    let node = match grid.fixed_interval() {
        Some(h) => at(h)? / h,
        None => {
            let (t0, t1, t2) = (at(0.0)?, at(1.0)?, at(2.0)?);
            if t0.abs() > NODE_MATCH_TOL || (t2 - 2.0 * t1).abs() > NODE_MATCH_TOL * t1.abs().max(1.0) {
                return Err(CollocationError::config(format!(
                    "sample time {time} must be an integer multiple of the free node interval"
                )));
            }
            t1
        }
    };
    let rounded = node.round();
    if !node.is_finite() || (node - rounded).abs() > NODE_MATCH_TOL * rounded.abs().max(1.0) {
        return Err(CollocationError::config(format!(
            "sample time {time} does not fall on a node (node position {node})"
        )));
    }
    if rounded < 0.0 || rounded > (grid.num_nodes() - 1) as f64 {
        return Err(CollocationError::config(format!(
            "sample time {time} is outside the grid (node {rounded}, {} nodes)",
            grid.num_nodes()
        )));
    }
    Ok(rounded as usize)
}

/// Slot expression for `source`, adding the slot on first use.
fn slot_of(source: Source, sources: &mut Vec<Source>) -> Expr {
    let slot = sources.iter().position(|s| *s == source).unwrap_or_else(|| {
        sources.push(source);
        sources.len() - 1
    });
    local_expr(slot)
}

struct Compiled {
    block: ExprBlock,
    first_node: Option<usize>,
}

fn compile_one(
    c: &InstanceConstraint,
    index: usize,
    cls: &Classification,
    grid: &NodeGrid,
    known_parameters: &[f64],
    used_parameters: &mut BTreeSet<Symbol>,
) -> CollocationResult<Compiled> {
    let context = |what: String| CollocationError::config(format!("instance constraint {index}: {what}"));
    if !c.expr.derivative_symbols().is_empty() {
        return Err(context("der() is not allowed".into()));
    }
    if !(c.lower <= c.upper) {
        return Err(context(format!("lower bound {} exceeds upper bound {}", c.lower, c.upper)));
    }

    let mut sources: Vec<Source> = Vec::new();

    let mut first_node: Option<usize> = None;
    let sampled = c.expr.try_map_at(&mut |sym: &Symbol, time: &Expr| {
        let node = resolve_node(time, cls, grid, known_parameters, used_parameters)?;
        first_node = Some(first_node.map_or(node, |n| n.min(node)));
        let source = match cls.role(sym) {
            Some(SymbolRole::State(id)) => Source::Var(LocalVar::State(id.index(), node)),
            Some(SymbolRole::UnknownTrajectory(id)) => {
                Source::Var(LocalVar::Trajectory(id.index(), node))
            }
            Some(SymbolRole::KnownTrajectory(k)) => Source::Known(k, node),
            _ => {
                return Err(CollocationError::config(format!(
                    "instance constraint {index}: '{sym}' is not a trajectory and cannot be sampled"
                )));
            }
        };
        Ok(slot_of(source, &mut sources))
    })?;

    let mut map: HashMap<Atom, Expr> = HashMap::new();
    for s in sampled.free_symbols() {
        let source = match cls.role(&s) {
            Some(SymbolRole::FreeParameter(id)) => Source::Var(LocalVar::Parameter(id.index())),
            Some(SymbolRole::KnownParameter(q)) => Source::KnownParameter(q),
            Some(SymbolRole::Interval) => Source::Var(LocalVar::Interval),
            Some(SymbolRole::Time) => {
                return Err(context(format!("the time symbol '{s}' must not appear unsampled")));
            }
            Some(_) => {
                return Err(context(format!(
                    "trajectory '{s}' must be sampled at a time, e.g. {s}(0)"
                )));
            }
            None if s.name().starts_with('@') => continue,
            None => return Err(context(format!("'{s}' is not classified"))),
        };
        map.insert(Atom::Sym(s), slot_of(source, &mut sources));
    }
    let local = sampled.substitute(&map).simplify();

    let block = ExprBlock::compile(
        &[local],
        sources,
        grid.interval_symbol().is_some(),
        "instance constraint",
    )?;
    Ok(Compiled { block, first_node })
}

/// All instance constraints, one row each, in caller order.
#[derive(Debug)]
pub(crate) struct InstanceSet {
    blocks: Vec<ExprBlock>,
    first_nodes: Vec<Option<usize>>,
    bounds: Vec<(f64, f64)>,
    /// Known parameters that place a sample in time
    time_parameters: BTreeSet<Symbol>,
}

impl InstanceSet {
    pub fn compile(
        constraints: &[InstanceConstraint],
        cls: &Classification,
        grid: &NodeGrid,
        known_parameters: &[f64],
    ) -> CollocationResult<Self> {
        let mut time_parameters = BTreeSet::new();
        let mut blocks = Vec::with_capacity(constraints.len());
        let mut first_nodes = Vec::with_capacity(constraints.len());
        for (i, c) in constraints.iter().enumerate() {
            let compiled = compile_one(c, i, cls, grid, known_parameters, &mut time_parameters)?;
            blocks.push(compiled.block);
            first_nodes.push(compiled.first_node);
        }
        Ok(Self {
            blocks,
            first_nodes,
            bounds: constraints.iter().map(|c| (c.lower, c.upper)).collect(),
            time_parameters,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.blocks.len()
    }

    pub fn nnz(&self) -> usize {
        self.blocks.iter().map(ExprBlock::nnz).sum()
    }

    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    /// Earliest node sampled by constraint `index`.
    pub fn first_node(&self, index: usize) -> Option<usize> {
        self.first_nodes[index]
    }

    pub fn places_samples(&self, symbol: &Symbol) -> bool {
        self.time_parameters.contains(symbol)
    }

    pub fn structure(&self, ctx: &EvalContext<'_>, row0: usize, rows: &mut Vec<usize>, cols: &mut Vec<usize>) {
        for (i, block) in self.blocks.iter().enumerate() {
            for e in block.entries() {
                rows.push(row0 + i);
                cols.push(e.column(ctx, 0));
            }
        }
    }

    pub fn values(&self, ctx: &EvalContext<'_>, x: &[f64], out: &mut [f64]) {
        let mut scratch = Scratch::default();
        for (block, o) in self.blocks.iter().zip(out.chunks_mut(1)) {
            block.eval_rows(ctx, x, 0, &mut scratch, o);
        }
    }

    pub fn jacobian_values(&self, ctx: &EvalContext<'_>, x: &[f64], out: &mut [f64]) {
        let mut scratch = Scratch::default();
        let mut start = 0;
        for block in &self.blocks {
            let end = start + block.nnz();
            block.eval_jacobian(ctx, x, 0, &mut scratch, &mut out[start..end]);
            start = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Interval;
    use crate::symbols::ClassifyInput;
    use std::collections::BTreeMap;

    fn setup(interval: Interval, known: &[(&str, f64)]) -> (Classification, NodeGrid, Vec<f64>) {
        let x = Symbol::dynamic("x");
        let eq = x.der() - Symbol::dynamic("u").expr();
        let known_parameters: BTreeMap<Symbol, f64> = known
            .iter()
            .map(|(n, v)| (Symbol::constant(n), *v))
            .collect();
        let mut declared = BTreeSet::new();
        declared.insert(Symbol::dynamic("u"));
        let uses: Vec<Expr> = known
            .iter()
            .map(|(n, _)| Symbol::constant(n).expr() * &x)
            .collect();
        let mut exprs = vec![&eq];
        exprs.extend(uses.iter());
        let interval_symbol = match &interval {
            Interval::Free(h) => Some(h.clone()),
            Interval::Fixed(_) => None,
        };
        let cls = Classification::classify(&ClassifyInput {
            exprs,
            states: &[x],
            time: &Symbol::constant("t"),
            interval: interval_symbol.as_ref(),
            known_parameters: &known_parameters,
            known_trajectories: &BTreeMap::new(),
            bounds: &BTreeMap::new(),
            declared_free: &declared,
        })
        .unwrap();
        let values = cls.known_parameters().iter().map(|s| known_parameters[s]).collect();
        (cls, NodeGrid::new(11, interval).unwrap(), values)
    }

    #[test]
    fn fixed_interval_times_map_to_nodes() {
        let (cls, grid, known) = setup(Interval::Fixed(0.1), &[("duration", 1.0)]);
        let mut used = BTreeSet::new();
        let dur = Symbol::constant("duration");
        assert_eq!(resolve_node(&dur.expr(), &cls, &grid, &known, &mut used).unwrap(), 10);
        assert!(used.contains(&dur));
        assert_eq!(resolve_node(&Expr::Const(0.3), &cls, &grid, &known, &mut used).unwrap(), 3);
        assert!(resolve_node(&Expr::Const(0.35), &cls, &grid, &known, &mut used).is_err());
        assert!(resolve_node(&Expr::Const(1.1), &cls, &grid, &known, &mut used).is_err());
    }

    #[test]
    fn free_interval_times_must_scale_with_h() {
        let h = Symbol::constant("h");
        let (cls, grid, known) = setup(Interval::Free(h.clone()), &[]);
        let mut used = BTreeSet::new();
        assert_eq!(resolve_node(&(10.0 * &h), &cls, &grid, &known, &mut used).unwrap(), 10);
        assert!(resolve_node(&(h.expr() + 1.0), &cls, &grid, &known, &mut used).is_err());
        assert!(resolve_node(&Expr::Const(0.5), &cls, &grid, &known, &mut used).is_err());
    }

    #[test]
    fn bare_trajectory_is_rejected() {
        let (cls, grid, known) = setup(Interval::Fixed(0.1), &[]);
        let x = Symbol::dynamic("x");
        let err = InstanceSet::compile(&[InstanceConstraint::equality(x.expr())], &cls, &grid, &known)
            .unwrap_err();
        assert!(err.to_string().contains("must be sampled"));
        let ok = InstanceSet::compile(
            &[InstanceConstraint::with_target(x.at(0.0) + x.at(1.0), 1.0)],
            &cls,
            &grid,
            &known,
        )
        .unwrap();
        assert_eq!(ok.num_rows(), 1);
        assert_eq!(ok.nnz(), 2);
        assert_eq!(ok.first_node(0), Some(0));
        assert_eq!(ok.bounds()[0], (1.0, 1.0));
    }
}
