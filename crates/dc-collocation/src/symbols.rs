//! Symbol classification.
//!
//! Every symbol mentioned by the equations of motion and the constraints is
//! assigned exactly one role. Roles, and the index each entity gets, are
//! fixed here and never change for the lifetime of a problem.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dc_core::{Id, ParamId, StateId, TrajectoryId};
use dc_expr::{Expr, Symbol};
use tracing::warn;

use crate::error::{CollocationError, CollocationResult};

/// What a symbol stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolRole {
    State(StateId),
    /// Specified trajectory whose node values are unknowns
    UnknownTrajectory(TrajectoryId),
    /// Scalar unknown, constant across nodes
    FreeParameter(ParamId),
    /// Specified trajectory with supplied node values; index into the used known trajectories
    KnownTrajectory(usize),
    /// Scalar with a supplied value; index into the used known parameters
    KnownParameter(usize),
    Time,
    Interval,
}

/// Result of classifying all symbols of a problem.
#[derive(Clone, Debug)]
pub struct Classification {
    states: Vec<Symbol>,
    unknown_trajectories: Vec<Symbol>,
    free_parameters: Vec<Symbol>,
    known_trajectories: Vec<Symbol>,
    known_parameters: Vec<Symbol>,
    time: Symbol,
    interval: Option<Symbol>,
    roles: HashMap<Symbol, SymbolRole>,
}

/// Everything classification looks at.
pub(crate) struct ClassifyInput<'a> {
    pub exprs: Vec<&'a Expr>,
    pub states: &'a [Symbol],
    pub time: &'a Symbol,
    pub interval: Option<&'a Symbol>,
    pub known_parameters: &'a BTreeMap<Symbol, f64>,
    pub known_trajectories: &'a BTreeMap<Symbol, Vec<f64>>,
    pub bounds: &'a BTreeMap<Symbol, (f64, f64)>,
    pub declared_free: &'a BTreeSet<Symbol>,
}

fn ambiguous(what: String) -> CollocationError {
    CollocationError::config(format!("ambiguous symbol: {what}"))
}

fn unresolved(what: String) -> CollocationError {
    CollocationError::config(format!("unresolved symbol: {what}"))
}

impl Classification {
    pub(crate) fn classify(input: &ClassifyInput<'_>) -> CollocationResult<Self> {
        let states = input.states;
        let is_state = |s: &Symbol| states.contains(s);
        let is_interval = |s: &Symbol| input.interval == Some(s);

        // (written as constant, written as trajectory)
        let mut kinds: BTreeMap<Symbol, (bool, bool)> = BTreeMap::new();
        for e in &input.exprs {
            for s in e.symbol_occurrences() {
                let entry = kinds.entry(s.clone()).or_default();
                if s.is_dynamic() {
                    entry.1 = true;
                } else {
                    entry.0 = true;
                }
            }
        }
        if let Some((s, _)) = kinds.iter().find(|(_, (c, d))| *c && *d) {
            return Err(ambiguous(format!(
                "'{s}' is used both as a constant and as a trajectory"
            )));
        }

        let mut seen = BTreeSet::new();
        for s in states {
            if !seen.insert(s) {
                return Err(CollocationError::config(format!("state '{s}' listed twice")));
            }
            if !s.is_dynamic() {
                return Err(CollocationError::config(format!(
                    "state '{s}' must be a dynamic symbol"
                )));
            }
            if kinds.get(s) == Some(&(true, false)) {
                return Err(ambiguous(format!("state '{s}' is used as a constant")));
            }
        }

        let time = input.time;
        if is_interval(time) {
            return Err(ambiguous(format!(
                "'{time}' is both the time symbol and the node interval"
            )));
        }
        for special in std::iter::once(time).chain(input.interval) {
            if is_state(special)
                || input.known_parameters.contains_key(special)
                || input.known_trajectories.contains_key(special)
                || input.declared_free.contains(special)
            {
                return Err(ambiguous(format!(
                    "'{special}' is reserved for time or the node interval"
                )));
            }
        }
        if input.bounds.contains_key(time) {
            return Err(CollocationError::config(format!(
                "bounds given for the time symbol '{time}'"
            )));
        }
        for key in input.known_parameters.keys() {
            if input.known_trajectories.contains_key(key) {
                return Err(ambiguous(format!(
                    "'{key}' is both a known parameter and a known trajectory"
                )));
            }
            if is_state(key) {
                return Err(ambiguous(format!("'{key}' is both a state and a known parameter")));
            }
        }
        if let Some(key) = input.known_trajectories.keys().find(|k| is_state(k)) {
            return Err(ambiguous(format!("'{key}' is both a state and a known trajectory")));
        }

        for e in &input.exprs {
            if let Some(s) = e.derivative_symbols().into_iter().find(|s| !is_state(s)) {
                return Err(CollocationError::config(format!(
                    "der({s}) taken of a symbol that is not a state"
                )));
            }
        }

        let mut unknown = BTreeSet::new();
        let mut free = BTreeSet::new();
        for (s, &(_, dynamic)) in &kinds {
            if s == time
                || is_interval(s)
                || is_state(s)
                || input.known_trajectories.contains_key(s)
                || input.known_parameters.contains_key(s)
            {
                continue;
            }
            if input.bounds.contains_key(s) || input.declared_free.contains(s) {
                if dynamic {
                    unknown.insert(s.clone());
                } else {
                    free.insert(s.clone());
                }
            } else {
                return Err(unresolved(format!(
                    "'{s}' is not a state, known value, or declared free unknown"
                )));
            }
        }

        for s in input.bounds.keys().chain(input.declared_free.iter()) {
            if is_state(s) || is_interval(s) || unknown.contains(s) || free.contains(s) {
                continue;
            }
            if input.known_parameters.contains_key(s) || input.known_trajectories.contains_key(s) {
                return Err(CollocationError::config(format!(
                    "'{s}' has a known value and cannot be free"
                )));
            }
            return Err(unresolved(format!("'{s}' is declared free but never used")));
        }

        let used = |s: &&Symbol| kinds.contains_key(*s);
        let known_trajectories: Vec<Symbol> = input
            .known_trajectories
            .keys()
            .filter(used)
            .cloned()
            .collect();
        let known_parameters: Vec<Symbol> = input
            .known_parameters
            .keys()
            .filter(used)
            .cloned()
            .collect();
        for s in input
            .known_trajectories
            .keys()
            .chain(input.known_parameters.keys())
            .filter(|s| !kinds.contains_key(*s))
        {
            warn!(symbol = %s, "known value is never used; ignoring it");
        }

        let mut roles = HashMap::new();
        roles.insert(time.clone(), SymbolRole::Time);
        if let Some(h) = input.interval {
            roles.insert(h.clone(), SymbolRole::Interval);
        }
        for (i, s) in states.iter().enumerate() {
            roles.insert(s.clone(), SymbolRole::State(Id::from_index(i)));
        }
        for (i, s) in unknown.iter().enumerate() {
            roles.insert(s.clone(), SymbolRole::UnknownTrajectory(Id::from_index(i)));
        }
        for (i, s) in free.iter().enumerate() {
            roles.insert(s.clone(), SymbolRole::FreeParameter(Id::from_index(i)));
        }
        for (i, s) in known_trajectories.iter().enumerate() {
            roles.insert(s.clone(), SymbolRole::KnownTrajectory(i));
        }
        for (i, s) in known_parameters.iter().enumerate() {
            roles.insert(s.clone(), SymbolRole::KnownParameter(i));
        }

        Ok(Self {
            states: states.to_vec(),
            unknown_trajectories: unknown.into_iter().collect(),
            free_parameters: free.into_iter().collect(),
            known_trajectories,
            known_parameters,
            time: time.clone(),
            interval: input.interval.cloned(),
            roles,
        })
    }

    pub fn role(&self, symbol: &Symbol) -> Option<SymbolRole> {
        self.roles.get(symbol).copied()
    }

    pub fn states(&self) -> &[Symbol] {
        &self.states
    }

    pub fn unknown_trajectories(&self) -> &[Symbol] {
        &self.unknown_trajectories
    }

    pub fn free_parameters(&self) -> &[Symbol] {
        &self.free_parameters
    }

    pub fn known_trajectories(&self) -> &[Symbol] {
        &self.known_trajectories
    }

    pub fn known_parameters(&self) -> &[Symbol] {
        &self.known_parameters
    }

    pub fn time(&self) -> &Symbol {
        &self.time
    }

    pub fn interval(&self) -> Option<&Symbol> {
        self.interval.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        exprs: Vec<Expr>,
        states: Vec<Symbol>,
        time: Symbol,
        interval: Option<Symbol>,
        known_parameters: BTreeMap<Symbol, f64>,
        known_trajectories: BTreeMap<Symbol, Vec<f64>>,
        bounds: BTreeMap<Symbol, (f64, f64)>,
        declared_free: BTreeSet<Symbol>,
    }

    impl Fixture {
        fn new(exprs: Vec<Expr>, states: &[&str]) -> Self {
            Self {
                exprs,
                states: states.iter().map(Symbol::dynamic).collect(),
                time: Symbol::constant("t"),
                interval: None,
                known_parameters: BTreeMap::new(),
                known_trajectories: BTreeMap::new(),
                bounds: BTreeMap::new(),
                declared_free: BTreeSet::new(),
            }
        }

        fn classify(&self) -> CollocationResult<Classification> {
            Classification::classify(&ClassifyInput {
                exprs: self.exprs.iter().collect(),
                states: &self.states,
                time: &self.time,
                interval: self.interval.as_ref(),
                known_parameters: &self.known_parameters,
                known_trajectories: &self.known_trajectories,
                bounds: &self.bounds,
                declared_free: &self.declared_free,
            })
        }
    }

    fn config_message(result: CollocationResult<Classification>) -> String {
        match result {
            Err(CollocationError::Configuration { what }) => what,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn roles_follow_maps_and_bounds() {
        let x = Symbol::dynamic("x");
        let v = Symbol::dynamic("v");
        let u = Symbol::dynamic("u");
        let m = Symbol::dynamic("m");
        let k = Symbol::constant("k");
        let c = Symbol::constant("c");
        let t = Symbol::constant("t");
        let mut f = Fixture::new(
            vec![
                x.der() - &v,
                v.der() + &k * &x + &c * &v - &u - &m * t.expr().sin(),
            ],
            &["x", "v"],
        );
        f.known_parameters.insert(k.clone(), 2.0);
        f.known_trajectories.insert(m.clone(), vec![0.0; 4]);
        f.bounds.insert(c.clone(), (0.0, 10.0));
        f.declared_free.insert(u.clone());

        let cls = f.classify().unwrap();
        assert_eq!(cls.role(&x), Some(SymbolRole::State(Id::from_index(0))));
        assert_eq!(cls.role(&v), Some(SymbolRole::State(Id::from_index(1))));
        assert_eq!(cls.role(&u), Some(SymbolRole::UnknownTrajectory(Id::from_index(0))));
        assert_eq!(cls.role(&c), Some(SymbolRole::FreeParameter(Id::from_index(0))));
        assert_eq!(cls.role(&k), Some(SymbolRole::KnownParameter(0)));
        assert_eq!(cls.role(&m), Some(SymbolRole::KnownTrajectory(0)));
        assert_eq!(cls.role(&t), Some(SymbolRole::Time));
    }

    #[test]
    fn free_unknowns_are_ordered_by_name() {
        let x = Symbol::dynamic("x");
        let exprs = vec![x.der() - Symbol::constant("b").expr() - Symbol::constant("a").expr()];
        let mut f = Fixture::new(exprs, &["x"]);
        f.declared_free.insert(Symbol::constant("b"));
        f.declared_free.insert(Symbol::constant("a"));
        let cls = f.classify().unwrap();
        let names: Vec<&str> = cls.free_parameters().iter().map(Symbol::name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn undeclared_symbol_is_unresolved() {
        let x = Symbol::dynamic("x");
        let f = Fixture::new(vec![x.der() + Symbol::constant("k").expr() * &x], &["x"]);
        assert!(config_message(f.classify()).contains("unresolved"));
    }

    #[test]
    fn mixed_kinds_are_ambiguous() {
        let x = Symbol::dynamic("x");
        let f = Fixture::new(
            vec![x.der() + Symbol::constant("q").expr() * Symbol::dynamic("q").expr()],
            &["x"],
        );
        assert!(config_message(f.classify()).contains("ambiguous"));
    }

    #[test]
    fn symbol_in_two_known_maps_is_ambiguous() {
        let x = Symbol::dynamic("x");
        let k = Symbol::constant("k");
        let mut f = Fixture::new(vec![x.der() + &k * &x], &["x"]);
        f.known_parameters.insert(k.clone(), 1.0);
        f.known_trajectories.insert(k.clone(), vec![1.0; 3]);
        assert!(config_message(f.classify()).contains("ambiguous"));
    }

    #[test]
    fn derivative_of_non_state_is_rejected() {
        let x = Symbol::dynamic("x");
        let u = Symbol::dynamic("u");
        let mut f = Fixture::new(vec![x.der() - u.der()], &["x"]);
        f.declared_free.insert(u);
        assert!(config_message(f.classify()).contains("not a state"));
    }

    #[test]
    fn bounds_on_unused_symbol_are_rejected() {
        let x = Symbol::dynamic("x");
        let mut f = Fixture::new(vec![x.der() + &x], &["x"]);
        f.bounds.insert(Symbol::constant("ghost"), (0.0, 1.0));
        assert!(config_message(f.classify()).contains("unresolved"));
    }

    #[test]
    fn unused_known_values_are_ignored() {
        let x = Symbol::dynamic("x");
        let mut f = Fixture::new(vec![x.der() + &x], &["x"]);
        f.known_parameters.insert(Symbol::constant("unused"), 3.0);
        let cls = f.classify().unwrap();
        assert!(cls.known_parameters().is_empty());
    }
}
