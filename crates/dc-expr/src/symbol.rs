//! Named symbols.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::expr::Expr;

/// Whether a symbol varies with time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolKind {
    /// A scalar constant (known or free parameter, interval, time).
    Constant,
    /// A function of time (state or specified trajectory).
    Dynamic,
}

/// A named symbol. Identity is the name alone; the kind is an attribute
/// checked for consistency during classification.
#[derive(Clone)]
pub struct Symbol {
    name: Arc<str>,
    kind: SymbolKind,
}

impl Symbol {
    pub fn constant(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind: SymbolKind::Constant,
        }
    }

    pub fn dynamic(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind: SymbolKind::Dynamic,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind == SymbolKind::Dynamic
    }

    /// The symbol as an expression leaf.
    pub fn expr(&self) -> Expr {
        Expr::Sym(self.clone())
    }

    /// Time derivative of this symbol.
    pub fn der(&self) -> Expr {
        Expr::Der(self.clone())
    }

    /// This trajectory evaluated at `time`.
    pub fn at(&self, time: impl Into<Expr>) -> Expr {
        Expr::At(self.clone(), Box::new(time.into()))
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SymbolKind::Constant => write!(f, "{}", self.name),
            SymbolKind::Dynamic => write!(f, "{}(t)", self.name),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn split_names(names: &str) -> impl Iterator<Item = &str> {
    names
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

/// Constant symbols from a comma/whitespace separated list: `"m, g l"`.
pub fn symbols(names: &str) -> Vec<Symbol> {
    split_names(names).map(Symbol::constant).collect()
}

/// Dynamic symbols from a comma/whitespace separated list.
pub fn dynamic_symbols(names: &str) -> Vec<Symbol> {
    split_names(names).map(Symbol::dynamic).collect()
}
