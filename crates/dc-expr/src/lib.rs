//! Symbolic expressions for equations of motion and constraints.
//!
//! The collocation engine never sees closures for the dynamics; it receives
//! `Expr` trees, classifies their symbols, differentiates them symbolically,
//! and compiles the results into flat [`Tape`] programs that are evaluated
//! once per node interval.

pub mod diff;
pub mod error;
pub mod expr;
pub mod parse;
pub mod symbol;
pub mod tape;

pub use error::{ExprError, ExprResult};
pub use expr::{Atom, Expr, Func};
pub use parse::{Parser, parse};
pub use symbol::{Symbol, SymbolKind, dynamic_symbols, symbols};
pub use tape::Tape;
