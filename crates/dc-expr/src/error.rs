//! Error types for expression handling.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Parse error at byte {offset}: {what}")]
    Parse { what: String, offset: usize },

    #[error("No value or slot bound for {atom}")]
    Unbound { atom: String },

    #[error("Trajectory {symbol} is evaluated at a time; resolve it before compiling")]
    UnresolvedTimeEvaluation { symbol: String },
}

pub type ExprResult<T> = Result<T, ExprError>;
