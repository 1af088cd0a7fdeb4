// cellgrid-core/src/error.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported synchronously by the call that caused them. None of
/// these leaves partial state behind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Formula parse error: {0}")]
    Parse(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Circular dependency at {position} introduced by {text:?}")]
    CircularDependency { position: String, text: String },
}

/// Evaluation failures carried as cell values. A formula that hits one of
/// these still evaluates; the error propagates through referencing formulas.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellError {
    #[error("#DIV/0!")]
    DivisionByZero,

    #[error("#VALUE!")]
    InvalidValue,

    #[error("#REF!")]
    InvalidReference,
}
