//! Runtime error types

use thiserror::Error;

/// Errors raised by generic operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Type error (e.g. reading an element of `undefined`)
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Range error (e.g. an array literal too large to allocate)
    #[error("RangeError: {0}")]
    RangeError(String),

    /// A handle that does not name a live string
    #[error("invalid string handle {0}")]
    InvalidString(u32),

    /// A handle that does not name a live object
    #[error("invalid object handle {0}")]
    InvalidObject(u64),

    /// A tag word that is not a value tag
    #[error("invalid value tag {0:#x}")]
    InvalidTag(u64),

    /// A hole read where a value was required
    #[error("unexpected hole")]
    UnexpectedHole,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
