//! Error types for the crossbar engine

use thiserror::Error;

/// Core error type
///
/// Setup-time operations return these synchronously. On the real-time path
/// they abort a single period of a single chain and are reported as events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XbError {
    /// Bad caller input
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Operation attempted before a required setup step
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Referenced stream is not part of this pipeline or module
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    /// Referenced pin is not part of this pipeline
    #[error("Invalid pin: {0}")]
    InvalidPin(String),

    #[error("Not enough memory")]
    NotEnoughMemory,

    /// A bounded capacity (queue, reader slots, bundle lanes) is exhausted
    #[error("No space left: {0}")]
    NoSpaceLeft(String),

    /// Generic setup-time failure
    #[error("Failed: {0}")]
    Failed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type XbResult<T> = Result<T, XbError>;

impl From<std::collections::TryReserveError> for XbError {
    fn from(_: std::collections::TryReserveError) -> Self {
        XbError::NotEnoughMemory
    }
}

impl From<serde_json::Error> for XbError {
    fn from(err: serde_json::Error) -> Self {
        XbError::Config(err.to_string())
    }
}
