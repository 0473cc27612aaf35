// src/utils/errors.rs
//! Engine error taxonomy
//!
//! Every fallible engine operation returns [`Result`]. Which variants reach
//! a caller depends on the operation:
//!
//! - `SubmitTask` → [`EngineError::Validation`]
//! - `GetTaskStatus` → [`EngineError::NotFound`]
//! - `CancelTask` → [`EngineError::NotFound`], [`EngineError::InvalidState`]
//! - `ScalePool` → [`EngineError::Bounds`], [`EngineError::Capacity`]
//!
//! [`EngineError::Handler`] and [`EngineError::Persistence`] raised inside a
//! worker are recorded on the task or logged; they never unwind past the
//! worker loop.

use crate::handler::HandlerError;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad priority, unknown domain or malformed request
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not permitted from the entity's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Scale request would leave a pool outside `[min_agents, max_agents]`
    #[error("pool bounds violated: {0}")]
    Bounds(String),

    /// No idle agent available, or not enough idle agents to remove
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("domain handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Store unreachable or rejected the write
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    /// Whether the control loop should simply try again on its next tick
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Capacity(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
