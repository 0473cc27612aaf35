// src/handler.rs
//! Domain handler collaborator
//!
//! The handler performs the actual domain work for a task (typically an LLM
//! provider call). The engine treats it as opaque: it hands over the task's
//! domain and payload and records whatever comes back. Failures are plain
//! values, so the worker's error path is an ordinary branch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Broad classification of a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// Upstream provider returned an error
    Provider,
    /// Payload could not be handled for this domain
    InvalidPayload,
    /// Upstream provider could not be reached
    Unavailable,
    /// Handler panicked; the panic was contained by the worker
    Panicked,
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerErrorKind::Provider => "provider",
            HandlerErrorKind::InvalidPayload => "invalid_payload",
            HandlerErrorKind::Unavailable => "unavailable",
            HandlerErrorKind::Panicked => "panicked",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`DomainHandler`]
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// External collaborator that performs domain-specific work.
///
/// `invoke` blocks the calling worker for the full duration of the call, so
/// the number of concurrent invocations is bounded by the worker count.
pub trait DomainHandler: Send + Sync {
    fn invoke(&self, domain: &str, payload: &str) -> Result<String, HandlerError>;
}

impl<F> DomainHandler for F
where
    F: Fn(&str, &str) -> Result<String, HandlerError> + Send + Sync,
{
    fn invoke(&self, domain: &str, payload: &str) -> Result<String, HandlerError> {
        self(domain, payload)
    }
}

/// Invoke a handler, converting a panic into a [`HandlerErrorKind::Panicked`] error
pub fn invoke_guarded(
    handler: &dyn DomainHandler,
    domain: &str,
    payload: &str,
) -> Result<String, HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(domain, payload))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::new(HandlerErrorKind::Panicked, message))
        }
    }
}

/// Handler that answers every payload with an echo.
///
/// Used by the binary when no provider integration is wired in, so the
/// queue, pools and monitor can be exercised end to end.
#[derive(Debug, Default, Clone)]
pub struct EchoHandler;

impl DomainHandler for EchoHandler {
    fn invoke(&self, domain: &str, payload: &str) -> Result<String, HandlerError> {
        if payload.trim().is_empty() {
            return Err(HandlerError::new(
                HandlerErrorKind::InvalidPayload,
                "empty payload",
            ));
        }
        Ok(format!("[{}] {}", domain, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_handler() {
        let handler = EchoHandler;
        assert_eq!(handler.invoke("general", "hello").unwrap(), "[general] hello");

        let err = handler.invoke("general", "   ").unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidPayload);
    }

    #[test]
    fn test_closure_handler() {
        let handler = |domain: &str, _payload: &str| -> Result<String, HandlerError> {
            Err(HandlerError::new(HandlerErrorKind::Unavailable, format!("{} offline", domain)))
        };
        let err = handler.invoke("sports", "odds").unwrap_err();
        assert_eq!(err.to_string(), "unavailable: sports offline");
    }

    #[test]
    fn test_panic_is_contained() {
        let handler = |_: &str, _: &str| -> Result<String, HandlerError> { panic!("provider exploded") };
        let err = invoke_guarded(&handler, "financial", "quote").unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Panicked);
        assert_eq!(err.message, "provider exploded");
    }
}
