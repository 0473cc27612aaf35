// src/utils/mod.rs
//! Shared utilities: the error taxonomy and engine configuration.

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
