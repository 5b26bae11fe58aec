//! Error types for the heartbeat runtime

use thiserror::Error;

use crate::config::ConfigError;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Runner error: {0}")]
    Runner(String),
}
