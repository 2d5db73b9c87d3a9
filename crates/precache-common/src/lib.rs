//! # Precache Common
//!
//! Shared building blocks for the precache workspace.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - Best-effort results for operations whose failure is tolerated
//! - JSON configuration loading
//! - Logging configuration and setup

use thiserror::Error;

pub mod best_effort;
pub mod config;
pub mod logging;

pub use best_effort::BestEffort;
pub use config::load_json;
pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for precache.
#[derive(Error, Debug)]
pub enum PrecacheError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl PrecacheError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }
}

/// Result type alias for precache operations.
pub type Result<T> = std::result::Result<T, PrecacheError>;
