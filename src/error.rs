//! Error types for the concentrator.
//!
//! Only configuration problems and publish-hook failures are surfaced as
//! errors. Bad samples are never errors: they are dropped and counted by the
//! concentrator statistics.

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::ticks::Ticks;

// ----------------------------------------------------------------------------
// 4.1 Core Concentrator Errors
// ----------------------------------------------------------------------------

/// The main error type for the concentrator.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ConcentratorError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Publication Errors ----
    #[error("Publication error: {0}")]
    Publish(#[from] PublishError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ConcentratorError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConcentratorError::Config(_) => false,
            ConcentratorError::Publish(_) => true,
            ConcentratorError::Io(_) => true,
            ConcentratorError::Internal(_) => false,
            ConcentratorError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ConcentratorError::Config(_) => "config",
            ConcentratorError::Publish(_) => "publish",
            ConcentratorError::Io(_) => "io",
            ConcentratorError::Internal(_) => "internal",
            ConcentratorError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConfigError::ParseError {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Publication Errors
// ----------------------------------------------------------------------------

/// Failures raised by a frame handler while publishing a frame.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Publishing frame {timestamp} failed: {message}")]
    Failed { timestamp: Ticks, message: String },

    #[error("Frame handler panicked while publishing frame {timestamp}: {message}")]
    Panicked { timestamp: Ticks, message: String },
}

impl PublishError {
    pub fn failed(timestamp: Ticks, message: impl Into<String>) -> Self {
        PublishError::Failed {
            timestamp,
            message: message.into(),
        }
    }

    /// Timestamp of the frame that failed to publish.
    pub fn timestamp(&self) -> Ticks {
        match self {
            PublishError::Failed { timestamp, .. } | PublishError::Panicked { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for concentrator operations
pub type ConcentratorResult<T> = Result<T, ConcentratorError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let config: ConcentratorError = ConfigError::invalid_value("lag_time", "must be > 0").into();
        assert!(!config.is_recoverable());
        assert_eq!(config.category(), "config");

        let publish: ConcentratorError = PublishError::failed(Ticks::from_secs(1), "sink closed").into();
        assert!(publish.is_recoverable());
        assert_eq!(publish.category(), "publish");
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::invalid_value("frames_per_second", "must be between 1 and 1000");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for 'frames_per_second': must be between 1 and 1000"
        );

        let err = PublishError::failed(Ticks::ZERO, "boom");
        assert_eq!(err.timestamp(), Ticks::ZERO);
        assert!(err.to_string().contains("boom"));
    }
}
