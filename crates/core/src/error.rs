//! Error types shared across the tracelens engine

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for engine operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while reading or writing engine state
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(tracelens::core::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "stat", "write")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Configuration error: {message}")]
    #[diagnostic(code(tracelens::core::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(tracelens::core::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A registered user function threw or rejected
    #[error("Item '{item}' failed: {message}")]
    #[diagnostic(
        code(tracelens::core::user_function),
        help("The failure is recorded per item; sibling items are unaffected")
    )]
    UserFunction {
        /// Name of the registered item that failed
        item: String,
        /// Failure message reported by the item
        message: String,
    },

    /// Unexpected internal scheduling failure
    #[error("Scheduling error: {message}")]
    #[diagnostic(code(tracelens::core::scheduling))]
    Scheduling {
        /// Error message describing the scheduling failure
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a user-function error
    #[must_use]
    pub fn user_function(item: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UserFunction {
            item: item.into(),
            message: msg.into(),
        }
    }

    /// Create a scheduling error
    #[must_use]
    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling {
            message: msg.into(),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
