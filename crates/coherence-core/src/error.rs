//! Error types shared by every coherence crate.

use std::error::Error as StdError;

use thiserror::Error;

/// An opaque failure reported by a backing store session or connector.
///
/// Open, query and commit failures are carried unchanged to the caller;
/// the message is whatever the native driver reported.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BackendError {
    /// Create a backend error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a native driver error, keeping it as the error source.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The message reported by the backend.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised while parsing connection parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("connection uri is missing a scheme: {0}")]
    MissingScheme(String),

    #[error("unsupported backend scheme: {0}")]
    UnknownScheme(String),

    #[error("invalid port in connection uri: {0}")]
    InvalidPort(String),

    #[error("connection uri has no database: {0}")]
    MissingDatabase(String),
}
