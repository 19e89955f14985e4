//! Crate-wide error types for everything outside the dispatch path.
//!
//! Dispatch failures are classified [`NotifyError`]s; this type wraps them
//! together with configuration, IO and serialization failures.

use thiserror::Error;

use crate::taxonomy::NotifyError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Dispatch error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
