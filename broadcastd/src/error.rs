//! Application-wide error types.

use thiserror::Error;

use crate::client::ServiceError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is already started")]
    AlreadyStarted(String),

    #[error("{0} is already stopped")]
    AlreadyStopped(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Remote service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Whether the error means the remote session is no longer valid.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Service(e) if e.requires_login())
    }
}
