//! Typed failures crossing the service and engine seams.

use thiserror::Error;

/// Errors from the remote media service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Transport-level failure (connect, TLS, body read)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Service answered with a non-success status
    #[error("Service error ({status}): {message}")]
    Status { status: u16, message: String },

    /// Body did not have the expected shape
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Stream resolution succeeded but carried no playable URL
    #[error("No playable stream for {0}")]
    NoStream(String),

    /// The service reported `success: false` or `status: "error"`
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Rejected before any request was made
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Errors from the playback engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Engine process could not be started or reached
    #[error("Playback engine unavailable: {0}")]
    Unavailable(String),

    /// The engine refused a command
    #[error("Playback engine rejected command: {0}")]
    Command(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Command(e.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
