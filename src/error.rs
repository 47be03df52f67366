use std::io;

use thiserror::Error;

/// Central error type for the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be read or deserialized.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bounded task queue rejected a submission.
    #[error("task queue is full")]
    QueueFull,

    /// A worker thread could not be spawned at startup.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),
}

impl From<toml::de::Error> for ServerError {
    fn from(e: toml::de::Error) -> Self {
        ServerError::Config(e.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
