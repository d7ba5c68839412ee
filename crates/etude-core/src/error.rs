// src/error.rs
use std::io;

/// Central error type for setup-level failures of the engine.
///
/// Per-request failures never surface here; they travel as outcomes
/// (`ParseOutcome`, `ProcessOutcome`, `WriteProgress`) and end up as a status
/// code or a closed connection.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// A worker or helper thread could not be started.
    #[error("failed to spawn thread {name}: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type EtudeResult<T> = Result<T, EtudeError>;
