use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the server lifecycle core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("path resolves outside of the server data directory: {path}")]
    BadPathResolution { path: PathBuf },

    #[error("archive entry escapes the extraction root: {entry}")]
    ZipSlip { entry: String },

    #[error("server has exceeded its allocated disk space")]
    QuotaExceeded,

    #[error("not currently attached to the process instance")]
    NotAttached,

    #[error("server process is already running")]
    AlreadyRunning,

    #[error("already attached to the process instance")]
    AlreadyAttached,

    #[error("a restart is already in progress for this server")]
    RestartInProgress,

    #[error("{op} did not complete within {seconds}s")]
    Timeout { op: &'static str, seconds: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event bus has been destroyed")]
    BusDestroyed,
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            other => Error::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
