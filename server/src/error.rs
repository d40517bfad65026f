use crate::config::ConfigError;
use shared::FrameError;
use std::io;
use thiserror::Error;

/// Why a session ended. None of these escape the session's own tasks.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Frame(#[from] FrameError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("peer closed the connection")]
    Closed,
}

/// Fatal startup errors; the process exits before the tick loop starts.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
