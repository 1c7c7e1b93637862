use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the codec, transport, broker, servers, and clients.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("connection refused by {address}")]
    ConnectionRefused { address: String },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("incomplete frame: expected {expected} bytes, received {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("no port available on {host} in range {start}-{end}")]
    NoPortAvailable { host: String, start: u16, end: u16 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Core(#[from] chroma_core::CoreError),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (no listener at {socket})")]
    DaemonNotRunning { socket: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
