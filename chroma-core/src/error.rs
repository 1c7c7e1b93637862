//! Error types for chroma-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from envelope validation and config loading.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Event type was empty or contained characters outside `[a-z0-9_]`.
    #[error("invalid event type '{0}': expected one or more of [a-z0-9_]")]
    InvalidEventType(String),

    /// Underlying I/O failure while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.chroma/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}
