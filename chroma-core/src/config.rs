//! Daemon configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.chroma/
//!   daemon.yaml     (optional; every key has a default)
//!   run/            (default socket directory)
//! ```
//!
//! # API pattern
//!
//! - `load_at(home: &Path)`: explicit home; used in tests with `TempDir`
//! - `load()`: derives home from `dirs::home_dir()` and applies the
//!   `CHROMA_SOCKET_DIR` override
//!
//! Tests must NEVER call the no-arg wrapper; always use `_at`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const CONFIG_FILE: &str = "daemon.yaml";
pub const SOCKET_DIR_ENV: &str = "CHROMA_SOCKET_DIR";

pub const DEFAULT_COMMAND_SOCKET: &str = "command.sock";
pub const DEFAULT_QUERY_SOCKET: &str = "query.sock";
pub const DEFAULT_EVENT_SOCKET_SUFFIX: &str = "_events.sock";
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// How the daemon's sockets are addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Unix-domain sockets inside `socket_dir`.
    #[default]
    Unix,
    /// TCP on `host`. Command and query listen on explicit ports; event
    /// sockets are bound to the first free port in the range.
    Tcp {
        host: String,
        command_port: u16,
        query_port: u16,
        port_range_start: u16,
        port_range_end: u16,
    },
}

/// Fully-resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub socket_dir: PathBuf,
    pub command_socket: String,
    pub query_socket: String,
    pub event_socket_suffix: String,
    pub max_message_bytes: usize,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub transport: TransportConfig,
}

/// On-disk shape: every key optional, merged onto defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    socket_dir: Option<PathBuf>,
    command_socket: Option<String>,
    query_socket: Option<String>,
    event_socket_suffix: Option<String>,
    max_message_bytes: Option<usize>,
    connect_timeout_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
    subscriber_queue_capacity: Option<usize>,
    transport: Option<TransportConfig>,
}

impl DaemonConfig {
    /// Defaults with sockets placed in `socket_dir`.
    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            command_socket: DEFAULT_COMMAND_SOCKET.to_string(),
            query_socket: DEFAULT_QUERY_SOCKET.to_string(),
            event_socket_suffix: DEFAULT_EVENT_SOCKET_SUFFIX.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            transport: TransportConfig::Unix,
        }
    }

    /// Load `<home>/.chroma/daemon.yaml`, falling back to defaults when absent.
    ///
    /// Returns `CoreError::Parse` (with path + line context) if malformed YAML.
    pub fn load_at(home: &Path) -> Result<Self, CoreError> {
        let mut config = Self::with_socket_dir(default_socket_dir(home));
        let path = config_path(home);
        if !path.exists() {
            return Ok(config);
        }

        let raw = std::fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(config);
        }
        let file: ConfigFile =
            serde_yaml::from_str(&raw).map_err(|source| CoreError::Parse { path, source })?;
        config.merge(file);
        Ok(config)
    }

    /// `load_at` convenience wrapper, honouring `CHROMA_SOCKET_DIR`.
    pub fn load() -> Result<Self, CoreError> {
        let home = dirs::home_dir().ok_or(CoreError::HomeNotFound)?;
        let mut config = Self::load_at(&home)?;
        config.apply_socket_dir_override(std::env::var_os(SOCKET_DIR_ENV));
        Ok(config)
    }

    /// Replace `socket_dir` when an override is present and non-empty.
    pub fn apply_socket_dir_override(&mut self, value: Option<OsString>) {
        if let Some(dir) = value.filter(|v| !v.is_empty()) {
            self.socket_dir = PathBuf::from(dir);
        }
    }

    pub fn command_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.command_socket)
    }

    pub fn query_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.query_socket)
    }

    /// `<socket_dir>/<event_type><suffix>`, e.g. `wallpaper_events.sock`.
    pub fn event_socket_path(&self, event_type: &str) -> PathBuf {
        self.socket_dir
            .join(format!("{event_type}{}", self.event_socket_suffix))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    fn merge(&mut self, file: ConfigFile) {
        if let Some(v) = file.socket_dir {
            self.socket_dir = v;
        }
        if let Some(v) = file.command_socket {
            self.command_socket = v;
        }
        if let Some(v) = file.query_socket {
            self.query_socket = v;
        }
        if let Some(v) = file.event_socket_suffix {
            self.event_socket_suffix = v;
        }
        if let Some(v) = file.max_message_bytes {
            self.max_message_bytes = v;
        }
        if let Some(v) = file.connect_timeout_ms {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = file.io_timeout_ms {
            self.io_timeout_ms = v;
        }
        if let Some(v) = file.subscriber_queue_capacity {
            self.subscriber_queue_capacity = v.max(1);
        }
        if let Some(v) = file.transport {
            self.transport = v;
        }
    }
}

/// `<home>/.chroma/`
pub fn chroma_root(home: &Path) -> PathBuf {
    home.join(".chroma")
}

/// `<home>/.chroma/daemon.yaml`, pure, no I/O.
pub fn config_path(home: &Path) -> PathBuf {
    chroma_root(home).join(CONFIG_FILE)
}

/// `<home>/.chroma/run`
pub fn default_socket_dir(home: &Path) -> PathBuf {
    chroma_root(home).join("run")
}
