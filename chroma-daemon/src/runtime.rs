use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chroma_core::DaemonConfig;

use crate::broker::{join_or_abort, shutdown_requested, BrokerSettings, EventBroker};
use crate::error::{io_err, DaemonError};
use crate::paths::{command_bind_target, query_bind_target};
use crate::server::{CommandServer, QueryServer, StatusContext};
use crate::transport::{self, Address};

const LOG_FORMAT_ENV: &str = "CHROMA_LOG_FORMAT";

/// Composition root: socket directory, servers, broker, shutdown.
pub struct Daemon {
    config: DaemonConfig,
    broker: Arc<EventBroker>,
    command: Address,
    query: Address,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    stop_requested: watch::Sender<bool>,
    created_files: Vec<PathBuf>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Daemon {
    /// Start with default settings in `socket_dir`.
    pub async fn start_in(socket_dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        Self::start(DaemonConfig::with_socket_dir(socket_dir)).await
    }

    /// Bind the command and query sockets and start every accept loop.
    /// Returns once all listeners are bound. Bind failures are fatal.
    pub async fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        ensure_socket_dir(&config.socket_dir)?;

        let command_listener = transport::bind(&command_bind_target(&config)).await?;
        let query_listener = match transport::bind(&query_bind_target(&config)).await {
            Ok(listener) => listener,
            Err(err) => {
                remove_socket_file(command_listener.socket_path());
                return Err(err);
            }
        };

        let command = command_listener.local_address();
        let query = query_listener.local_address();
        let created_files: Vec<PathBuf> = [
            command_listener.socket_path(),
            query_listener.socket_path(),
        ]
        .into_iter()
        .flatten()
        .map(Path::to_path_buf)
        .collect();

        let broker = EventBroker::new(BrokerSettings::from_config(&config));
        let started_at = Utc::now();
        let (shutdown_tx, _) = watch::channel(false);
        let (stop_requested, _) = watch::channel(false);

        let command_server = CommandServer::new(command_listener, broker.clone());
        let query_server = QueryServer::new(
            query_listener,
            broker.clone(),
            StatusContext {
                started_at,
                command: command.clone(),
                query: query.clone(),
            },
            config.io_timeout(),
            stop_requested.clone(),
        );

        let tasks = vec![
            tokio::spawn(command_server.run(shutdown_tx.subscribe())),
            tokio::spawn(query_server.run(shutdown_tx.subscribe())),
        ];

        tracing::info!(
            socket_dir = %config.socket_dir.display(),
            command = %command,
            query = %query,
            "daemon started",
        );

        Ok(Self {
            config,
            broker,
            command,
            query,
            started_at,
            shutdown_tx,
            stop_requested,
            created_files,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    pub fn command_address(&self) -> &Address {
        &self.command
    }

    pub fn query_address(&self) -> &Address {
        &self.query
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Resolve when a client asks the daemon to stop via the query socket.
    pub async fn stop_requested(&self) {
        let mut rx = self.stop_requested.subscribe();
        shutdown_requested(&mut rx).await;
    }

    /// Terminate every accept loop, close all connections, and remove the
    /// socket files this daemon created. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping daemon");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            join_or_abort(task, self.config.io_timeout()).await;
        }

        self.broker.stop().await;

        for path in &self.created_files {
            remove_socket_file(Some(path));
        }
        tracing::info!("daemon stopped");
    }
}

/// Start the daemon and block the current thread until it is told to stop.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run until Ctrl-C or a `stop` query, then shut down cleanly.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let daemon = Daemon::start(config).await?;

    tokio::select! {
        _ = daemon.stop_requested() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("received ctrl-c, shutting down daemon"),
            Err(err) => {
                daemon.stop().await;
                return Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}")));
            }
        }
    }

    daemon.stop().await;
    Ok(())
}

fn ensure_socket_dir(dir: &Path) -> Result<(), DaemonError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

fn remove_socket_file(path: Option<&Path>) {
    let Some(path) = path else { return };
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(socket = %path.display(), error = %err, "failed to remove socket file")
        }
    }
}

/// `RUST_LOG` filters (default `info`); `CHROMA_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

fn set_dir_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
