pub mod daemon;
pub mod publish;
pub mod subscribe;

use std::future::Future;

use anyhow::{Context, Result};

use chroma_core::DaemonConfig;

/// Load `~/.chroma/daemon.yaml` (or defaults) with the `CHROMA_SOCKET_DIR` override.
pub(crate) fn load_config() -> Result<DaemonConfig> {
    DaemonConfig::load().context("failed to load chroma daemon config")
}

/// Drive one client-side future on a single-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
