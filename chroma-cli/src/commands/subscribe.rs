//! `chroma subscribe`: print one event type's stream as JSON lines.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use chroma_core::EventType;
use chroma_daemon::subscribe;

use super::{block_on, load_config};

/// Arguments for `chroma subscribe`.
#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Event type to follow, e.g. `wallpaper`.
    pub event_type: String,

    /// Exit after this many envelopes.
    #[arg(long)]
    pub count: Option<usize>,
}

impl SubscribeArgs {
    pub fn run(self) -> Result<()> {
        let config = load_config()?;
        let event_type = EventType::new(self.event_type).context("invalid event type")?;
        let count = self.count;

        block_on(async move {
            let mut subscription = subscribe(&config, &event_type)
                .await
                .with_context(|| format!("failed to subscribe to '{event_type}'"))?;

            let stdout = std::io::stdout();
            let mut seen = 0usize;
            while count.map_or(true, |limit| seen < limit) {
                let Some(envelope) = subscription
                    .next()
                    .await
                    .context("failed to read from event socket")?
                else {
                    break;
                };
                let line = serde_json::to_string(&envelope).context("failed to render envelope")?;
                let mut out = stdout.lock();
                writeln!(out, "{line}").context("failed to write to stdout")?;
                out.flush().context("failed to flush stdout")?;
                seen += 1;
            }
            Ok::<(), anyhow::Error>(())
        })?
    }
}
