//! `chroma publish`: fire-and-forget envelope publishing.

use anyhow::{bail, Context, Result};
use clap::Args;

use chroma_core::{MessageKind, OperationId, Payload};
use chroma_daemon::DaemonPublisher;

use super::{block_on, load_config};

/// Arguments for `chroma publish`.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Event type to route on, e.g. `wallpaper`.
    pub event_type: String,

    /// started | progress | completed | failed | control
    #[arg(value_parser = parse_kind)]
    pub kind: MessageKind,

    /// Operation id shared by every message of one operation; generated when omitted.
    #[arg(long)]
    pub operation_id: Option<String>,

    /// Payload as a JSON object.
    #[arg(long)]
    pub payload: Option<String>,
}

impl PublishArgs {
    pub fn run(self) -> Result<()> {
        let config = load_config()?;
        let payload = parse_payload(self.payload.as_deref())?;
        let operation_id = self
            .operation_id
            .map(OperationId::from)
            .unwrap_or_else(OperationId::generate);

        block_on(async {
            let mut publisher = DaemonPublisher::new(&config);
            let result = publisher
                .publish_event(&self.event_type, self.kind, &operation_id, payload)
                .await;
            publisher.close().await;
            result
        })?
        .context("invalid envelope")?;

        println!("{operation_id}");
        Ok(())
    }
}

fn parse_kind(s: &str) -> Result<MessageKind, String> {
    MessageKind::parse(s).ok_or_else(|| {
        format!(
            "unknown message kind '{s}'; \
             expected: started, progress, completed, failed, control"
        )
    })
}

fn parse_payload(raw: Option<&str>) -> Result<Payload> {
    let Some(raw) = raw else {
        return Ok(Payload::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--payload is not valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--payload must be a JSON object, got {other}"),
    }
}
