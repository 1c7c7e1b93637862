//! Command and query accept loops.
//!
//! The command socket takes a stream of envelopes per connection and hands
//! each one to the broker. The query socket answers exactly one request per
//! connection and closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;

use chroma_core::EventType;

use crate::broker::{shutdown_requested, EventBroker};
use crate::codec::{write_frame, MessageCodec};
use crate::error::DaemonError;
use crate::protocol::{
    DaemonStatus, QueryRequest, QueryResponse, CMD_ENSURE, CMD_STATUS, CMD_STOP,
};
use crate::transport::{Address, Connection, Listener};

// ---------------------------------------------------------------------------
// Command server
// ---------------------------------------------------------------------------

/// Accepts publisher connections and forwards decoded envelopes to the broker.
pub struct CommandServer {
    listener: Listener,
    broker: Arc<EventBroker>,
}

impl CommandServer {
    pub fn new(listener: Listener, broker: Arc<EventBroker>) -> Self {
        Self { listener, broker }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let address = self.listener.local_address();
        tracing::info!(address = %address, "command server listening");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(connection) => {
                        let broker = self.broker.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_publisher(connection, broker, shutdown));
                    }
                    Err(err) => {
                        tracing::warn!(address = %address, error = %err, "command accept error");
                    }
                }
            }
        }
        tracing::debug!(address = %address, "command server exited");
    }
}

async fn handle_publisher(
    mut connection: Connection,
    broker: Arc<EventBroker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let codec = broker.codec();
    let peer = connection.peer().to_string();
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            next = codec.next_envelope(&mut connection) => next,
        };

        match next {
            Ok(Some(envelope)) => {
                received += 1;
                let event_type = envelope.event_type.clone();
                if let Err(err) = broker.broadcast(&event_type, &envelope).await {
                    tracing::warn!(
                        event_type = %event_type,
                        operation_id = %envelope.operation_id,
                        error = %err,
                        "broadcast failed",
                    );
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(
                    peer = %peer,
                    error = %err,
                    "closing publisher connection after decode error",
                );
                break;
            }
        }
    }
    tracing::debug!(peer = %peer, envelopes = received, "publisher disconnected");
}

// ---------------------------------------------------------------------------
// Query server
// ---------------------------------------------------------------------------

/// Fixed facts about the running daemon that every status snapshot includes.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub started_at: DateTime<Utc>,
    pub command: Address,
    pub query: Address,
}

/// Answers one introspection request per connection.
pub struct QueryServer {
    listener: Listener,
    broker: Arc<EventBroker>,
    context: StatusContext,
    io_timeout: Duration,
    stop_requested: watch::Sender<bool>,
}

impl QueryServer {
    pub fn new(
        listener: Listener,
        broker: Arc<EventBroker>,
        context: StatusContext,
        io_timeout: Duration,
        stop_requested: watch::Sender<bool>,
    ) -> Self {
        Self {
            listener,
            broker,
            context,
            io_timeout,
            stop_requested,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let address = self.listener.local_address();
        tracing::info!(address = %address, "query server listening");
        let this = Arc::new(self);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = this.listener.accept() => match accepted {
                    Ok(connection) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(err) = this.handle(connection).await {
                                tracing::warn!(error = %err, "query client error");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(address = %address, error = %err, "query accept error");
                    }
                }
            }
        }
        tracing::debug!(address = %address, "query server exited");
    }

    async fn handle(&self, mut connection: Connection) -> Result<(), DaemonError> {
        let codec = self.broker.codec();
        let request = tokio::time::timeout(
            self.io_timeout,
            codec.decode_json::<QueryRequest, _>(&mut connection),
        )
        .await
        .map_err(|_| DaemonError::Protocol("query request timed out".to_string()))?;

        let response = match request {
            Ok(request) => self.respond(request).await,
            Err(err) => QueryResponse::error(format!("invalid request: {err}")),
        };

        let frame = encode_response(&codec, &response)?;
        tokio::time::timeout(self.io_timeout, write_frame(&mut connection, &frame))
            .await
            .map_err(|_| DaemonError::Protocol("query response timed out".to_string()))?
            .map_err(|e| crate::error::io_err(connection.peer().to_string(), e))?;
        Ok(())
    }

    async fn respond(&self, request: QueryRequest) -> QueryResponse {
        match request.cmd.as_str() {
            CMD_STATUS => match serde_json::to_value(self.status().await) {
                Ok(data) => QueryResponse::ok(data),
                Err(err) => QueryResponse::error(err.to_string()),
            },
            CMD_ENSURE => {
                let Some(name) = request.event_type else {
                    return QueryResponse::error("ensure requires event_type");
                };
                let event_type = match EventType::new(name) {
                    Ok(event_type) => event_type,
                    Err(err) => return QueryResponse::error(err.to_string()),
                };
                match self.broker.ensure(&event_type).await {
                    Ok(address) => match serde_json::to_value(address) {
                        Ok(data) => QueryResponse::ok(data),
                        Err(err) => QueryResponse::error(err.to_string()),
                    },
                    Err(err) => QueryResponse::error(err.to_string()),
                }
            }
            CMD_STOP => {
                tracing::info!("stop requested via query socket");
                self.stop_requested.send_replace(true);
                QueryResponse::ok(json!({ "stopping": true }))
            }
            other => QueryResponse::error(format!("unknown command '{other}'")),
        }
    }

    async fn status(&self) -> DaemonStatus {
        let now = Utc::now();
        DaemonStatus {
            running: true,
            pid: std::process::id(),
            started_at: self.context.started_at,
            uptime_secs: (now - self.context.started_at).num_seconds().max(0) as u64,
            command: self.context.command.clone(),
            query: self.context.query.clone(),
            event_types: self.broker.snapshot().await,
        }
    }
}

/// Encode a response, degrading to an error response if the snapshot is too big.
fn encode_response(codec: &MessageCodec, response: &QueryResponse) -> Result<Vec<u8>, DaemonError> {
    match codec.encode_json(response) {
        Err(err @ DaemonError::PayloadTooLarge { .. }) => {
            codec.encode_json(&QueryResponse::error(err.to_string()))
        }
        other => other,
    }
}
