use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;

use chroma_core::{DaemonConfig, EventType};

use crate::broker::EventTypeStatus;
use crate::codec::{write_frame, MessageCodec};
use crate::error::{io_err, DaemonError};
use crate::paths::query_address;
use crate::transport::{self, Address};

pub const CMD_STATUS: &str = "status";
pub const CMD_ENSURE: &str = "ensure";
pub const CMD_STOP: &str = "stop";

/// Framed JSON request sent to the query socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl QueryRequest {
    pub fn status() -> Self {
        Self {
            cmd: CMD_STATUS.to_string(),
            event_type: None,
        }
    }

    pub fn ensure(event_type: &EventType) -> Self {
        Self {
            cmd: CMD_ENSURE.to_string(),
            event_type: Some(event_type.to_string()),
        }
    }

    pub fn stop() -> Self {
        Self {
            cmd: CMD_STOP.to_string(),
            event_type: None,
        }
    }
}

/// Framed JSON response; one per request, then the daemon closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Snapshot returned by the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub command: Address,
    pub query: Address,
    pub event_types: Vec<EventTypeStatus>,
}

/// Send one request to the query socket and return one response.
pub async fn send_query(
    config: &DaemonConfig,
    request: &QueryRequest,
) -> Result<QueryResponse, DaemonError> {
    let address = query_address(config);
    let codec = MessageCodec::new(config.max_message_bytes);

    let mut conn = transport::connect(&address, config.connect_timeout())
        .await
        .map_err(|err| match err {
            DaemonError::ConnectionRefused { address }
            | DaemonError::ConnectTimeout { address, .. } => {
                DaemonError::DaemonNotRunning { socket: address }
            }
            other => other,
        })?;

    let frame = codec.encode_json(request)?;
    let exchange = async {
        write_frame(&mut conn, &frame)
            .await
            .map_err(|e| io_err(address.to_string(), e))?;
        codec.decode_json::<QueryResponse, _>(&mut conn).await
    };

    match tokio::time::timeout(config.io_timeout(), exchange).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(DaemonError::IncompleteFrame { .. })) => Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        )),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(DaemonError::Protocol(format!(
            "daemon did not respond within {}ms",
            config.io_timeout_ms
        ))),
    }
}

/// Fetch the daemon snapshot, retrying briefly while the daemon is starting.
pub async fn request_status(config: &DaemonConfig) -> Result<DaemonStatus, DaemonError> {
    let request = QueryRequest::status();

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_query(config, &request).await {
            Ok(response) => {
                let data = response_into_data(response)?;
                return Ok(serde_json::from_value(data)?);
            }
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub async fn request_stop(config: &DaemonConfig) -> Result<(), DaemonError> {
    let response = send_query(config, &QueryRequest::stop()).await?;
    response_into_data(response).map(|_| ())
}

/// Make sure the daemon has an event socket for `event_type`; returns its address.
pub async fn request_ensure(
    config: &DaemonConfig,
    event_type: &EventType,
) -> Result<Address, DaemonError> {
    let response = send_query(config, &QueryRequest::ensure(event_type)).await?;
    let data = response_into_data(response)?;
    Ok(serde_json::from_value(data)?)
}

fn response_into_data(response: QueryResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
