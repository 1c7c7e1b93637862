//! Domain types for the Chroma event stream.
//!
//! An [`Envelope`] is the unit exchanged between publishers, the daemon, and
//! subscribers. Its `event_type` selects the per-type socket it is routed to;
//! its `operation_id` ties together every envelope of one logical operation.

use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Free-form envelope payload. Key order is irrelevant.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A validated event type name: non-empty, `[a-z0-9_]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Validate and wrap an event type name.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if is_valid_event_type(&name) {
            Ok(Self(name))
        } else {
            Err(CoreError::InvalidEventType(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `true` when `name` is non-empty and only contains `[a-z0-9_]`.
pub fn is_valid_event_type(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for EventType {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for EventType {
    type Error = CoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.0
    }
}

/// Identifier shared by every envelope of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl OperationId {
    /// Generate an id unique within this host: `op-<unix-millis>-<pid>-<n>`.
    pub fn generate() -> Self {
        let n = OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "op-{}-{}-{}",
            Utc::now().timestamp_millis(),
            process::id(),
            n
        ))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle stage an envelope reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    OperationStarted,
    OperationProgress,
    OperationCompleted,
    OperationFailed,
    Control,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::OperationStarted,
        MessageKind::OperationProgress,
        MessageKind::OperationCompleted,
        MessageKind::OperationFailed,
        MessageKind::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::OperationStarted => "operation_started",
            MessageKind::OperationProgress => "operation_progress",
            MessageKind::OperationCompleted => "operation_completed",
            MessageKind::OperationFailed => "operation_failed",
            MessageKind::Control => "control",
        }
    }

    /// Parse either the wire name (`operation_started`) or its short form (`started`).
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| {
            let wire = kind.as_str();
            wire == lower || wire.strip_prefix("operation_") == Some(lower.as_str())
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The framed message unit routed by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: EventType,
    pub message_kind: MessageKind,
    pub operation_id: OperationId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(
        event_type: EventType,
        message_kind: MessageKind,
        operation_id: OperationId,
        payload: Payload,
    ) -> Self {
        Self {
            event_type,
            message_kind,
            operation_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// `true` for the two kinds that end an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.message_kind,
            MessageKind::OperationCompleted | MessageKind::OperationFailed
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
