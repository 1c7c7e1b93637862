//! Lifecycle helper that stamps one operation id on every envelope it sends.

use serde_json::json;

use chroma_core::{Envelope, EventType, MessageKind, OperationId, Payload};

use crate::error::DaemonError;
use crate::publisher::DaemonPublisher;

/// One logical operation published through a [`DaemonPublisher`].
pub struct Operation<'a> {
    publisher: &'a mut DaemonPublisher,
    event_type: EventType,
    id: OperationId,
}

impl<'a> Operation<'a> {
    /// Start tracking a new operation with a freshly generated id.
    pub fn new(publisher: &'a mut DaemonPublisher, event_type: EventType) -> Self {
        Self::with_id(publisher, event_type, OperationId::generate())
    }

    pub fn with_id(
        publisher: &'a mut DaemonPublisher,
        event_type: EventType,
        id: OperationId,
    ) -> Self {
        Self {
            publisher,
            event_type,
            id,
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub async fn started(&mut self, payload: Payload) -> Result<(), DaemonError> {
        self.emit(MessageKind::OperationStarted, payload).await
    }

    pub async fn progress(&mut self, payload: Payload) -> Result<(), DaemonError> {
        self.emit(MessageKind::OperationProgress, payload).await
    }

    pub async fn completed(mut self, payload: Payload) -> Result<(), DaemonError> {
        self.emit(MessageKind::OperationCompleted, payload).await
    }

    /// Finish with a failure; `error` lands in the payload under `"error"`.
    pub async fn failed(mut self, error: impl Into<String>) -> Result<(), DaemonError> {
        let mut payload = Payload::new();
        payload.insert("error".to_string(), json!(error.into()));
        self.emit(MessageKind::OperationFailed, payload).await
    }

    async fn emit(&mut self, kind: MessageKind, payload: Payload) -> Result<(), DaemonError> {
        let envelope = Envelope::new(self.event_type.clone(), kind, self.id.clone(), payload);
        self.publisher.publish(&envelope).await
    }
}
