//! Fire-and-forget publisher client.
//!
//! A [`DaemonPublisher`] never reports daemon absence: connect and send
//! failures fold back into [`PublisherSession::Disconnected`] and `publish`
//! returns `Ok(())`. Only caller mistakes (invalid event type, oversized
//! payload) surface as errors.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use chroma_core::{DaemonConfig, Envelope, EventType, MessageKind, OperationId, Payload};

use crate::codec::{write_frame, MessageCodec};
use crate::error::DaemonError;
use crate::paths::command_address;
use crate::transport::{self, Address, Connection};

/// Connection state of a publisher.
#[derive(Debug, Default)]
pub enum PublisherSession {
    #[default]
    Disconnected,
    Connected(Connection),
}

impl PublisherSession {
    pub fn is_connected(&self) -> bool {
        matches!(self, PublisherSession::Connected(_))
    }
}

/// Publishes envelopes to the daemon's command socket.
#[derive(Debug)]
pub struct DaemonPublisher {
    address: Address,
    codec: MessageCodec,
    connect_timeout: Duration,
    io_timeout: Duration,
    session: PublisherSession,
}

impl DaemonPublisher {
    /// Build a disconnected publisher for the configured command socket.
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            address: command_address(config),
            codec: MessageCodec::new(config.max_message_bytes),
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            session: PublisherSession::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Try to reach the daemon; failure leaves the session disconnected.
    pub async fn connect(&mut self, timeout: Duration) {
        match transport::connect(&self.address, timeout).await {
            Ok(connection) => {
                tracing::debug!(address = %self.address, "publisher connected");
                self.session = PublisherSession::Connected(connection);
            }
            Err(err) => {
                tracing::debug!(address = %self.address, error = %err, "daemon unavailable");
                self.session = PublisherSession::Disconnected;
            }
        }
    }

    /// Send one envelope if the daemon is reachable. Absence of the daemon is
    /// not an error.
    pub async fn publish(&mut self, envelope: &Envelope) -> Result<(), DaemonError> {
        let frame = self.codec.encode(envelope)?;

        if !self.is_connected() {
            self.connect(self.connect_timeout).await;
        }
        let PublisherSession::Connected(connection) = &mut self.session else {
            return Ok(());
        };

        let sent = tokio::time::timeout(self.io_timeout, write_frame(connection, &frame)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(
                    address = %self.address,
                    error = %err,
                    "publish failed, dropping connection",
                );
                self.session = PublisherSession::Disconnected;
            }
            Err(_) => {
                tracing::debug!(address = %self.address, "publish timed out, dropping connection");
                self.session = PublisherSession::Disconnected;
            }
        }
        Ok(())
    }

    /// Build and publish an envelope from its parts.
    pub async fn publish_event(
        &mut self,
        event_type: &str,
        message_kind: MessageKind,
        operation_id: &OperationId,
        payload: Payload,
    ) -> Result<(), DaemonError> {
        let event_type = EventType::new(event_type)?;
        let envelope = Envelope::new(event_type, message_kind, operation_id.clone(), payload);
        self.publish(&envelope).await
    }

    /// Release the connection, if any.
    pub async fn close(&mut self) {
        if let PublisherSession::Connected(mut connection) = std::mem::take(&mut self.session) {
            let _ = connection.shutdown().await;
        }
    }
}
