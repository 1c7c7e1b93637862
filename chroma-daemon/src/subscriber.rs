//! Monitor-side client: one ordered envelope stream per event type.

use chroma_core::{DaemonConfig, Envelope, EventType};

use crate::codec::MessageCodec;
use crate::error::DaemonError;
use crate::protocol::request_ensure;
use crate::transport::{self, Address, Connection};

/// A live subscription to one event type.
#[derive(Debug)]
pub struct Subscription {
    event_type: EventType,
    address: Address,
    connection: Connection,
    codec: MessageCodec,
}

impl Subscription {
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Next envelope in publish order, or `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<Envelope>, DaemonError> {
        self.codec.next_envelope(&mut self.connection).await
    }
}

/// Ask the daemon for the event socket of `event_type` (creating it if this
/// is the first reference) and connect to it. Only envelopes published after
/// the daemon registers the connection are delivered.
///
/// Registration happens on the daemon's accept loop and can lag behind this
/// call returning: an envelope published immediately afterwards may be
/// missed. Callers that need a happens-before edge wait until `status`
/// (see [`crate::request_status`]) counts the subscriber.
pub async fn subscribe(
    config: &DaemonConfig,
    event_type: &EventType,
) -> Result<Subscription, DaemonError> {
    let address = request_ensure(config, event_type).await?;
    subscribe_at(config, event_type, address).await
}

/// Connect to a known event socket address without consulting the query socket.
pub async fn subscribe_at(
    config: &DaemonConfig,
    event_type: &EventType,
    address: Address,
) -> Result<Subscription, DaemonError> {
    let connection = transport::connect(&address, config.connect_timeout()).await?;
    tracing::debug!(event_type = %event_type, address = %address, "subscribed");
    Ok(Subscription {
        event_type: event_type.clone(),
        address,
        connection,
        codec: MessageCodec::new(config.max_message_bytes),
    })
}
