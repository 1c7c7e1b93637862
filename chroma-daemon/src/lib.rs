//! Chroma event-routing daemon: framing, transport, broker, servers, clients.
//!
//! Data flow: publisher → command socket → [`EventBroker::broadcast`] →
//! `<event_type>_events.sock` → subscribers.

pub mod broker;
pub mod codec;
mod error;
pub mod operation;
pub mod paths;
pub mod protocol;
pub mod publisher;
mod runtime;
pub mod server;
pub mod subscriber;
pub mod transport;

pub use broker::{EventBroker, EventTypeStatus, SubscriberQueue};
pub use codec::MessageCodec;
pub use error::DaemonError;
pub use operation::Operation;
pub use protocol::{
    request_ensure, request_status, request_stop, send_query, DaemonStatus, QueryRequest,
    QueryResponse,
};
pub use publisher::{DaemonPublisher, PublisherSession};
pub use runtime::{run, start_blocking, Daemon};
pub use subscriber::{subscribe, Subscription};
pub use transport::{Address, BindTarget, Connection};
