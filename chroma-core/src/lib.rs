//! Chroma core library: envelope types, event-type validation, config.
//!
//! Public API surface:
//! - [`types`]: [`EventType`], [`MessageKind`], [`Envelope`], [`OperationId`]
//! - [`config`]: [`DaemonConfig`] and its YAML loader
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{DaemonConfig, TransportConfig};
pub use error::CoreError;
pub use types::{Envelope, EventType, MessageKind, OperationId, Payload};
