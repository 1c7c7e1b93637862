//! Well-known endpoints derived from [`DaemonConfig`].
//!
//! Unix layout inside `socket_dir`:
//!
//! ```text
//! command.sock               publishers
//! query.sock                 introspection
//! <event_type>_events.sock   one per event type, created on demand
//! ```

use chroma_core::{DaemonConfig, TransportConfig};

use crate::transport::{Address, BindTarget};

pub fn command_bind_target(config: &DaemonConfig) -> BindTarget {
    match &config.transport {
        TransportConfig::Unix => BindTarget::Unix(config.command_socket_path()),
        TransportConfig::Tcp {
            host, command_port, ..
        } => BindTarget::tcp_port(host.clone(), *command_port),
    }
}

pub fn query_bind_target(config: &DaemonConfig) -> BindTarget {
    match &config.transport {
        TransportConfig::Unix => BindTarget::Unix(config.query_socket_path()),
        TransportConfig::Tcp {
            host, query_port, ..
        } => BindTarget::tcp_port(host.clone(), *query_port),
    }
}

/// Where publishers connect.
pub fn command_address(config: &DaemonConfig) -> Address {
    match &config.transport {
        TransportConfig::Unix => Address::unix(config.command_socket_path()),
        TransportConfig::Tcp {
            host, command_port, ..
        } => Address::tcp(host.clone(), *command_port),
    }
}

/// Where introspection clients and subscribers connect first.
pub fn query_address(config: &DaemonConfig) -> Address {
    match &config.transport {
        TransportConfig::Unix => Address::unix(config.query_socket_path()),
        TransportConfig::Tcp {
            host, query_port, ..
        } => Address::tcp(host.clone(), *query_port),
    }
}
