//! Config loading: defaults, partial overrides, parse errors with path.

use std::path::PathBuf;

use assert_fs::prelude::*;
use chroma_core::{config, CoreError, DaemonConfig, TransportConfig};
use predicates::prelude::*;

#[test]
fn missing_file_yields_defaults_under_home() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = DaemonConfig::load_at(home.path()).expect("load");

    assert_eq!(cfg.socket_dir, home.path().join(".chroma").join("run"));
    assert_eq!(cfg.command_socket, "command.sock");
    assert_eq!(cfg.query_socket, "query.sock");
    assert_eq!(cfg.event_socket_suffix, "_events.sock");
    assert_eq!(cfg.max_message_bytes, 1024 * 1024);
    assert_eq!(cfg.subscriber_queue_capacity, 100);
    assert_eq!(cfg.transport, TransportConfig::Unix);
}

#[test]
fn partial_file_overrides_only_named_keys() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child(".chroma/daemon.yaml");
    file.write_str("socket_dir: /tmp/t1\nsubscriber_queue_capacity: 8\nconnect_timeout_ms: 50\n")
        .expect("write");

    let cfg = DaemonConfig::load_at(home.path()).expect("load");
    assert_eq!(cfg.socket_dir, PathBuf::from("/tmp/t1"));
    assert_eq!(cfg.subscriber_queue_capacity, 8);
    assert_eq!(cfg.connect_timeout().as_millis(), 50);
    assert_eq!(cfg.io_timeout_ms, config::DEFAULT_IO_TIMEOUT_MS);
}

#[test]
fn tcp_transport_parses_from_tagged_map() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".chroma/daemon.yaml")
        .write_str(
            "transport:\n  kind: tcp\n  host: 127.0.0.1\n  command_port: 47100\n  query_port: 47101\n  port_range_start: 47110\n  port_range_end: 47130\n",
        )
        .expect("write");

    let cfg = DaemonConfig::load_at(home.path()).expect("load");
    assert_eq!(
        cfg.transport,
        TransportConfig::Tcp {
            host: "127.0.0.1".to_string(),
            command_port: 47100,
            query_port: 47101,
            port_range_start: 47110,
            port_range_end: 47130,
        }
    );
}

#[test]
fn malformed_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".chroma/daemon.yaml")
        .write_str("socket_dir: [unclosed\n")
        .expect("write");

    let err = DaemonConfig::load_at(home.path()).unwrap_err();
    assert!(matches!(err, CoreError::Parse { .. }), "got: {err}");
    assert!(predicate::str::contains("daemon.yaml").eval(&err.to_string()));
}

#[test]
fn unknown_key_is_rejected() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".chroma/daemon.yaml")
        .write_str("queue_capacity: 5\n")
        .expect("write");

    let err = DaemonConfig::load_at(home.path()).unwrap_err();
    assert!(matches!(err, CoreError::Parse { .. }), "got: {err}");
}

#[test]
fn zero_queue_capacity_is_clamped_to_one() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".chroma/daemon.yaml")
        .write_str("subscriber_queue_capacity: 0\n")
        .expect("write");

    let cfg = DaemonConfig::load_at(home.path()).expect("load");
    assert_eq!(cfg.subscriber_queue_capacity, 1);
}
