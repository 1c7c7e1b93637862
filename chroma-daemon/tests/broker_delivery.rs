//! Broker routing against real Unix event sockets: lazy creation, no replay,
//! FIFO per subscriber, per-type isolation, oversize rejection.

use std::sync::Arc;
use std::time::Duration;

use chroma_core::{DaemonConfig, Envelope, EventType, MessageKind, OperationId, Payload};
use chroma_daemon::broker::BrokerSettings;
use chroma_daemon::subscriber::subscribe_at;
use chroma_daemon::{Connection, DaemonError, EventBroker, MessageCodec, Subscription};
use serde_json::json;
use tempfile::TempDir;

fn event_type(name: &str) -> EventType {
    EventType::new(name).expect("event type")
}

fn envelope(et: &str, op: &str, seq: u64) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("seq".to_string(), json!(seq));
    Envelope::new(
        event_type(et),
        MessageKind::OperationProgress,
        OperationId::from(op),
        payload,
    )
}

fn seq_of(envelope: &Envelope) -> u64 {
    envelope.payload["seq"].as_u64().expect("seq")
}

fn broker_in(dir: &TempDir) -> (DaemonConfig, Arc<EventBroker>) {
    let config = DaemonConfig::with_socket_dir(dir.path());
    let broker = EventBroker::new(BrokerSettings::from_config(&config));
    (config, broker)
}

async fn wait_for_subscribers(broker: &EventBroker, et: &EventType, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.subscriber_count(et).await < n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber for {et} never registered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn attach(
    config: &DaemonConfig,
    broker: &Arc<EventBroker>,
    et: &EventType,
) -> Subscription {
    let before = broker.subscriber_count(et).await;
    let address = broker.ensure(et).await.expect("ensure");
    let sub = subscribe_at(config, et, address).await.expect("subscribe");
    wait_for_subscribers(broker, et, before + 1).await;
    sub
}

async fn next(sub: &mut Subscription) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for envelope")
        .expect("decode")
        .expect("stream closed early")
}

#[tokio::test]
async fn broadcast_without_subscribers_creates_socket_and_late_subscriber_sees_no_replay() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");

    let delivered = broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-1", 1))
        .await
        .expect("broadcast");
    assert_eq!(delivered, 0);
    assert!(config.event_socket_path("wallpaper").exists());

    let mut sub = attach(&config, &broker, &wallpaper).await;
    broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-2", 2))
        .await
        .expect("broadcast");

    let first = next(&mut sub).await;
    assert_eq!(first.operation_id.0, "op-2", "earlier op-1 must not be replayed");

    broker.stop().await;
}

#[tokio::test]
async fn subscriber_can_register_before_any_publisher() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let theme = event_type("icon_theme");

    let mut sub = attach(&config, &broker, &theme).await;
    assert!(config.event_socket_path("icon_theme").exists());

    broker
        .broadcast(&theme, &envelope("icon_theme", "op-1", 1))
        .await
        .expect("broadcast");
    assert_eq!(next(&mut sub).await.operation_id.0, "op-1");

    broker.stop().await;
}

#[tokio::test]
async fn delivery_order_matches_publish_order() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let mut sub = attach(&config, &broker, &wallpaper).await;

    for seq in 0..50 {
        broker
            .broadcast(&wallpaper, &envelope("wallpaper", "op-1", seq))
            .await
            .expect("broadcast");
    }

    for expected in 0..50 {
        assert_eq!(seq_of(&next(&mut sub).await), expected);
    }

    broker.stop().await;
}

#[tokio::test]
async fn interleaved_types_reach_only_matching_subscribers_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let backup = event_type("backup");
    let mut wall_sub = attach(&config, &broker, &wallpaper).await;
    let mut backup_sub = attach(&config, &broker, &backup).await;

    for seq in 0..10 {
        let (et, name) = if seq % 2 == 0 {
            (&wallpaper, "wallpaper")
        } else {
            (&backup, "backup")
        };
        broker
            .broadcast(et, &envelope(name, "op-x", seq))
            .await
            .expect("broadcast");
    }

    for expected in [0, 2, 4, 6, 8] {
        let env = next(&mut wall_sub).await;
        assert_eq!(env.event_type, wallpaper);
        assert_eq!(seq_of(&env), expected);
    }
    for expected in [1, 3, 5, 7, 9] {
        let env = next(&mut backup_sub).await;
        assert_eq!(env.event_type, backup);
        assert_eq!(seq_of(&env), expected);
    }

    broker.stop().await;
}

#[tokio::test]
async fn every_subscriber_of_a_type_gets_its_own_copy() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let mut a = attach(&config, &broker, &wallpaper).await;
    let mut b = attach(&config, &broker, &wallpaper).await;

    let delivered = broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-1", 1))
        .await
        .expect("broadcast");
    assert_eq!(delivered, 2);
    assert_eq!(next(&mut a).await.operation_id.0, "op-1");
    assert_eq!(next(&mut b).await.operation_id.0, "op-1");

    broker.stop().await;
}

#[tokio::test]
async fn oversized_broadcast_fails_and_reaches_no_subscriber() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = DaemonConfig::with_socket_dir(dir.path());
    config.max_message_bytes = 512;
    let broker = EventBroker::new(BrokerSettings::from_config(&config));
    let wallpaper = event_type("wallpaper");
    let mut sub = attach(&config, &broker, &wallpaper).await;

    let mut big = envelope("wallpaper", "op-big", 0);
    big.payload.insert("blob".to_string(), json!("x".repeat(1024)));
    let err = broker.broadcast(&wallpaper, &big).await.unwrap_err();
    assert!(matches!(err, DaemonError::PayloadTooLarge { .. }), "got: {err}");

    broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-small", 1))
        .await
        .expect("broadcast");
    assert_eq!(next(&mut sub).await.operation_id.0, "op-small");

    broker.stop().await;
}

#[tokio::test]
async fn oversized_broadcast_to_unseen_type_creates_no_socket() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = DaemonConfig::with_socket_dir(dir.path());
    config.max_message_bytes = 64;
    let broker = EventBroker::new(BrokerSettings::from_config(&config));

    let mut big = envelope("backup", "op-big", 0);
    big.payload.insert("blob".to_string(), json!("x".repeat(256)));
    assert!(broker.broadcast(&event_type("backup"), &big).await.is_err());
    assert!(!config.event_socket_path("backup").exists());
    assert!(broker.snapshot().await.is_empty());
}

#[tokio::test]
async fn closed_subscriber_is_removed_and_siblings_keep_receiving() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let gone = attach(&config, &broker, &wallpaper).await;
    let mut stays = attach(&config, &broker, &wallpaper).await;

    drop(gone);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.subscriber_count(&wallpaper).await > 1 {
        assert!(tokio::time::Instant::now() < deadline, "closed subscriber never removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-1", 1))
        .await
        .expect("broadcast");
    assert_eq!(next(&mut stays).await.operation_id.0, "op-1");

    broker.stop().await;
}

#[tokio::test]
async fn stop_closes_subscribers_and_removes_event_sockets() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let mut sub = attach(&config, &broker, &wallpaper).await;

    broker.stop().await;
    assert!(!config.event_socket_path("wallpaper").exists());

    let end = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("stream should end after stop")
        .expect("clean close");
    assert!(end.is_none());

    let err = broker
        .broadcast(&event_type("backup"), &envelope("backup", "op-1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Protocol(_)), "got: {err}");

    broker.stop().await;
}

#[tokio::test]
async fn snapshot_lists_types_sorted_with_counts() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let _sub = attach(&config, &broker, &wallpaper).await;
    broker
        .broadcast(&event_type("backup"), &envelope("backup", "op-1", 1))
        .await
        .expect("broadcast");

    let snapshot = broker.snapshot().await;
    let names: Vec<&str> = snapshot.iter().map(|s| s.event_type.as_str()).collect();
    assert_eq!(names, ["backup", "wallpaper"]);
    assert_eq!(snapshot[0].subscribers, 0);
    assert_eq!(snapshot[1].subscribers, 1);

    broker.stop().await;
}

#[tokio::test]
async fn registered_in_process_connection_receives_frames() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let theme = event_type("gtk_theme");

    let (daemon_side, mut monitor_side) = tokio::io::duplex(64 * 1024);
    let sub = broker
        .register_subscriber(
            &theme,
            Connection::from_stream(daemon_side, "in-process"),
        )
        .await
        .expect("register");
    assert_eq!(sub.event_type, theme);
    assert!(config.event_socket_path("gtk_theme").exists());
    assert_eq!(broker.subscriber_count(&theme).await, 1);

    broker
        .broadcast(&theme, &envelope("gtk_theme", "op-1", 1))
        .await
        .expect("broadcast");
    let env = tokio::time::timeout(
        Duration::from_secs(5),
        broker.codec().next_envelope(&mut monitor_side),
    )
    .await
    .expect("timed out")
    .expect("decode")
    .expect("frame");
    assert_eq!(env.operation_id.0, "op-1");

    broker.stop().await;
}

async fn read_until_seq(
    reader: &mut tokio::io::DuplexStream,
    codec: MessageCodec,
    last: u64,
) -> Vec<u64> {
    let mut received = Vec::new();
    while received.last() != Some(&last) {
        let env = tokio::time::timeout(Duration::from_secs(5), codec.next_envelope(reader))
            .await
            .expect("timed out waiting for envelope")
            .expect("decode")
            .expect("stream closed early");
        received.push(seq_of(&env));
    }
    received
}

#[tokio::test]
async fn paused_subscriber_stays_registered_and_resumes_with_newest_frames() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = DaemonConfig::with_socket_dir(dir.path());
    config.io_timeout_ms = 300;
    let broker = EventBroker::new(BrokerSettings::from_config(&config));
    let wallpaper = event_type("wallpaper");

    let (daemon_side, mut monitor_side) = tokio::io::duplex(1024);
    broker
        .register_subscriber(
            &wallpaper,
            Connection::from_stream(daemon_side, "paused-pager"),
        )
        .await
        .expect("register");

    for seq in 0..150 {
        broker
            .broadcast(&wallpaper, &envelope("wallpaper", "op-1", seq))
            .await
            .expect("broadcast");
    }
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        broker.subscriber_count(&wallpaper).await,
        1,
        "a subscriber that stops reading must not be evicted",
    );

    let received = read_until_seq(&mut monitor_side, broker.codec(), 149).await;
    assert!(received.windows(2).all(|w| w[0] < w[1]), "out of order: {received:?}");
    assert!(received.len() >= 100);
    assert_eq!(
        received[received.len() - 100..],
        (50..150).collect::<Vec<u64>>()[..],
        "the newest 100 frames survive the pause",
    );

    // Every frame is either written to the socket or dropped from the queue.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = broker.snapshot().await.remove(0);
        if status.delivered == received.len() as u64 {
            assert_eq!(status.dropped, 150 - received.len() as u64);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delivered never settled: {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.subscriber_count(&wallpaper).await, 1);

    broker.stop().await;
}

#[tokio::test]
async fn stalled_subscriber_does_not_hold_up_siblings_or_other_types() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let backup = event_type("backup");

    let (daemon_side, _stalled_reader) = tokio::io::duplex(256);
    broker
        .register_subscriber(
            &wallpaper,
            Connection::from_stream(daemon_side, "stalled"),
        )
        .await
        .expect("register stalled");
    let mut wall_sub = attach(&config, &broker, &wallpaper).await;
    let mut backup_sub = attach(&config, &broker, &backup).await;

    for seq in 0..50 {
        for (et, name) in [(&wallpaper, "wallpaper"), (&backup, "backup")] {
            let mut env = envelope(name, "op-big", seq);
            env.payload.insert("blob".to_string(), json!("x".repeat(1024)));
            broker.broadcast(et, &env).await.expect("broadcast");
        }
    }

    for expected in 0..50 {
        assert_eq!(seq_of(&next(&mut wall_sub).await), expected);
        assert_eq!(seq_of(&next(&mut backup_sub).await), expected);
    }
    assert_eq!(
        broker.subscriber_count(&wallpaper).await,
        2,
        "stalled subscriber stays registered",
    );

    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_references_bind_one_socket() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let mut wall_sub = attach(&config, &broker, &wallpaper).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            broker.ensure(&event_type("backup")).await.expect("ensure")
        }));
    }
    for seq in 0..20 {
        broker
            .broadcast(&wallpaper, &envelope("wallpaper", "op-1", seq))
            .await
            .expect("broadcast");
    }

    let mut addresses = Vec::new();
    for task in tasks {
        addresses.push(task.await.expect("join"));
    }
    addresses.dedup();
    assert_eq!(addresses.len(), 1, "every caller sees the same socket");
    for expected in 0..20 {
        assert_eq!(seq_of(&next(&mut wall_sub).await), expected);
    }
    assert_eq!(broker.snapshot().await.len(), 2);

    broker.stop().await;
}

#[tokio::test]
async fn failed_bind_leaves_other_types_untouched_and_can_be_retried() {
    let dir = TempDir::new().expect("tempdir");
    let (config, broker) = broker_in(&dir);
    let wallpaper = event_type("wallpaper");
    let backup = event_type("backup");
    let mut wall_sub = attach(&config, &broker, &wallpaper).await;

    let squatter =
        tokio::net::UnixListener::bind(config.event_socket_path("backup")).expect("squat");
    let err = broker.ensure(&backup).await.unwrap_err();
    assert!(matches!(err, DaemonError::Protocol(_)), "got: {err}");
    assert!(broker.address_of(&backup).await.is_none());

    broker
        .broadcast(&wallpaper, &envelope("wallpaper", "op-1", 1))
        .await
        .expect("broadcast");
    assert_eq!(next(&mut wall_sub).await.operation_id.0, "op-1");

    drop(squatter);
    let address = broker.ensure(&backup).await.expect("retry after path freed");
    assert_eq!(broker.address_of(&backup).await, Some(address));

    broker.stop().await;
}
