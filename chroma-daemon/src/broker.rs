//! Event-type → socket routing with per-subscriber bounded queues.
//!
//! Each event type gets one listener (created on first reference) and a set
//! of subscriber connections. A broadcast encodes once, snapshots the
//! subscriber set under the entry lock, then enqueues outside any lock.
//! Every subscriber drains its own queue on its own task, so a slow or dead
//! subscriber never stalls the broadcaster or its siblings. Subscribers are
//! removed only when their connection closes or errors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, OnceCell, RwLock};
use tokio::task::JoinHandle;

use chroma_core::{DaemonConfig, Envelope, EventType, TransportConfig};

use crate::codec::{write_frame, MessageCodec};
use crate::error::DaemonError;
use crate::transport::{self, Address, BindTarget, Connection, Listener};

/// Shared, immutable frame bytes handed to every subscriber queue.
pub type Frame = Arc<[u8]>;

// ---------------------------------------------------------------------------
// Subscriber queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    dropped: u64,
    closed: bool,
}

/// Bounded FIFO that drops the oldest frame on overflow instead of blocking.
#[derive(Debug)]
pub struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a frame. Returns `true` when the oldest frame was dropped to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let overflowed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return false;
            }
            let overflowed = if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.frames.push_back(frame);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    /// Wait for the next frame; `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take a frame without waiting.
    pub fn try_pop(&self) -> Option<Frame> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
            .pop_front()
    }

    /// Discard pending frames and wake the drain task.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.frames.clear();
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One connected monitor.
#[derive(Debug)]
pub struct SubscriberConnection {
    pub id: u64,
    pub event_type: EventType,
    pub queue: SubscriberQueue,
    pub connected_at: DateTime<Utc>,
}

/// The listener and subscriber set for one event type.
#[derive(Debug)]
pub struct EventSocketEntry {
    pub event_type: EventType,
    pub address: Address,
    pub created_at: DateTime<Utc>,
    subscribers: AsyncMutex<HashMap<u64, Arc<SubscriberConnection>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl EventSocketEntry {
    fn new(event_type: EventType, address: Address) -> Self {
        Self {
            event_type,
            address,
            created_at: Utc::now(),
            subscribers: AsyncMutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    async fn remove(&self, id: u64) {
        if let Some(sub) = self.subscribers.lock().await.remove(&id) {
            sub.queue.close();
            tracing::info!(
                event_type = %self.event_type,
                subscriber = id,
                "subscriber removed",
            );
        }
    }
}

/// Point-in-time view of one event type, reported by the query socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeStatus {
    pub event_type: String,
    pub address: Address,
    pub subscribers: usize,
    /// Frames fully written to subscriber sockets.
    pub delivered: u64,
    /// Frames discarded from full subscriber queues.
    pub dropped: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Broker settings derived from [`DaemonConfig`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub config: DaemonConfig,
    pub codec: MessageCodec,
}

impl BrokerSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            config: config.clone(),
            codec: MessageCodec::new(config.max_message_bytes),
        }
    }

    fn event_bind_target(&self, event_type: &EventType) -> BindTarget {
        match &self.config.transport {
            TransportConfig::Unix => {
                BindTarget::Unix(self.config.event_socket_path(event_type.as_str()))
            }
            TransportConfig::Tcp {
                host,
                port_range_start,
                port_range_end,
                ..
            } => BindTarget::Tcp {
                host: host.clone(),
                start: *port_range_start,
                end: *port_range_end,
            },
        }
    }

    fn io_timeout(&self) -> Duration {
        self.config.io_timeout()
    }
}

/// Lazily initialised entry for one event type. The map lock only guards
/// inserting the slot; binding happens inside the slot's own initialiser.
type EntrySlot = Arc<OnceCell<Arc<EventSocketEntry>>>;

/// An entry whose accept loop is running, kept so `stop` can tear it down.
struct SpawnedEntry {
    entry: Arc<EventSocketEntry>,
    accept_loop: JoinHandle<()>,
}

/// Owns every [`EventSocketEntry`] for the daemon's lifetime.
pub struct EventBroker {
    settings: BrokerSettings,
    entries: RwLock<HashMap<EventType, EntrySlot>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    next_subscriber_id: AtomicU64,
    spawned: Mutex<Vec<SpawnedEntry>>,
}

impl EventBroker {
    pub fn new(settings: BrokerSettings) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            entries: RwLock::new(HashMap::new()),
            shutdown,
            stopped: AtomicBool::new(false),
            next_subscriber_id: AtomicU64::new(1),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn codec(&self) -> MessageCodec {
        self.settings.codec
    }

    /// Queue `envelope` for every current subscriber of `event_type`.
    ///
    /// Returns the number of subscribers the frame was queued for. Fails with
    /// `PayloadTooLarge` before touching any entry when the body is too big.
    pub async fn broadcast(
        self: &Arc<Self>,
        event_type: &EventType,
        envelope: &Envelope,
    ) -> Result<usize, DaemonError> {
        let frame: Frame = self.settings.codec.encode(envelope)?.into();
        let entry = self.entry_for(event_type).await?;

        let targets: Vec<Arc<SubscriberConnection>> =
            entry.subscribers.lock().await.values().cloned().collect();

        for sub in &targets {
            if sub.queue.push(frame.clone()) {
                entry.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_type = %event_type,
                    subscriber = sub.id,
                    capacity = sub.queue.capacity(),
                    "subscriber queue full, dropped oldest message",
                );
            }
        }

        tracing::debug!(
            event_type = %event_type,
            operation_id = %envelope.operation_id,
            kind = %envelope.message_kind,
            subscribers = targets.len(),
            "broadcast",
        );
        Ok(targets.len())
    }

    /// Attach a monitor connection to `event_type`, creating the entry if needed.
    pub async fn register_subscriber(
        self: &Arc<Self>,
        event_type: &EventType,
        connection: Connection,
    ) -> Result<Arc<SubscriberConnection>, DaemonError> {
        let entry = self.entry_for(event_type).await?;
        Ok(self.attach(entry, connection).await)
    }

    /// Create the entry for `event_type` if it does not exist; returns its address.
    pub async fn ensure(self: &Arc<Self>, event_type: &EventType) -> Result<Address, DaemonError> {
        Ok(self.entry_for(event_type).await?.address.clone())
    }

    pub async fn subscriber_count(&self, event_type: &EventType) -> usize {
        match self.existing(event_type).await {
            Some(entry) => entry.subscriber_count().await,
            None => 0,
        }
    }

    pub async fn address_of(&self, event_type: &EventType) -> Option<Address> {
        self.existing(event_type).await.map(|e| e.address.clone())
    }

    /// Event types sorted by name with subscriber and delivery counts.
    pub async fn snapshot(&self) -> Vec<EventTypeStatus> {
        let entries: Vec<Arc<EventSocketEntry>> = self
            .entries
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(EventTypeStatus {
                event_type: entry.event_type.to_string(),
                address: entry.address.clone(),
                subscribers: entry.subscriber_count().await,
                delivered: entry.delivered.load(Ordering::Relaxed),
                dropped: entry.dropped.load(Ordering::Relaxed),
                created_at: entry.created_at,
            });
        }
        out.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        out
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close every event listener and subscriber, remove event socket files.
    /// Idempotent.
    pub async fn stop(&self) {
        {
            let mut entries = self.entries.write().await;
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shutdown.send_replace(true);
            entries.clear();
        }

        // Initialisers still binding see `stopped` under this lock and clean up
        // after themselves, so everything spawned so far is in this list.
        let spawned: Vec<SpawnedEntry> = {
            let mut guard = self.spawned.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for SpawnedEntry { entry, accept_loop } in spawned {
            join_or_abort(accept_loop, self.settings.io_timeout()).await;
            let subs: Vec<Arc<SubscriberConnection>> = entry
                .subscribers
                .lock()
                .await
                .drain()
                .map(|(_, sub)| sub)
                .collect();
            for sub in subs {
                sub.queue.close();
            }
            remove_event_socket(&entry.address).await;
        }
        tracing::info!("event broker stopped");
    }

    async fn existing(&self, event_type: &EventType) -> Option<Arc<EventSocketEntry>> {
        self.entries
            .read()
            .await
            .get(event_type)
            .and_then(|slot| slot.get().cloned())
    }

    async fn entry_for(
        self: &Arc<Self>,
        event_type: &EventType,
    ) -> Result<Arc<EventSocketEntry>, DaemonError> {
        let known = self.entries.read().await.get(event_type).cloned();
        let slot = match known {
            Some(slot) => slot,
            None => {
                let mut entries = self.entries.write().await;
                if self.is_stopped() {
                    return Err(broker_stopped());
                }
                entries.entry(event_type.clone()).or_default().clone()
            }
        };

        let entry = slot.get_or_try_init(|| self.open_entry(event_type)).await?;
        Ok(entry.clone())
    }

    /// Bind the event socket for `event_type` and start its accept loop.
    async fn open_entry(
        self: &Arc<Self>,
        event_type: &EventType,
    ) -> Result<Arc<EventSocketEntry>, DaemonError> {
        let listener = transport::bind(&self.settings.event_bind_target(event_type)).await?;
        let entry = Arc::new(EventSocketEntry::new(
            event_type.clone(),
            listener.local_address(),
        ));

        {
            let mut spawned = self.spawned.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_stopped() {
                let accept_loop = tokio::spawn(event_accept_loop(
                    self.clone(),
                    entry.clone(),
                    listener,
                    self.shutdown.subscribe(),
                ));
                spawned.push(SpawnedEntry {
                    entry: entry.clone(),
                    accept_loop,
                });
                tracing::info!(
                    event_type = %event_type,
                    address = %entry.address,
                    "event socket created",
                );
                return Ok(entry);
            }
        }

        drop(listener);
        remove_event_socket(&entry.address).await;
        Err(broker_stopped())
    }

    async fn attach(
        self: &Arc<Self>,
        entry: Arc<EventSocketEntry>,
        connection: Connection,
    ) -> Arc<SubscriberConnection> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(SubscriberConnection {
            id,
            event_type: entry.event_type.clone(),
            queue: SubscriberQueue::new(self.settings.config.subscriber_queue_capacity),
            connected_at: Utc::now(),
        });

        entry.subscribers.lock().await.insert(id, sub.clone());
        tracing::info!(
            event_type = %entry.event_type,
            subscriber = id,
            peer = connection.peer(),
            "subscriber registered",
        );

        tokio::spawn(drain_subscriber(
            entry,
            sub.clone(),
            connection,
            self.shutdown.subscribe(),
        ));
        sub
    }
}

fn broker_stopped() -> DaemonError {
    DaemonError::Protocol("event broker is stopped".to_string())
}

async fn remove_event_socket(address: &Address) {
    let Address::Unix { path } = address else {
        return;
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(
            socket = %path.display(),
            error = %err,
            "failed to remove event socket",
        ),
    }
}

async fn event_accept_loop(
    broker: Arc<EventBroker>,
    entry: Arc<EventSocketEntry>,
    listener: Listener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    broker.attach(entry.clone(), connection).await;
                }
                Err(err) => {
                    tracing::warn!(
                        event_type = %entry.event_type,
                        error = %err,
                        "event socket accept error",
                    );
                }
            }
        }
    }
    tracing::debug!(event_type = %entry.event_type, "event accept loop exited");
}

/// Write queued frames to one subscriber until it closes, errors, or the
/// broker stops. A write may block as long as the peer is not reading; the
/// queue keeps absorbing broadcasts by dropping its oldest frames meanwhile.
async fn drain_subscriber(
    entry: Arc<EventSocketEntry>,
    sub: Arc<SubscriberConnection>,
    connection: Connection,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = tokio::io::split(connection);
    let peer_closed = wait_for_close(reader);
    tokio::pin!(peer_closed);

    loop {
        let frame = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = &mut peer_closed => {
                tracing::debug!(
                    event_type = %sub.event_type,
                    subscriber = sub.id,
                    "subscriber closed connection",
                );
                break;
            }
            frame = sub.queue.pop() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            result = write_frame(&mut writer, &frame) => match result {
                Ok(()) => {
                    entry.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(
                        event_type = %sub.event_type,
                        subscriber = sub.id,
                        error = %err,
                        "subscriber write failed",
                    );
                    break;
                }
            }
        }
    }

    entry.remove(sub.id).await;
}

/// Resolve once the peer closes (EOF) or errors. Inbound bytes are ignored.
async fn wait_for_close<R: tokio::io::AsyncRead + Unpin>(mut reader: R) {
    let mut sink = [0u8; 256];
    loop {
        match reader.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Resolve once shutdown is signalled or the sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub(crate) async fn join_or_abort(handle: JoinHandle<()>, grace: Duration) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(grace, handle).await.is_err() {
        abort.abort();
    }
}
