//! Node side of the collector link.
//!
//! A [`Session`] owns one logical connection. `connect()` dials and runs the
//! handshake, then parks the split socket in a slot. The reader task takes it
//! from there: it keeps the stream half and hands the sink half to the
//! [`LinkWriter`], which is the only task that writes. A transport failure
//! seen by either task sends the reader into `reconnect()`, which gets four
//! `connect()` calls before the session terminates.

mod reader;

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fleetbeat_core::config::NodeConfig;
use fleetbeat_core::identity::NodeIdentity;
use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_services::handshake;
use fleetbeat_services::{
    IdentityStore, LinkGate, LinkWriter, OutboundQueue, SessionState, Shutdown, StateCell,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// `connect()` calls one `reconnect()` may make.
pub const RECONNECT_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub url: String,
    /// Pause between failed dials.
    pub connect_interval: Duration,
    /// Total dialing time one `connect()` may spend.
    pub connect_period: Duration,
    /// Bound on each handshake read.
    pub handshake_timeout: Duration,
    /// How long the writer waits at shutdown for the final flush.
    pub drain_wait: Duration,
    /// Store key of this node's identity record.
    pub identity_key: String,
}

impl SessionOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            url: config.server.url(),
            connect_interval: config.connect.interval(),
            connect_period: config.connect.period(),
            handshake_timeout: Duration::from_secs(10),
            drain_wait: Duration::from_secs(2),
            identity_key: identity_key(&config.identity.path),
        }
    }
}

/// Key for a node identity file: its stem, e.g. `node` for `node.id`.
pub fn identity_key(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "node".to_string())
}

/// A handshaken socket waiting for the reader to claim it.
struct PendingLink {
    generation: u64,
    sink: WsSink,
    source: WsSource,
}

pub struct Session {
    options: SessionOptions,
    identity: RwLock<NodeIdentity>,
    /// Mirror of the identity's id for envelope stamping.
    source: Arc<AtomicU32>,
    store: Arc<dyn IdentityStore>,
    state: StateCell,
    gate: Arc<LinkGate>,
    generation: AtomicU64,
    queue: Arc<OutboundQueue>,
    config: watch::Sender<ConfigSnapshot>,
    pending: Mutex<Option<PendingLink>>,
    flush: Arc<Notify>,
    shutdown: Shutdown,
    connect_calls: AtomicU32,
}

/// Join handles of a started session.
pub struct SessionTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl SessionTasks {
    pub async fn join(self) {
        if let Err(e) = self.reader.await {
            tracing::error!(error = %e, "session reader panicked");
        }
        if let Err(e) = self.writer.await {
            tracing::error!(error = %e, "session writer panicked");
        }
    }
}

impl Session {
    pub fn new(
        options: SessionOptions,
        identity: NodeIdentity,
        store: Arc<dyn IdentityStore>,
        shutdown: Shutdown,
    ) -> Self {
        let (config, _) = watch::channel(ConfigSnapshot::default());
        Self {
            options,
            source: Arc::new(AtomicU32::new(identity.id)),
            identity: RwLock::new(identity),
            store,
            state: StateCell::default(),
            gate: Arc::new(LinkGate::default()),
            generation: AtomicU64::new(0),
            queue: Arc::new(OutboundQueue::default()),
            config,
            pending: Mutex::new(None),
            flush: Arc::new(Notify::new()),
            shutdown,
            connect_calls: AtomicU32::new(0),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Dial, handshake and mark the session connected. Returns `true`
    /// straight away if already connected, `false` if the collector could not
    /// be reached within the connect period or the handshake failed.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.state() == SessionState::Terminated {
            return false;
        }
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        self.state.set(SessionState::Connecting);

        let Some(mut ws) = self.dial().await else {
            self.state.set(SessionState::Disconnected);
            return false;
        };

        self.state.set(SessionState::Handshaking);
        let claimed = self.identity();
        let accepted =
            match handshake::initiate(&mut ws, &claimed, self.options.handshake_timeout).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(url = %self.options.url, error = %e, "handshake failed");
                    let _ = ws.close(None).await;
                    self.state.set(SessionState::Disconnected);
                    return false;
                }
            };

        self.adopt_identity(&accepted.identity);
        self.apply_config(accepted.snapshot);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, source) = ws.split();
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(PendingLink {
            generation,
            sink,
            source,
        });
        self.gate.open(generation);
        self.state.set(SessionState::Connected);
        tracing::info!(
            url = %self.options.url,
            node = %self.identity(),
            generation,
            "connected to collector"
        );
        true
    }

    /// Mark disconnected and try `connect()` up to [`RECONNECT_ATTEMPTS`]
    /// times. On exhaustion the session is terminated.
    pub async fn reconnect(&self) -> bool {
        self.gate.close();
        self.state.set(SessionState::Reconnecting);
        for attempt in 1..=RECONNECT_ATTEMPTS {
            if self.shutdown.is_triggered() {
                return false;
            }
            tracing::info!(attempt, of = RECONNECT_ATTEMPTS, "reconnecting");
            if self.connect().await {
                return true;
            }
        }
        tracing::error!(url = %self.options.url, "reconnect attempts exhausted");
        self.state.set(SessionState::Terminated);
        false
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_open()
    }

    /// Spawn the reader and writer tasks. Call after a successful
    /// `connect()`; without one the reader starts by reconnecting.
    pub fn start(self: &Arc<Self>) -> SessionTasks {
        let (writer, handle) = LinkWriter::new(
            format!("{:08x}", self.source.load(Ordering::Relaxed)),
            self.queue.clone(),
            self.gate.clone(),
            self.config.subscribe(),
            self.shutdown.subscribe(),
            self.options.drain_wait,
        );
        let writer = tokio::spawn(writer.run());
        let reader = tokio::spawn(reader::run(self.clone(), handle, self.shutdown.subscribe()));
        SessionTasks { reader, writer }
    }

    /// End the session for good and raise the termination signal.
    fn terminate(&self, reason: &str) {
        tracing::error!(reason, "session terminated");
        self.gate.close();
        self.state.set(SessionState::Terminated);
        self.shutdown.trigger();
    }

    async fn dial(&self) -> Option<WsStream> {
        let deadline = Instant::now() + self.options.connect_period;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let now = Instant::now();
            if now > deadline {
                tracing::warn!(
                    url = %self.options.url,
                    period_ms = self.options.connect_period.as_millis() as u64,
                    "collector unreachable within connect period"
                );
                return None;
            }
            match timeout(deadline - now, connect_async(self.options.url.as_str())).await {
                Ok(Ok((ws, _response))) => return Some(ws),
                Ok(Err(e)) => tracing::debug!(url = %self.options.url, error = %e, "dial failed"),
                Err(_) => tracing::debug!(url = %self.options.url, "dial timed out"),
            }
            tokio::select! {
                _ = shutdown.recv() => return None,
                _ = sleep(self.options.connect_interval) => {}
            }
        }
    }

    fn take_pending(&self) -> Option<PendingLink> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    // ── Identity and configuration ───────────────────────────────────────────

    fn adopt_identity(&self, confirmed: &NodeIdentity) {
        let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
        if identity.id == confirmed.id {
            return;
        }
        tracing::info!(
            old = format_args!("{:08x}", identity.id),
            new = format_args!("{:08x}", confirmed.id),
            "collector assigned identity"
        );
        identity.id = confirmed.id;
        self.source.store(confirmed.id, Ordering::Release);
        if let Err(e) = self.store.save_identity(&self.options.identity_key, &identity) {
            tracing::warn!(error = %e, "failed to persist identity");
        }
    }

    /// Replace the snapshot whole. Subscribers are woken only when it
    /// actually changes.
    pub fn apply_config(&self, snapshot: ConfigSnapshot) {
        let changed = self.config.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        if changed {
            tracing::info!(?snapshot, "configuration applied");
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn identity(&self) -> NodeIdentity {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn config(&self) -> ConfigSnapshot {
        *self.config.borrow()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<ConfigSnapshot> {
        self.config.subscribe()
    }

    pub fn queue(&self) -> Arc<OutboundQueue> {
        self.queue.clone()
    }

    pub fn source_id(&self) -> Arc<AtomicU32> {
        self.source.clone()
    }

    /// Notified when the collector asks for an immediate flush.
    pub fn flush_requests(&self) -> Arc<Notify> {
        self.flush.clone()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// `connect()` calls made so far.
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbeat_core::wire::{Envelope, Kind};
    use fleetbeat_services::MemoryIdentityStore;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    fn options(url: String, interval_ms: u64, period_ms: u64) -> SessionOptions {
        SessionOptions {
            url,
            connect_interval: Duration::from_millis(interval_ms),
            connect_period: Duration::from_millis(period_ms),
            handshake_timeout: Duration::from_secs(2),
            drain_wait: Duration::ZERO,
            identity_key: "node".into(),
        }
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn session(opts: SessionOptions, store: Arc<MemoryIdentityStore>) -> Session {
        Session::new(opts, NodeIdentity::fresh("test-host"), store, Shutdown::new())
    }

    #[tokio::test]
    async fn connect_gives_up_after_period() {
        let port = closed_port().await;
        let s = session(
            options(format!("ws://127.0.0.1:{port}/ws"), 50, 300),
            Arc::new(MemoryIdentityStore::new()),
        );
        let started = std::time::Instant::now();
        assert!(!s.connect().await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300 + 50 + 250), "{elapsed:?}");
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn reconnect_makes_exactly_four_attempts() {
        let port = closed_port().await;
        let s = session(
            options(format!("ws://127.0.0.1:{port}/ws"), 10, 40),
            Arc::new(MemoryIdentityStore::new()),
        );
        assert!(!s.reconnect().await);
        assert_eq!(s.connect_calls(), RECONNECT_ATTEMPTS);
        assert_eq!(s.state(), SessionState::Terminated);
        assert!(!s.connect().await, "terminated sessions stay down");
        assert_eq!(s.connect_calls(), RECONNECT_ATTEMPTS);
    }

    /// Accept one connection, answer the handshake assigning `assign`.
    async fn one_shot_collector(assign: u32, snapshot: ConfigSnapshot) -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut claimed = handshake::receive_hello(&mut ws, Duration::from_secs(2))
                .await
                .unwrap();
            claimed.id = assign;
            handshake::complete(&mut ws, &claimed, &snapshot).await.unwrap();
            // Hold the link open until the node goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });
        (port, task)
    }

    #[tokio::test]
    async fn connect_adopts_and_persists_assigned_identity() {
        let snapshot = ConfigSnapshot {
            load_period_ms: 0,
            ..ConfigSnapshot::default()
        };
        let (port, collector) = one_shot_collector(0x0bad_cafe, snapshot).await;
        let store = Arc::new(MemoryIdentityStore::new());
        let s = session(options(format!("ws://127.0.0.1:{port}/ws"), 10, 2000), store.clone());

        assert!(s.connect().await);
        assert!(s.is_connected());
        assert!(s.connect().await, "second connect is a no-op");
        assert_eq!(s.connect_calls(), 1);
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.identity().id, 0x0bad_cafe);
        assert_eq!(s.source_id().load(Ordering::Relaxed), 0x0bad_cafe);
        assert_eq!(s.config(), snapshot);

        let saved = store.load_identity("node").unwrap().unwrap();
        assert_eq!(saved.id, 0x0bad_cafe);
        assert_eq!(saved.hostname, "test-host");

        drop(s);
        collector.abort();
    }

    #[tokio::test]
    async fn protocol_violation_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let collector = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let bogus = Envelope::new(0, 0, Kind::CpuData, vec![1u8]);
            let _ = ws.send(Message::Binary(bogus.encode().unwrap())).await;
            while let Some(Ok(_)) = ws.next().await {}
        });
        let s = session(
            options(format!("ws://127.0.0.1:{port}/ws"), 10, 2000),
            Arc::new(MemoryIdentityStore::new()),
        );
        assert!(!s.connect().await);
        assert!(!s.is_connected());
        assert_eq!(s.identity().id, 0);
        collector.await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_config_does_not_wake_subscribers() {
        let s = session(
            options("ws://127.0.0.1:1/ws".into(), 10, 40),
            Arc::new(MemoryIdentityStore::new()),
        );
        let mut rx = s.subscribe_config();
        s.apply_config(s.config());
        assert!(!rx.has_changed().unwrap());

        let changed = ConfigSnapshot {
            push_period_ms: s.config().push_period_ms + 1,
            ..s.config()
        };
        s.apply_config(changed);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), changed);
    }

    #[test]
    fn identity_key_is_file_stem() {
        assert_eq!(identity_key(Path::new("/var/lib/fleetbeat/node.id")), "node");
        assert_eq!(identity_key(Path::new("/")), "node");
    }
}
