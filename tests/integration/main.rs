//! fleetbeat integration test harness.
//!
//! Every test runs a real collector listener on 127.0.0.1:0 and real node
//! sessions in the same process. Nothing is shared between tests: each one
//! gets its own listener, registry, sinks and shutdown signals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use fleetbeat_collector::{Dispatcher, ListenerContext, NodeListener};
use fleetbeat_core::identity::NodeIdentity;
use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::Kind;
use fleetbeat_node::{Healthbeat, Session, SessionOptions};
use fleetbeat_services::samples::{unix_ms, LoadSample};
use fleetbeat_services::{
    new_node_registry, MemoryIdentityStore, MemorySink, NodeRegistry, Sample, Sampler, Shutdown,
};

mod control;
mod sessions;
mod telemetry;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Collector {
    pub port: u16,
    pub registry: NodeRegistry,
    pub samples: Arc<MemorySink>,
    pub store: Arc<MemoryIdentityStore>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<()>>,
}

impl Collector {
    pub async fn start(defaults: ConfigSnapshot) -> Result<Self> {
        Self::start_on("127.0.0.1:0", defaults).await
    }

    /// Start on a fixed address, e.g. to stand in for a collector that went away.
    pub async fn start_on(addr: &str, defaults: ConfigSnapshot) -> Result<Self> {
        let registry = new_node_registry();
        let samples = Arc::new(MemorySink::new(4096));
        let store = Arc::new(MemoryIdentityStore::new());
        let shutdown = Shutdown::new();
        let listener = NodeListener::bind(
            addr,
            ListenerContext {
                registry: registry.clone(),
                store: store.clone(),
                dispatcher: Arc::new(Dispatcher::new(samples.clone())),
                defaults,
                shutdown: shutdown.clone(),
            },
        )
        .await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(listener.run());
        Ok(Self {
            port,
            registry,
            samples,
            store,
            shutdown,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Samples the collector decoded from `id`, across all its links.
    pub fn samples_in(&self, id: u32) -> u64 {
        self.registry
            .get(id)
            .map(|n| n.samples_in.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

pub fn node_options(url: String) -> SessionOptions {
    SessionOptions {
        url,
        connect_interval: Duration::from_millis(20),
        connect_period: Duration::from_millis(200),
        handshake_timeout: Duration::from_secs(2),
        drain_wait: Duration::from_secs(2),
        identity_key: "node".into(),
    }
}

pub struct Node {
    pub session: Arc<Session>,
    pub store: Arc<MemoryIdentityStore>,
    pub shutdown: Shutdown,
}

impl Node {
    pub fn new(url: String, identity: NodeIdentity) -> Self {
        let store = Arc::new(MemoryIdentityStore::new());
        let shutdown = Shutdown::new();
        let session = Arc::new(Session::new(
            node_options(url),
            identity,
            store.clone(),
            shutdown.clone(),
        ));
        Self {
            session,
            store,
            shutdown,
        }
    }

    pub fn healthbeat(&self, samplers: Vec<Box<dyn Sampler>>) -> JoinHandle<()> {
        tokio::spawn(
            Healthbeat::new(
                self.session.queue(),
                self.session.source_id(),
                self.session.subscribe_config(),
                self.session.flush_requests(),
                samplers,
                self.shutdown.subscribe(),
            )
            .run(),
        )
    }

    pub fn id(&self) -> u32 {
        self.session.identity().id
    }
}

/// Load sampler with a shared production counter, so tests can compare what
/// the node produced with what the collector received.
pub struct CountingSampler {
    pub produced: Arc<AtomicU32>,
}

impl CountingSampler {
    pub fn boxed() -> (Box<dyn Sampler>, Arc<AtomicU32>) {
        let produced = Arc::new(AtomicU32::new(0));
        let sampler = Box::new(Self {
            produced: produced.clone(),
        });
        (sampler, produced)
    }
}

impl Sampler for CountingSampler {
    fn kind(&self) -> Kind {
        Kind::LoadData
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst) + 1;
        let sample = Sample::Load(LoadSample {
            timestamp_ms: unix_ms(),
            one: n as f64,
            five: 0.0,
            fifteen: 0.0,
            uptime_secs: n as u64,
        });
        Ok(Some(sample.encode()?))
    }
}

/// Poll `cond` every 10ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collection and push periods small enough for tests.
pub fn fast_snapshot() -> ConfigSnapshot {
    ConfigSnapshot {
        cpu_period_ms: 0,
        mem_period_ms: 0,
        net_period_ms: 0,
        load_period_ms: 20,
        push_period_ms: 100,
        ping_period_ms: 1_000,
        read_timeout_ms: 5_000,
    }
}
