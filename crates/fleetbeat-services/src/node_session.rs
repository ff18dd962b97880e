//! Collector-side record of one node's session.
//!
//! The registry holds these behind `Arc`; the listener task that owns the
//! node's socket holds another clone. Everything here is shared state only:
//! the socket itself never leaves the listener's reader and writer tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::watch;

use fleetbeat_core::identity::NodeIdentity;
use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::{Envelope, Kind, WireError, COLLECTOR_ID};

use crate::link::LinkGate;
use crate::outbound::OutboundQueue;
use crate::registry::SessionRegistry;
use crate::samples::unix_ms;
use crate::state::{SessionState, StateCell};

pub struct NodeSession {
    identity: RwLock<NodeIdentity>,
    peer: RwLock<Option<SocketAddr>>,
    pub queue: Arc<OutboundQueue>,
    pub gate: Arc<LinkGate>,
    pub state: StateCell,
    config: watch::Sender<ConfigSnapshot>,
    established_ms: AtomicU64,
    last_seen_ms: AtomicU64,
    pub frames_in: AtomicU64,
    pub samples_in: AtomicU64,
    pub decode_errors: AtomicU64,
    pub connects: AtomicU64,
}

/// Shared directory of node sessions.
pub type NodeRegistry = Arc<SessionRegistry<NodeSession>>;

pub fn new_node_registry() -> NodeRegistry {
    Arc::new(SessionRegistry::new())
}

impl NodeSession {
    pub fn new(identity: NodeIdentity, config: ConfigSnapshot) -> Self {
        let (config, _) = watch::channel(config);
        let now = unix_ms();
        Self {
            identity: RwLock::new(identity),
            peer: RwLock::new(None),
            queue: Arc::new(OutboundQueue::default()),
            gate: Arc::new(LinkGate::default()),
            state: StateCell::new(SessionState::Handshaking),
            config,
            established_ms: AtomicU64::new(now),
            last_seen_ms: AtomicU64::new(now),
            frames_in: AtomicU64::new(0),
            samples_in: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.identity().id
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Refresh the descriptive attributes a reconnecting node reports. The id
    /// is kept.
    pub fn refresh_identity(&self, reported: &NodeIdentity) {
        let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
        identity.hostname = reported.hostname.clone();
        identity.region = reported.region.clone();
        identity.zone = reported.zone.clone();
        identity.datacenter = reported.datacenter.clone();
    }

    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_open()
    }

    pub fn config(&self) -> ConfigSnapshot {
        *self.config.borrow()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<ConfigSnapshot> {
        self.config.subscribe()
    }

    /// Replace the node's snapshot and queue it for delivery. Delivered on the
    /// next write if the node is connected, otherwise after it reattaches.
    pub fn push_config(&self, snapshot: ConfigSnapshot) -> Result<(), WireError> {
        self.config.send_replace(snapshot);
        let envelope = Envelope::new(COLLECTOR_ID, self.id(), Kind::ClientConfig, snapshot.to_bytes());
        self.queue.push(&envelope)
    }

    pub fn send_command(&self, command: &str) -> Result<(), WireError> {
        let envelope = Envelope::new(
            COLLECTOR_ID,
            self.id(),
            Kind::Command,
            command.as_bytes().to_vec(),
        );
        self.queue.push(&envelope)
    }

    /// Record a new link from `addr` and return its generation. Each call
    /// gets a distinct generation.
    pub fn mark_attached(&self, addr: SocketAddr) -> u64 {
        self.set_peer(addr);
        self.established_ms.store(unix_ms(), Ordering::Relaxed);
        self.touch();
        self.connects.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(unix_ms(), Ordering::Relaxed);
    }

    pub fn info(&self) -> NodeInfo {
        let identity = self.identity();
        NodeInfo {
            id: format!("{:08x}", identity.id),
            hostname: identity.hostname,
            region: identity.region,
            zone: identity.zone,
            datacenter: identity.datacenter,
            state: self.state.get(),
            connected: self.is_connected(),
            peer: self.peer().map(|a| a.to_string()),
            established_ms: self.established_ms.load(Ordering::Relaxed),
            last_seen_ms: self.last_seen_ms.load(Ordering::Relaxed),
            queued: self.queue.len(),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            config: self.config(),
        }
    }
}

/// Serializable view of a [`NodeSession`] for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub datacenter: String,
    pub state: SessionState,
    pub connected: bool,
    pub peer: Option<String>,
    pub established_ms: u64,
    pub last_seen_ms: u64,
    pub queued: usize,
    pub frames_in: u64,
    pub samples_in: u64,
    pub decode_errors: u64,
    pub connects: u64,
    pub config: ConfigSnapshot,
}
