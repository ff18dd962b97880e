//! Node listener: accepts WebSocket connections, runs the collector half of
//! the handshake, reconciles the node's identity against the registry and
//! serves the link until it drops.
//!
//! The collector never reconnects; a node that drops comes back through the
//! handshake and is matched to its registry entry by id.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;

use fleetbeat_core::identity::{NodeIdentity, UNASSIGNED};
use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_services::handshake;
use fleetbeat_services::link::{read_frame, Control, Inbound, Link, LinkWriter, ReadOutcome};
use fleetbeat_services::store::node_key;
use fleetbeat_services::{
    IdentityStore, NodeRegistry, NodeSession, SessionState, Shutdown, ShutdownSignal,
};

use crate::dispatch::Dispatcher;

/// Bound on the WebSocket upgrade and on each handshake read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs, shared by all of them.
pub struct ListenerContext {
    pub registry: NodeRegistry,
    pub store: Arc<dyn IdentityStore>,
    pub dispatcher: Arc<Dispatcher>,
    /// Snapshot given to nodes the registry has not seen yet.
    pub defaults: ConfigSnapshot,
    pub shutdown: Shutdown,
}

pub struct NodeListener {
    tcp: TcpListener,
    ctx: Arc<ListenerContext>,
    shutdown: ShutdownSignal,
}

impl NodeListener {
    pub async fn bind(addr: &str, ctx: ListenerContext) -> Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind node listener on {addr}"))?;
        let shutdown = ctx.shutdown.subscribe();
        Ok(Self {
            tcp,
            ctx: Arc::new(ctx),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "node listener ready");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("node listener shutting down");
                    return Ok(());
                }

                accepted = self.tcp.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_node(ctx, tcp, peer).await {
                            tracing::warn!(peer = %peer, error = %e, "node connection failed");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_node(ctx: Arc<ListenerContext>, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut ws = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(tcp))
        .await
        .context("websocket upgrade timed out")?
        .context("websocket upgrade failed")?;

    let claimed = match handshake::receive_hello(&mut ws, HANDSHAKE_TIMEOUT).await {
        Ok(claimed) => claimed,
        Err(e) => {
            let _ = ws.close(None).await;
            return Err(e).context("handshake");
        }
    };
    let session = reconcile(&ctx, claimed);
    let identity = session.identity();

    if let Err(e) = ctx.store.save_identity(&node_key(identity.id), &identity) {
        tracing::warn!(node = %identity, error = %e, "failed to persist identity");
    }

    if let Err(e) = handshake::complete(&mut ws, &identity, &session.config()).await {
        session.state.set(SessionState::Disconnected);
        let _ = ws.close(None).await;
        return Err(e).context("handshake");
    }

    let generation = session.mark_attached(peer);
    session.gate.open(generation);
    session.state.set(SessionState::Connected);
    tracing::info!(node = %identity, peer = %peer, generation, "node connected");

    serve_link(&ctx, &session, ws, generation).await;
    tracing::info!(node = %identity, peer = %peer, "node disconnected");
    Ok(())
}

/// Find or create the registry entry for a node that claims `claimed`.
fn reconcile(ctx: &ListenerContext, claimed: NodeIdentity) -> Arc<NodeSession> {
    if claimed.id == UNASSIGNED {
        let session = ctx.registry.new_session(|id| {
            NodeSession::new(NodeIdentity { id, ..claimed }, ctx.defaults)
        });
        tracing::info!(node = %session.identity(), "assigned new identity");
        return session;
    }

    let mut live = false;
    let (session, inserted) = ctx.registry.get_or_insert_with(
        claimed.id,
        |existing| {
            // Another handshake may hold the entry without having opened its gate yet.
            live = existing.is_connected() || existing.state.get() == SessionState::Handshaking;
            if live {
                return false;
            }
            existing.refresh_identity(&claimed);
            existing.state.set(SessionState::Handshaking);
            true
        },
        || NodeSession::new(claimed.clone(), ctx.defaults),
    );
    if live {
        // TODO: hand the id over from the live link instead of orphaning it.
        tracing::warn!(node = %claimed, "identity already connected, replacing entry");
    } else if inserted {
        tracing::debug!(node = %claimed, "registered node with known identity");
    }
    session
}

/// Run the writer and this connection's read loop until the link ends.
async fn serve_link(
    ctx: &ListenerContext,
    session: &Arc<NodeSession>,
    ws: WebSocketStream<TcpStream>,
    generation: u64,
) {
    let (sink, mut source) = ws.split();
    let (writer, mut handle) = LinkWriter::new(
        format!("{:08x}", session.id()),
        session.queue.clone(),
        session.gate.clone(),
        session.subscribe_config(),
        ctx.shutdown.subscribe(),
        Duration::ZERO,
    );
    let writer = tokio::spawn(writer.run());
    if handle.links.send(Link { generation, sink }).is_err() {
        session.gate.close();
        session.state.set(SessionState::Disconnected);
        return;
    }

    let mut shutdown = ctx.shutdown.subscribe();
    // A failed write only ends the writing half. Frames the node sent before
    // it went away are still read and dispatched; the read side ends the link.
    let mut write_failed = false;
    loop {
        let limit = session.config().read_timeout();
        let outcome = tokio::select! {
            _ = shutdown.recv() => break,

            Some(failed) = handle.faults.recv(), if !write_failed => {
                if failed == generation {
                    tracing::warn!(node = format_args!("{:08x}", session.id()), "write failed, draining reads");
                    write_failed = true;
                }
                continue;
            }

            outcome = read_frame(&mut source, limit) => outcome,
        };

        match outcome {
            ReadOutcome::Frame(msg) => {
                session.touch();
                match Inbound::from(msg) {
                    Inbound::Envelope(bytes) => {
                        session.frames_in.fetch_add(1, Ordering::Relaxed);
                        let _ = handle.control.send(Control::Ack);
                        ctx.dispatcher.dispatch(session, &bytes);
                    }
                    Inbound::Text(text) => {
                        let _ = handle.control.send(Control::Ack);
                        tracing::info!(node = format_args!("{:08x}", session.id()), message = %text, "node notice");
                    }
                    Inbound::Pong => {
                        let _ = handle.control.send(Control::Ping);
                    }
                    Inbound::Ping | Inbound::Ignored => {}
                    Inbound::Close => break,
                }
            }
            ReadOutcome::Closed(reason) => {
                tracing::debug!(node = format_args!("{:08x}", session.id()), reason = %reason, "link closed");
                break;
            }
            ReadOutcome::Failed(e) => {
                tracing::warn!(node = format_args!("{:08x}", session.id()), error = %e, "read failed");
                break;
            }
        }
    }

    // Closing the gate first keeps the writer from touching the queue.
    if session.gate.admits(generation) {
        session.gate.close();
        session.state.set(SessionState::Disconnected);
    }
    drop(handle);
    let _ = writer.await;
}
