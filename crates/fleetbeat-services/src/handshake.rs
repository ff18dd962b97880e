//! Connection handshake, both halves.
//!
//! ```text
//! node      → collector   ClientInfo envelope: identity record (id 0 = unassigned)
//! collector → node        ClientInfo envelope: confirmed or assigned identity
//! collector → node        ClientConfig envelope: configuration snapshot
//! collector → node        Eot envelope, empty payload
//! ```
//!
//! While waiting for the confirmed identity the node logs and skips text
//! frames. Ping and pong frames belong to the transport and are skipped
//! everywhere. Any other frame, or an envelope of the wrong kind, aborts the
//! handshake.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use fleetbeat_core::identity::{IdentityError, NodeIdentity};
use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::{Envelope, EnvelopeView, Kind, WireError, COLLECTOR_ID};

use crate::link::{read_frame, ReadOutcome};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("link closed during handshake: {0}")]
    Closed(String),
    #[error("transport: {0}")]
    Transport(#[from] WsError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// What the node learns from a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub identity: NodeIdentity,
    pub snapshot: ConfigSnapshot,
}

// ── Node side ─────────────────────────────────────────────────────────────────

pub async fn initiate<S>(
    ws: &mut S,
    identity: &NodeIdentity,
    limit: Duration,
) -> Result<Accepted, HandshakeError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let hello = Envelope::new(identity.id, COLLECTOR_ID, Kind::ClientInfo, identity.encode()?);
    ws.send(Message::Binary(hello.encode()?)).await?;

    let confirmed = loop {
        match next_frame(ws, limit).await? {
            Message::Binary(bytes) => {
                let view = expect_kind(&bytes, Kind::ClientInfo)?;
                break NodeIdentity::decode(view.payload())?;
            }
            Message::Text(text) => {
                tracing::info!(message = %text, "collector notice during handshake");
            }
            other => return Err(unexpected(&other, "confirmed identity")),
        }
    };

    let snapshot = match next_frame(ws, limit).await? {
        Message::Binary(bytes) => {
            let view = expect_kind(&bytes, Kind::ClientConfig)?;
            ConfigSnapshot::from_bytes(view.payload())?
        }
        other => return Err(unexpected(&other, "configuration")),
    };

    match next_frame(ws, limit).await? {
        Message::Binary(bytes) => {
            expect_kind(&bytes, Kind::Eot)?;
        }
        other => return Err(unexpected(&other, "end of handshake")),
    }

    Ok(Accepted {
        identity: confirmed,
        snapshot,
    })
}

// ── Collector side ────────────────────────────────────────────────────────────

/// Read the node's hello and return the identity it claims.
pub async fn receive_hello<S>(ws: &mut S, limit: Duration) -> Result<NodeIdentity, HandshakeError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match next_frame(ws, limit).await? {
        Message::Binary(bytes) => {
            let view = expect_kind(&bytes, Kind::ClientInfo)?;
            Ok(NodeIdentity::decode(view.payload())?)
        }
        other => Err(unexpected(&other, "node identity")),
    }
}

/// Send the confirmed identity, the snapshot and the end marker.
pub async fn complete<S>(
    ws: &mut S,
    identity: &NodeIdentity,
    snapshot: &ConfigSnapshot,
) -> Result<(), HandshakeError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frames = [
        Envelope::new(COLLECTOR_ID, identity.id, Kind::ClientInfo, identity.encode()?),
        Envelope::new(COLLECTOR_ID, identity.id, Kind::ClientConfig, snapshot.to_bytes()),
        Envelope::new(COLLECTOR_ID, identity.id, Kind::Eot, Vec::new()),
    ];
    for envelope in &frames {
        ws.feed(Message::Binary(envelope.encode()?)).await?;
    }
    ws.flush().await?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn next_frame<S>(ws: &mut S, limit: Duration) -> Result<Message, HandshakeError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match read_frame(ws, limit).await {
            ReadOutcome::Frame(Message::Ping(_) | Message::Pong(_)) => continue,
            ReadOutcome::Frame(msg) => return Ok(msg),
            ReadOutcome::Closed(reason) => return Err(HandshakeError::Closed(reason)),
            ReadOutcome::Failed(e) => return Err(e.into()),
        }
    }
}

fn expect_kind(bytes: &[u8], want: Kind) -> Result<EnvelopeView<'_>, HandshakeError> {
    let view = EnvelopeView::parse(bytes)?;
    if view.kind() != want {
        return Err(HandshakeError::Protocol(format!(
            "expected {} envelope, got {}",
            want.name(),
            view.kind().name()
        )));
    }
    Ok(view)
}

fn unexpected(msg: &Message, waiting_for: &str) -> HandshakeError {
    let frame = match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    };
    HandshakeError::Protocol(format!("{frame} frame while waiting for {waiting_for}"))
}
