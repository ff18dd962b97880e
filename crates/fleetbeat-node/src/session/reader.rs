//! The session's single read loop.

use std::sync::Arc;

use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::{EnvelopeView, Kind};
use fleetbeat_services::link::{read_frame, Control, Inbound, Link, ReadOutcome, WriterHandle};
use fleetbeat_services::ShutdownSignal;
use tokio_tungstenite::tungstenite::Message;

use super::{Session, WsSink, WsSource};

/// Stream half of the current link.
struct Attached {
    generation: u64,
    source: WsSource,
}

pub(super) async fn run(
    session: Arc<Session>,
    mut writer: WriterHandle<WsSink>,
    mut shutdown: ShutdownSignal,
) {
    let mut link = match attach(&session, &writer) {
        Some(link) => link,
        None => match recover(&session, &writer).await {
            Some(link) => link,
            None => return finish(&session, &shutdown),
        },
    };

    loop {
        let limit = session.config().read_timeout();
        let outcome = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("session reader shutting down");
                return;
            }

            Some(generation) = writer.faults.recv() => {
                if generation != link.generation {
                    continue;
                }
                ReadOutcome::Closed("write failed".to_string())
            }

            outcome = read_frame(&mut link.source, limit) => outcome,
        };

        let closed = match outcome {
            ReadOutcome::Frame(msg) => on_frame(&session, &writer, msg),
            ReadOutcome::Closed(reason) => Some(reason),
            ReadOutcome::Failed(e) => {
                session.terminate(&format!("read failed: {e}"));
                return;
            }
        };

        if let Some(reason) = closed {
            tracing::warn!(reason = %reason, generation = link.generation, "link lost");
            match recover(&session, &writer).await {
                Some(fresh) => link = fresh,
                None => return finish(&session, &shutdown),
            }
        }
    }
}

/// Claim the parked socket and give its sink to the writer.
fn attach(session: &Session, writer: &WriterHandle<WsSink>) -> Option<Attached> {
    let pending = session.take_pending()?;
    let link = Link {
        generation: pending.generation,
        sink: pending.sink,
    };
    if writer.links.send(link).is_err() {
        tracing::warn!("writer is gone, dropping fresh link");
        return None;
    }
    Some(Attached {
        generation: pending.generation,
        source: pending.source,
    })
}

async fn recover(session: &Session, writer: &WriterHandle<WsSink>) -> Option<Attached> {
    if session.reconnect().await {
        attach(session, writer)
    } else {
        None
    }
}

/// Reader exit without a live link: terminate unless we are shutting down
/// anyway.
fn finish(session: &Session, shutdown: &ShutdownSignal) {
    if !shutdown.is_triggered() {
        session.terminate("reconnect attempts exhausted");
    }
}

/// Returns a close reason when the frame ends the link.
fn on_frame(session: &Session, writer: &WriterHandle<WsSink>, msg: Message) -> Option<String> {
    match Inbound::from(msg) {
        Inbound::Envelope(bytes) => {
            let _ = writer.control.send(Control::Ack);
            dispatch(session, &bytes);
            None
        }
        Inbound::Text(text) => {
            let _ = writer.control.send(Control::Ack);
            tracing::info!(message = %text, "collector notice");
            None
        }
        Inbound::Pong => {
            let _ = writer.control.send(Control::Ping);
            None
        }
        Inbound::Ping | Inbound::Ignored => None,
        Inbound::Close => Some("collector closed the link".to_string()),
    }
}

fn dispatch(session: &Session, bytes: &[u8]) {
    let view = match EnvelopeView::parse(bytes) {
        Ok(view) => view,
        Err(e) => {
            tracing::warn!(error = %e, len = bytes.len(), "dropping malformed envelope");
            return;
        }
    };
    match view.kind() {
        Kind::ClientConfig => match ConfigSnapshot::from_bytes(view.payload()) {
            Ok(snapshot) => session.apply_config(snapshot),
            Err(e) => tracing::warn!(error = %e, "dropping malformed snapshot"),
        },
        Kind::Command => match std::str::from_utf8(view.payload()) {
            Ok("flush") => {
                tracing::debug!(id = %view.id(), "flush requested");
                session.flush.notify_one();
            }
            Ok(other) => tracing::warn!(command = other, "unknown command"),
            Err(_) => tracing::warn!("command is not UTF-8"),
        },
        kind => tracing::debug!(kind = kind.name(), id = %view.id(), "no handler for envelope"),
    }
}
