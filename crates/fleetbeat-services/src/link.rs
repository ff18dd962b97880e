//! One WebSocket link: the single writer task, frame classification and
//! read helpers shared by the node and the collector.
//!
//! Ownership: after a handshake the socket is split. The reader task keeps the
//! stream half; the sink half is handed to the [`LinkWriter`] over a channel
//! together with a generation number. The writer is the only task that writes
//! in steady state, and it writes only while the [`LinkGate`] admits the
//! generation of the sink it holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::ACK;

use crate::outbound::OutboundQueue;
use crate::shutdown::ShutdownSignal;

/// Upper bound on closing a sink at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Gate ──────────────────────────────────────────────────────────────────────

/// Which link generation may be written to. Zero while disconnected.
#[derive(Debug, Default)]
pub struct LinkGate(AtomicU64);

impl LinkGate {
    /// Admit `generation`. An older generation never displaces a newer one.
    pub fn open(&self, generation: u64) {
        self.0.fetch_max(generation, Ordering::AcqRel);
    }

    pub fn close(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn admits(&self, generation: u64) -> bool {
        generation != 0 && self.0.load(Ordering::Acquire) == generation
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A sink half together with the generation it was opened under.
pub struct Link<S> {
    pub generation: u64,
    pub sink: S,
}

/// Replies the reader asks the writer to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Acknowledge a received data frame.
    Ack,
    /// A pong arrived; answer with a ping.
    Ping,
}

/// What a received frame means to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Vec<u8>),
    Text(String),
    /// Acknowledgements and raw frames. Nothing to do.
    Ignored,
    Ping,
    Pong,
    Close,
}

impl From<Message> for Inbound {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Binary(b) => Inbound::Envelope(b),
            Message::Text(t) if t == ACK => Inbound::Ignored,
            Message::Text(t) => Inbound::Text(t),
            Message::Ping(_) => Inbound::Ping,
            Message::Pong(_) => Inbound::Pong,
            Message::Close(_) => Inbound::Close,
            Message::Frame(_) => Inbound::Ignored,
        }
    }
}

/// Whether `err` means the peer or the network went away, as opposed to a
/// local fault that reconnecting would not cure.
pub fn is_transport_close(err: &WsError) -> bool {
    use std::io::ErrorKind;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
        ),
        _ => false,
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Message),
    /// Transport-level close, including silence longer than the read timeout.
    Closed(String),
    Failed(WsError),
}

/// Read one frame, treating silence longer than `limit` as a closed link.
pub async fn read_frame<R>(stream: &mut R, limit: Duration) -> ReadOutcome
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match timeout(limit, stream.next()).await {
        Err(_) => ReadOutcome::Closed(format!("no traffic for {}ms", limit.as_millis())),
        Ok(None) => ReadOutcome::Closed("stream ended".to_string()),
        Ok(Some(Ok(msg))) => ReadOutcome::Frame(msg),
        Ok(Some(Err(e))) if is_transport_close(&e) => ReadOutcome::Closed(e.to_string()),
        Ok(Some(Err(e))) => ReadOutcome::Failed(e),
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Reader-side handles to a [`LinkWriter`].
pub struct WriterHandle<S> {
    /// Install a freshly connected sink.
    pub links: mpsc::UnboundedSender<Link<S>>,
    pub control: mpsc::UnboundedSender<Control>,
    /// Generations whose sink failed a write.
    pub faults: mpsc::UnboundedReceiver<u64>,
}

/// Drains an [`OutboundQueue`] onto whichever sink is current.
pub struct LinkWriter<S> {
    label: String,
    queue: Arc<OutboundQueue>,
    gate: Arc<LinkGate>,
    config: watch::Receiver<ConfigSnapshot>,
    shutdown: ShutdownSignal,
    /// How long to wait at shutdown for producers to close the queue.
    drain_wait: Duration,
    links: mpsc::UnboundedReceiver<Link<S>>,
    control: mpsc::UnboundedReceiver<Control>,
    faults: mpsc::UnboundedSender<u64>,
}

impl<S> LinkWriter<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    pub fn new(
        label: impl Into<String>,
        queue: Arc<OutboundQueue>,
        gate: Arc<LinkGate>,
        config: watch::Receiver<ConfigSnapshot>,
        shutdown: ShutdownSignal,
        drain_wait: Duration,
    ) -> (Self, WriterHandle<S>) {
        let (links_tx, links) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let writer = Self {
            label: label.into(),
            queue,
            gate,
            config,
            shutdown,
            drain_wait,
            links,
            control,
            faults,
        };
        let handle = WriterHandle {
            links: links_tx,
            control: control_tx,
            faults: faults_rx,
        };
        (writer, handle)
    }

    pub async fn run(mut self) {
        let mut link: Option<Link<S>> = None;
        let mut last_write = Instant::now();
        let mut last_ping = Instant::now();
        let mut ping_requested = false;

        loop {
            if self.writable(&link) {
                while let Some(entry) = self.queue.dequeue() {
                    if !self.write(&mut link, Message::Binary(entry.bytes.to_vec())).await {
                        break;
                    }
                    last_write = Instant::now();
                }
            }

            let ping_period = self.config.borrow().ping_period();
            // Pings answering a pong are spaced one period apart so the
            // mutual reply cannot spin.
            let ping_at = if ping_requested {
                last_ping + ping_period
            } else {
                last_write + ping_period
            };
            let writable = self.writable(&link);

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(link = %self.label, "writer shutting down");
                    self.finish(link).await;
                    return;
                }

                next = self.links.recv() => match next {
                    Some(fresh) => {
                        tracing::debug!(link = %self.label, generation = fresh.generation, "writer attached");
                        link = Some(fresh);
                        last_write = Instant::now();
                        last_ping = last_write;
                        ping_requested = false;
                    }
                    None => {
                        self.finish(link).await;
                        return;
                    }
                },

                Some(ctrl) = self.control.recv() => match ctrl {
                    Control::Ack => {
                        if writable && self.write(&mut link, Message::Text(ACK.to_string())).await {
                            last_write = Instant::now();
                        }
                    }
                    // Sent at `ping_at`: one period after the previous ping.
                    Control::Ping => ping_requested = true,
                },

                _ = self.queue.notified() => {}

                _ = sleep_until(ping_at), if writable => {
                    if self.write(&mut link, Message::Ping(Vec::new())).await {
                        last_write = Instant::now();
                        last_ping = last_write;
                    }
                    ping_requested = false;
                }
            }
        }
    }

    fn writable(&self, link: &Option<Link<S>>) -> bool {
        link.as_ref()
            .is_some_and(|l| self.gate.admits(l.generation))
    }

    /// Send one frame. On failure the sink is dropped and its generation
    /// reported as faulted.
    async fn write(&self, link: &mut Option<Link<S>>, msg: Message) -> bool {
        let limit = self.config.borrow().read_timeout();
        let Some(current) = link.as_mut() else {
            return false;
        };
        let error = match timeout(limit, current.sink.send(msg)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write stalled for {}ms", limit.as_millis()),
        };
        let generation = current.generation;
        tracing::warn!(link = %self.label, generation, error = %error, "write failed");
        *link = None;
        let _ = self.faults.send(generation);
        false
    }

    /// Wait (bounded) for producers to finish, send what is queued, close.
    async fn finish(&mut self, mut link: Option<Link<S>>) {
        if !self.drain_wait.is_zero()
            && timeout(self.drain_wait, self.queue.wait_closed()).await.is_err()
        {
            tracing::warn!(link = %self.label, "producers did not finish before drain deadline");
        }
        let mut sent = 0usize;
        if self.writable(&link) {
            while let Some(entry) = self.queue.dequeue() {
                if !self.write(&mut link, Message::Binary(entry.bytes.to_vec())).await {
                    break;
                }
                sent += 1;
            }
        }
        tracing::debug!(link = %self.label, sent, left = self.queue.len(), "final drain");
        if let Some(mut current) = link.take() {
            let _ = timeout(CLOSE_TIMEOUT, current.sink.close()).await;
        }
    }
}
