//! Outbound queue: the hand-off between producers and a session's single
//! socket writer.
//!
//! Producers enqueue from any task; only the writer dequeues. The queue grows
//! instead of refusing work, so enqueue never fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

use fleetbeat_core::queue::RingBuffer;
use fleetbeat_core::wire::{Envelope, Kind, WireError};

/// Starting capacity of a session queue.
pub const INITIAL_CAPACITY: usize = 64;

/// One queued frame: the kind tag and the fully encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub kind: Kind,
    pub bytes: Bytes,
}

impl QueueEntry {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, WireError> {
        Ok(Self {
            kind: envelope.kind,
            bytes: Bytes::from(envelope.encode()?),
        })
    }
}

/// Lock-guarded ring buffer plus a wake-up for the writer.
#[derive(Debug)]
pub struct OutboundQueue {
    buffer: Mutex<RingBuffer<QueueEntry>>,
    ready: Notify,
    closed: AtomicBool,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }
}

impl OutboundQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::with_capacity(capacity)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, entry: QueueEntry) {
        self.lock().enqueue(entry);
        self.ready.notify_one();
    }

    /// Encode and enqueue an envelope.
    pub fn push(&self, envelope: &Envelope) -> Result<(), WireError> {
        self.enqueue(QueueEntry::from_envelope(envelope)?);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.lock().dequeue()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn resize(&self, capacity: usize) {
        self.lock().resize(capacity);
    }

    /// Copy of every queued entry in FIFO order, leaving the queue intact.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let mut buf = self.lock();
        let entries = buf.drain();
        for e in &entries {
            buf.enqueue(e.clone());
        }
        entries
    }

    /// Resolves once something was enqueued (or the queue was closed) since
    /// the last wake-up. A wake-up that happens with nobody waiting is kept.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }

    /// Mark the end of production. Entries already queued stay.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until [`Self::close`] has been called.
    pub async fn wait_closed(&self) {
        while !self.is_closed() {
            self.ready.notified().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingBuffer<QueueEntry>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(n: u8) -> QueueEntry {
        QueueEntry {
            kind: Kind::Generic,
            bytes: Bytes::from(vec![n]),
        }
    }

    #[test]
    fn queue_is_fifo_across_growth() {
        let q = OutboundQueue::with_capacity(2);
        for n in 0..5 {
            q.enqueue(entry(n));
        }
        assert_eq!(q.capacity(), 8);
        let got: Vec<u8> = std::iter::from_fn(|| q.dequeue()).map(|e| e.bytes[0]).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn resize_and_reset_go_through_the_lock() {
        let q = OutboundQueue::with_capacity(4);
        for n in 0..3 {
            q.enqueue(entry(n));
        }
        q.resize(1);
        assert_eq!(q.capacity(), 3, "resize never drops queued entries");
        assert_eq!(q.dequeue(), Some(entry(0)));

        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 3);
        q.enqueue(entry(7));
        assert_eq!(q.dequeue(), Some(entry(7)));
    }

    #[test]
    fn push_encodes_envelope() {
        let q = OutboundQueue::default();
        let env = Envelope::new(5, 0, Kind::MemData, vec![1u8, 2]);
        q.push(&env).unwrap();
        let e = q.dequeue().unwrap();
        assert_eq!(e.kind, Kind::MemData);
        assert_eq!(Envelope::decode(&e.bytes).unwrap(), env);
    }

    #[test]
    fn snapshot_leaves_entries_queued() {
        let q = OutboundQueue::default();
        q.enqueue(entry(1));
        q.enqueue(entry(2));
        assert_eq!(q.snapshot().len(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(entry(1)));
    }

    #[tokio::test]
    async fn enqueue_before_wait_is_not_lost() {
        let q = Arc::new(OutboundQueue::default());
        q.enqueue(entry(9));
        tokio::time::timeout(std::time::Duration::from_secs(1), q.notified())
            .await
            .expect("stored wake-up should resolve immediately");
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing() {
        let q = Arc::new(OutboundQueue::with_capacity(1));
        let mut tasks = Vec::new();
        for p in 0..8u8 {
            let q = q.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    q.enqueue(entry(p));
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(q.len(), 2000);
    }

    #[tokio::test]
    async fn wait_closed_returns_after_close() {
        let q = Arc::new(OutboundQueue::default());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_closed().await })
        };
        q.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(q.is_closed());
    }
}
