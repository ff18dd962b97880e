//! Healthbeat: periodic sampling and flushing into the outbound queue.
//!
//! Each enabled metric runs its own producer task that appends payloads to a
//! per-metric buffer. A coarser flush tick swaps every buffer for an empty
//! one and wraps the removed payloads in envelopes on the outbound queue.
//! Producers never share a lock, and no lock is held across I/O.
//!
//! Producers run in generations: a new configuration snapshot stops the
//! current generation, hands the samplers back and starts the next one with
//! the new periods. Buffers outlive generations, so nothing collected before
//! a reconfiguration is lost.
//!
//! On the termination signal every producer stops, each buffer is flushed one
//! last time and the queue is closed so the writer knows production is over.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use fleetbeat_core::snapshot::ConfigSnapshot;
use fleetbeat_core::wire::{Envelope, Kind, COLLECTOR_ID};
use fleetbeat_services::{OutboundQueue, Sampler, ShutdownSignal};

/// Accumulated payloads of one metric.
#[derive(Debug)]
struct MetricBuffer {
    kind: Kind,
    samples: Mutex<Vec<Vec<u8>>>,
}

impl MetricBuffer {
    fn push(&self, payload: Vec<u8>) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
    }

    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Moves buffered payloads into the queue.
#[derive(Clone)]
struct Flusher {
    queue: Arc<OutboundQueue>,
    source: Arc<AtomicU32>,
}

impl Flusher {
    fn flush(&self, buffer: &MetricBuffer) -> usize {
        let taken = buffer.take();
        let source = self.source.load(Ordering::Acquire);
        let mut queued = 0;
        for payload in taken {
            let envelope = Envelope::new(source, COLLECTOR_ID, buffer.kind, payload);
            match self.queue.push(&envelope) {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!(kind = buffer.kind.name(), error = %e, "dropping unencodable sample"),
            }
        }
        queued
    }
}

/// Why a producer generation ended.
enum Stop {
    Reconfigure,
    Shutdown,
}

pub struct Healthbeat {
    flusher: Flusher,
    config: watch::Receiver<ConfigSnapshot>,
    flush_requests: Arc<Notify>,
    shutdown: ShutdownSignal,
    /// `None` once a sampler's source has failed or closed.
    samplers: Vec<Option<Box<dyn Sampler>>>,
    buffers: Vec<Arc<MetricBuffer>>,
}

impl Healthbeat {
    pub fn new(
        queue: Arc<OutboundQueue>,
        source: Arc<AtomicU32>,
        config: watch::Receiver<ConfigSnapshot>,
        flush_requests: Arc<Notify>,
        samplers: Vec<Box<dyn Sampler>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let buffers = samplers
            .iter()
            .map(|s| {
                Arc::new(MetricBuffer {
                    kind: s.kind(),
                    samples: Mutex::new(Vec::new()),
                })
            })
            .collect();
        Self {
            flusher: Flusher { queue, source },
            config,
            flush_requests,
            shutdown,
            samplers: samplers.into_iter().map(Some).collect(),
            buffers,
        }
    }

    pub async fn run(mut self) {
        loop {
            let snapshot = *self.config.borrow_and_update();
            let (stop_tx, stop_rx) = watch::channel(false);
            let producers = self.spawn_producers(&snapshot, &stop_rx);
            tracing::info!(
                producers = producers.len(),
                push_ms = snapshot.push_period_ms,
                "healthbeat generation started"
            );

            let period = snapshot.push_period();
            let mut flush = interval_at(Instant::now() + period, period);
            flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let stop = loop {
                tokio::select! {
                    _ = self.shutdown.recv() => break Stop::Shutdown,

                    changed = self.config.changed() => {
                        if changed.is_err() {
                            break Stop::Shutdown;
                        }
                        break Stop::Reconfigure;
                    }

                    _ = flush.tick() => self.flush_all("tick"),

                    _ = self.flush_requests.notified() => self.flush_all("request"),
                }
            };

            let _ = stop_tx.send(true);
            for (slot, handle) in producers {
                self.samplers[slot] = match handle.await {
                    Ok(sampler) => sampler,
                    Err(e) => {
                        tracing::error!(error = %e, "producer panicked");
                        None
                    }
                };
            }

            if let Stop::Shutdown = stop {
                self.flush_all("shutdown");
                self.flusher.queue.close();
                tracing::info!("healthbeat stopped");
                return;
            }
        }
    }

    fn spawn_producers(
        &mut self,
        snapshot: &ConfigSnapshot,
        stop: &watch::Receiver<bool>,
    ) -> Vec<(usize, JoinHandle<Option<Box<dyn Sampler>>>)> {
        let mut producers = Vec::new();
        for (slot, sampler) in self.samplers.iter_mut().enumerate() {
            let Some(kind) = sampler.as_ref().map(|s| s.kind()) else {
                continue;
            };
            let Some(period) = snapshot.period_for(kind) else {
                tracing::debug!(kind = kind.name(), "metric disabled");
                continue;
            };
            let Some(sampler) = sampler.take() else {
                continue;
            };
            let handle = tokio::spawn(produce(
                sampler,
                self.buffers[slot].clone(),
                self.flusher.clone(),
                period,
                stop.clone(),
            ));
            producers.push((slot, handle));
        }
        producers
    }

    fn flush_all(&self, reason: &'static str) {
        let mut queued = 0;
        for buffer in &self.buffers {
            queued += self.flusher.flush(buffer);
        }
        if queued > 0 {
            tracing::debug!(reason, queued, backlog = self.flusher.queue.len(), "flushed samples");
        }
    }
}

/// One metric's producer. Returns the sampler when stopped, or `None` after
/// its source failed or closed (having flushed its own buffer first).
async fn produce(
    mut sampler: Box<dyn Sampler>,
    buffer: Arc<MetricBuffer>,
    flusher: Flusher,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> Option<Box<dyn Sampler>> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.changed() => return Some(sampler),

            _ = ticker.tick() => match sampler.sample() {
                Ok(Some(payload)) => buffer.push(payload),
                Ok(None) => {
                    let flushed = flusher.flush(&buffer);
                    tracing::info!(kind = buffer.kind.name(), flushed, "sampler closed");
                    return None;
                }
                Err(e) => {
                    let flushed = flusher.flush(&buffer);
                    tracing::warn!(kind = buffer.kind.name(), flushed, error = %e, "sampler failed");
                    return None;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbeat_services::Shutdown;
    use std::collections::HashSet;

    /// Emits an increasing counter as a 4-byte payload. Fails or closes after
    /// `limit` samples when asked to.
    struct Counter {
        kind: Kind,
        next: Arc<AtomicU32>,
        limit: Option<(u32, bool)>,
    }

    impl Sampler for Counter {
        fn kind(&self) -> Kind {
            self.kind
        }

        fn sample(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            let n = self.next.load(Ordering::SeqCst);
            if let Some((limit, fail)) = self.limit {
                if n >= limit {
                    if fail {
                        anyhow::bail!("source gone");
                    }
                    return Ok(None);
                }
            }
            self.next.store(n + 1, Ordering::SeqCst);
            Ok(Some(n.to_le_bytes().to_vec()))
        }
    }

    fn counter(kind: Kind, limit: Option<(u32, bool)>) -> (Box<dyn Sampler>, Arc<AtomicU32>) {
        let next = Arc::new(AtomicU32::new(0));
        (
            Box::new(Counter {
                kind,
                next: next.clone(),
                limit,
            }),
            next,
        )
    }

    fn snapshot(cpu_ms: u32, mem_ms: u32, push_ms: u32) -> ConfigSnapshot {
        ConfigSnapshot {
            cpu_period_ms: cpu_ms,
            mem_period_ms: mem_ms,
            net_period_ms: 0,
            load_period_ms: 0,
            push_period_ms: push_ms,
            ..ConfigSnapshot::default()
        }
    }

    struct Rig {
        queue: Arc<OutboundQueue>,
        shutdown: Shutdown,
        config: watch::Sender<ConfigSnapshot>,
        flush: Arc<Notify>,
        task: JoinHandle<()>,
    }

    fn start(snap: ConfigSnapshot, samplers: Vec<Box<dyn Sampler>>) -> Rig {
        let queue = Arc::new(OutboundQueue::default());
        let shutdown = Shutdown::new();
        let (config, config_rx) = watch::channel(snap);
        let flush = Arc::new(Notify::new());
        let hb = Healthbeat::new(
            queue.clone(),
            Arc::new(AtomicU32::new(0x42)),
            config_rx,
            flush.clone(),
            samplers,
            shutdown.subscribe(),
        );
        let task = tokio::spawn(hb.run());
        Rig {
            queue,
            shutdown,
            config,
            flush,
            task,
        }
    }

    /// Counter values queued for `kind`, in queue order.
    fn queued(queue: &OutboundQueue, kind: Kind) -> Vec<u32> {
        queue
            .snapshot()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| {
                let env = Envelope::decode(&e.bytes).unwrap();
                assert_eq!(env.id.source(), 0x42);
                assert_eq!(env.destination, COLLECTOR_ID);
                u32::from_le_bytes(env.payload[..4].try_into().unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn shutdown_flushes_everything_exactly_once() {
        let (cpu, cpu_count) = counter(Kind::CpuData, None);
        let (mem, mem_count) = counter(Kind::MemData, None);
        // Push period far beyond the test: only the final flush moves samples.
        let rig = start(snapshot(5, 7, 3_600_000), vec![cpu, mem]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rig.queue.is_empty());

        rig.shutdown.trigger();
        rig.task.await.unwrap();
        assert!(rig.queue.is_closed());

        let cpu_seen = queued(&rig.queue, Kind::CpuData);
        let mem_seen = queued(&rig.queue, Kind::MemData);
        assert!(!cpu_seen.is_empty());
        assert_eq!(cpu_seen, (0..cpu_count.load(Ordering::SeqCst)).collect::<Vec<_>>());
        assert_eq!(mem_seen, (0..mem_count.load(Ordering::SeqCst)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn periodic_flush_keeps_per_metric_order() {
        let (cpu, _) = counter(Kind::CpuData, None);
        let rig = start(snapshot(3, 0, 20), vec![cpu]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rig.queue.is_empty(), "tick flush should have run");
        rig.shutdown.trigger();
        rig.task.await.unwrap();

        let seen = queued(&rig.queue, Kind::CpuData);
        let unique: HashSet<u32> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "no duplicates");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "collection order kept");
    }

    #[tokio::test]
    async fn disabled_metric_never_samples() {
        let (cpu, cpu_count) = counter(Kind::CpuData, None);
        let (mem, mem_count) = counter(Kind::MemData, None);
        let rig = start(snapshot(5, 0, 3_600_000), vec![cpu, mem]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.shutdown.trigger();
        rig.task.await.unwrap();
        assert!(cpu_count.load(Ordering::SeqCst) > 0);
        assert_eq!(mem_count.load(Ordering::SeqCst), 0);
        assert!(queued(&rig.queue, Kind::MemData).is_empty());
    }

    #[tokio::test]
    async fn failing_source_flushes_and_others_continue() {
        let (cpu, _) = counter(Kind::CpuData, Some((3, true)));
        let (mem, mem_count) = counter(Kind::MemData, None);
        let rig = start(snapshot(2, 5, 3_600_000), vec![cpu, mem]);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The failed producer flushed its own buffer; nothing else has.
        assert_eq!(queued(&rig.queue, Kind::CpuData), vec![0, 1, 2]);
        assert!(queued(&rig.queue, Kind::MemData).is_empty());
        let mem_before = mem_count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(mem_count.load(Ordering::SeqCst) > mem_before);

        rig.shutdown.trigger();
        rig.task.await.unwrap();
        assert_eq!(queued(&rig.queue, Kind::CpuData), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn closed_source_stops_quietly() {
        let (cpu, cpu_count) = counter(Kind::CpuData, Some((2, false)));
        let rig = start(snapshot(2, 0, 3_600_000), vec![cpu]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cpu_count.load(Ordering::SeqCst), 2);
        rig.shutdown.trigger();
        rig.task.await.unwrap();
        assert_eq!(queued(&rig.queue, Kind::CpuData), vec![0, 1]);
    }

    #[tokio::test]
    async fn reconfiguration_restarts_without_loss() {
        let (cpu, cpu_count) = counter(Kind::CpuData, None);
        let rig = start(snapshot(3, 0, 3_600_000), vec![cpu]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Disable cpu. Samples already buffered must survive.
        rig.config.send_replace(snapshot(0, 0, 3_600_000));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_disable = cpu_count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cpu_count.load(Ordering::SeqCst), after_disable);

        rig.shutdown.trigger();
        rig.task.await.unwrap();
        assert_eq!(queued(&rig.queue, Kind::CpuData), (0..after_disable).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn flush_request_moves_samples_now() {
        let (cpu, _) = counter(Kind::CpuData, None);
        let rig = start(snapshot(2, 0, 3_600_000), vec![cpu]);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rig.queue.is_empty());
        rig.flush.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rig.queue.is_empty());
        rig.shutdown.trigger();
        rig.task.await.unwrap();
    }
}
