//! Metrics sinks: where the collector puts decoded samples.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;

use crate::samples::Sample;

/// Samples from one node, all decoded from a single read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBatch {
    pub node_id: u32,
    pub hostname: String,
    pub received_ms: u64,
    pub samples: Vec<Sample>,
}

/// Accepts batches of decoded samples for storage.
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, batch: &SampleBatch) -> Result<()>;
}

/// Logs one line per sample.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn accept(&self, batch: &SampleBatch) -> Result<()> {
        for sample in &batch.samples {
            tracing::info!(
                node = format_args!("{:08x}", batch.node_id),
                host = %batch.hostname,
                metric = sample.kind().name(),
                sample = %serde_json::to_string(sample)?,
                "sample"
            );
        }
        Ok(())
    }
}

/// Keeps the most recent batches per node for the status API.
#[derive(Debug)]
pub struct MemorySink {
    retain: usize,
    batches: DashMap<u32, VecDeque<SampleBatch>>,
}

impl MemorySink {
    pub fn new(retain: usize) -> Self {
        Self {
            retain: retain.max(1),
            batches: DashMap::new(),
        }
    }

    /// Retained batches for `node_id`, oldest first.
    pub fn recent(&self, node_id: u32) -> Vec<SampleBatch> {
        self.batches
            .get(&node_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest sample of every metric seen from `node_id`.
    pub fn latest(&self, node_id: u32) -> Vec<Sample> {
        let Some(batches) = self.batches.get(&node_id) else {
            return Vec::new();
        };
        let mut latest: Vec<Sample> = Vec::new();
        for sample in batches.iter().rev().flat_map(|b| b.samples.iter().rev()) {
            if !latest.iter().any(|s| s.kind() == sample.kind()) {
                latest.push(sample.clone());
            }
        }
        latest.sort_by_key(|s| u8::from(s.kind()));
        latest
    }

    pub fn sample_count(&self) -> usize {
        self.batches
            .iter()
            .map(|e| e.value().iter().map(|b| b.samples.len()).sum::<usize>())
            .sum()
    }
}

impl MetricsSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn accept(&self, batch: &SampleBatch) -> Result<()> {
        let mut entry = self.batches.entry(batch.node_id).or_default();
        entry.push_back(batch.clone());
        while entry.len() > self.retain {
            entry.pop_front();
        }
        Ok(())
    }
}

/// Appends one JSON line per sample to `<dir>/<node id>.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    node: String,
    host: &'a str,
    received_ms: u64,
    #[serde(flatten)]
    sample: &'a Sample,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn accept(&self, batch: &SampleBatch) -> Result<()> {
        let node = format!("{:08x}", batch.node_id);
        let mut out = Vec::new();
        for sample in &batch.samples {
            let record = JsonlRecord {
                node: node.clone(),
                host: &batch.hostname,
                received_ms: batch.received_ms,
                sample,
            };
            serde_json::to_writer(&mut out, &record)?;
            out.push(b'\n');
        }
        let path = self.dir.join(format!("{node}.jsonl"));
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&out)
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }
}

/// Hands every batch to each inner sink. A failing sink does not stop the
/// others; the first error is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn accept(&self, batch: &SampleBatch) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.accept(batch) {
                tracing::warn!(sink = sink.name(), error = %e, "sink rejected batch");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
