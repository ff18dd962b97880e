//! Telemetry sample payloads.
//!
//! The session pipeline treats these as opaque bytes; only samplers (which
//! encode) and the collector's dispatcher (which decodes) look inside. The
//! encoding is JSON so sinks can store samples without re-encoding them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use fleetbeat_core::wire::Kind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub timestamp_ms: u64,
    /// Whole-machine usage, percent.
    pub usage: f32,
    pub per_core: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemSample {
    pub timestamp_ms: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

/// Per-interface counters, as deltas since the previous sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSample {
    pub timestamp_ms: u64,
    pub interfaces: Vec<NetInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub timestamp_ms: u64,
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
    pub uptime_secs: u64,
}

/// A decoded sample of any metric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Sample {
    Cpu(CpuSample),
    Mem(MemSample),
    Net(NetSample),
    Load(LoadSample),
}

impl Sample {
    pub fn kind(&self) -> Kind {
        match self {
            Sample::Cpu(_) => Kind::CpuData,
            Sample::Mem(_) => Kind::MemData,
            Sample::Net(_) => Kind::NetData,
            Sample::Load(_) => Kind::LoadData,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Sample::Cpu(s) => s.timestamp_ms,
            Sample::Mem(s) => s.timestamp_ms,
            Sample::Net(s) => s.timestamp_ms,
            Sample::Load(s) => s.timestamp_ms,
        }
    }

    /// Payload bytes for an envelope of [`Self::kind`].
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Sample::Cpu(s) => serde_json::to_vec(s),
            Sample::Mem(s) => serde_json::to_vec(s),
            Sample::Net(s) => serde_json::to_vec(s),
            Sample::Load(s) => serde_json::to_vec(s),
        }
    }

    /// Decode the payload of an envelope of `kind`.
    pub fn decode(kind: Kind, payload: &[u8]) -> Result<Self, SampleError> {
        let sample = match kind {
            Kind::CpuData => Sample::Cpu(serde_json::from_slice(payload)?),
            Kind::MemData => Sample::Mem(serde_json::from_slice(payload)?),
            Kind::NetData => Sample::Net(serde_json::from_slice(payload)?),
            Kind::LoadData => Sample::Load(serde_json::from_slice(payload)?),
            other => return Err(SampleError::NotAMetric(other)),
        };
        Ok(sample)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("kind {0:?} does not carry samples")]
    NotAMetric(Kind),
    #[error("malformed sample: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
