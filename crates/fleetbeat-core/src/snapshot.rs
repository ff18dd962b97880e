//! Behavioral configuration pushed from the collector to a node.
//!
//! A snapshot is always replaced whole. Nodes never merge fields from two
//! snapshots.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::{Kind, WireError};

/// Collection, push and liveness periods for one node.
///
/// A zero collection period disables that metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub cpu_period_ms: u32,
    pub mem_period_ms: u32,
    pub net_period_ms: u32,
    pub load_period_ms: u32,
    /// How often accumulated samples move into the outbound queue.
    pub push_period_ms: u32,
    /// Write-idle time after which the writer sends a ping.
    pub ping_period_ms: u32,
    /// Silence on the socket longer than this is a transport failure.
    pub read_timeout_ms: u32,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            cpu_period_ms: 1_000,
            mem_period_ms: 5_000,
            net_period_ms: 5_000,
            load_period_ms: 10_000,
            push_period_ms: 10_000,
            ping_period_ms: 15_000,
            read_timeout_ms: 60_000,
        }
    }
}

/// On-wire layout of a snapshot (ClientConfig payload).
///
/// Wire size: 32 bytes. Eight little-endian millisecond values; the last is
/// reserved and must be zero.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SnapshotWire {
    pub cpu_period_ms: U32<LittleEndian>,
    pub mem_period_ms: U32<LittleEndian>,
    pub net_period_ms: U32<LittleEndian>,
    pub load_period_ms: U32<LittleEndian>,
    pub push_period_ms: U32<LittleEndian>,
    pub ping_period_ms: U32<LittleEndian>,
    pub read_timeout_ms: U32<LittleEndian>,
    pub reserved: U32<LittleEndian>,
}

assert_eq_size!(SnapshotWire, [u8; 32]);

impl ConfigSnapshot {
    /// Collection period for a metric kind. `None` when the metric is
    /// disabled or `kind` is not a metric.
    pub fn period_for(&self, kind: Kind) -> Option<Duration> {
        let ms = match kind {
            Kind::CpuData => self.cpu_period_ms,
            Kind::MemData => self.mem_period_ms,
            Kind::NetData => self.net_period_ms,
            Kind::LoadData => self.load_period_ms,
            _ => 0,
        };
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Push period, never shorter than 10ms.
    pub fn push_period(&self) -> Duration {
        Duration::from_millis(self.push_period_ms.max(10) as u64)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms.max(10) as u64)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(10) as u64)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        SnapshotWire {
            cpu_period_ms: U32::new(self.cpu_period_ms),
            mem_period_ms: U32::new(self.mem_period_ms),
            net_period_ms: U32::new(self.net_period_ms),
            load_period_ms: U32::new(self.load_period_ms),
            push_period_ms: U32::new(self.push_period_ms),
            ping_period_ms: U32::new(self.ping_period_ms),
            read_timeout_ms: U32::new(self.read_timeout_ms),
            reserved: U32::new(0),
        }
        .as_bytes()
        .to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let wire = SnapshotWire::read_from_prefix(buf).ok_or(WireError::Truncated {
            needed: std::mem::size_of::<SnapshotWire>(),
            got: buf.len(),
        })?;
        Ok(Self {
            cpu_period_ms: wire.cpu_period_ms.get(),
            mem_period_ms: wire.mem_period_ms.get(),
            net_period_ms: wire.net_period_ms.get(),
            load_period_ms: wire.load_period_ms.get(),
            push_period_ms: wire.push_period_ms.get(),
            ping_period_ms: wire.ping_period_ms.get(),
            read_timeout_ms: wire.read_timeout_ms.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_bytes_round_trip() {
        let snap = ConfigSnapshot {
            cpu_period_ms: 250,
            mem_period_ms: 0,
            net_period_ms: 3,
            load_period_ms: 4_000_000,
            push_period_ms: 1000,
            ping_period_ms: 2000,
            read_timeout_ms: 9000,
        };
        let bytes = snap.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(ConfigSnapshot::from_bytes(&bytes).unwrap(), snap);
    }

    #[test]
    fn zero_period_disables_metric() {
        let snap = ConfigSnapshot {
            mem_period_ms: 0,
            ..ConfigSnapshot::default()
        };
        assert_eq!(snap.period_for(Kind::MemData), None);
        assert_eq!(snap.period_for(Kind::CpuData), Some(Duration::from_secs(1)));
        assert_eq!(snap.period_for(Kind::Command), None);
    }

    #[test]
    fn short_snapshot_is_rejected() {
        assert!(ConfigSnapshot::from_bytes(&[0u8; 12]).is_err());
    }
}
