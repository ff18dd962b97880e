//! Metric samplers.
//!
//! A sampler reads one category of host metrics and returns it as an opaque
//! payload. The node's healthbeat calls it on that metric's period and never
//! inspects the bytes.

use std::collections::HashMap;

use anyhow::Result;
use sysinfo::{Networks, System};

use fleetbeat_core::wire::Kind;

use crate::samples::{
    unix_ms, CpuSample, LoadSample, MemSample, NetInterface, NetSample, Sample,
};

pub trait Sampler: Send {
    /// Metric kind the payloads are tagged with.
    fn kind(&self) -> Kind;

    /// Take one sample. `Ok(None)` means the source is exhausted and the
    /// sampler will produce nothing further.
    fn sample(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Samplers for every metric this host can report.
pub fn host_samplers() -> Vec<Box<dyn Sampler>> {
    vec![
        Box::new(CpuSampler::new()),
        Box::new(MemSampler::new()),
        Box::new(NetSampler::new()),
        Box::new(LoadSampler),
    ]
}

pub struct CpuSampler {
    system: System,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for CpuSampler {
    fn kind(&self) -> Kind {
        Kind::CpuData
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>> {
        self.system.refresh_cpu_all();
        let sample = Sample::Cpu(CpuSample {
            timestamp_ms: unix_ms(),
            usage: self.system.global_cpu_usage(),
            per_core: self.system.cpus().iter().map(|c| c.cpu_usage()).collect(),
        });
        Ok(Some(sample.encode()?))
    }
}

pub struct MemSampler {
    system: System,
}

impl MemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for MemSampler {
    fn kind(&self) -> Kind {
        Kind::MemData
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>> {
        self.system.refresh_memory();
        let sample = Sample::Mem(MemSample {
            timestamp_ms: unix_ms(),
            total_bytes: self.system.total_memory(),
            used_bytes: self.system.used_memory(),
            available_bytes: self.system.available_memory(),
            swap_total_bytes: self.system.total_swap(),
            swap_used_bytes: self.system.used_swap(),
        });
        Ok(Some(sample.encode()?))
    }
}

/// Reports per-interface deltas. The first sample after start reports zeros.
pub struct NetSampler {
    networks: Networks,
    previous: HashMap<String, [u64; 4]>,
}

impl NetSampler {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            previous: HashMap::new(),
        }
    }
}

impl Default for NetSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for NetSampler {
    fn kind(&self) -> Kind {
        Kind::NetData
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>> {
        self.networks.refresh();
        let mut interfaces = Vec::new();
        for (name, data) in self.networks.iter() {
            let now = [
                data.total_received(),
                data.total_transmitted(),
                data.total_packets_received(),
                data.total_packets_transmitted(),
            ];
            let before = self.previous.insert(name.clone(), now).unwrap_or(now);
            interfaces.push(NetInterface {
                name: name.clone(),
                rx_bytes: now[0].saturating_sub(before[0]),
                tx_bytes: now[1].saturating_sub(before[1]),
                rx_packets: now[2].saturating_sub(before[2]),
                tx_packets: now[3].saturating_sub(before[3]),
            });
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        let sample = Sample::Net(NetSample {
            timestamp_ms: unix_ms(),
            interfaces,
        });
        Ok(Some(sample.encode()?))
    }
}

pub struct LoadSampler;

impl Sampler for LoadSampler {
    fn kind(&self) -> Kind {
        Kind::LoadData
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>> {
        let avg = System::load_average();
        let sample = Sample::Load(LoadSample {
            timestamp_ms: unix_ms(),
            one: avg.one,
            five: avg.five,
            fifteen: avg.fifteen,
            uptime_secs: System::uptime(),
        });
        Ok(Some(sample.encode()?))
    }
}
