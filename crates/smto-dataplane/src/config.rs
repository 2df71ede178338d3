//! Offload Configuration

use crate::error::SetupError;
use crate::hw::PortId;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Dataplane configuration; missing JSON fields take their defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Port the workers poll
    pub port_id: PortId,
    /// Receive queues, one worker each; the hairpin queue index follows them
    pub rx_queues: u16,
    /// Flow-rule engine threads
    pub engine_threads: usize,
    /// Packets per receive burst
    pub burst_size: usize,
    /// Entries drained from the handoff queue per engine iteration
    pub engine_batch_size: usize,
    /// Packet count at which a flow is offloaded
    pub offload_threshold: u64,
    /// Hardware idle timeout of offloaded flows
    pub flow_idle_timeout_secs: u32,
    pub flow_table_capacity: usize,
    pub handoff_queue_capacity: usize,
    /// First NAT port
    pub port_pool_base: u16,
    pub port_pool_size: usize,
    /// Destination address new flows are rewritten to
    pub nat_addr: Ipv4Addr,
    /// Aged contexts fetched per device call
    pub aged_batch_size: usize,
    /// Delay between the aged event and the eviction run
    pub aging_defer_ms: u64,
    /// Return NAT ports to the pool when their flow is evicted
    pub release_ports_on_eviction: bool,
    /// Install-latency samples kept for the shutdown summary
    pub latency_samples: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            port_id: 0,
            rx_queues: 1,
            engine_threads: 1,
            burst_size: crate::BURST_SIZE,
            engine_batch_size: crate::BURST_SIZE,
            offload_threshold: crate::DEFAULT_OFFLOAD_THRESHOLD,
            flow_idle_timeout_secs: 10,
            flow_table_capacity: 32 * 1024 * 1024,
            handoff_queue_capacity: 16 * 1024,
            port_pool_base: 1024,
            port_pool_size: 64_512,
            nat_addr: Ipv4Addr::new(5, 5, 5, 5),
            aged_batch_size: 8,
            aging_defer_ms: 1,
            release_ports_on_eviction: true,
            latency_samples: 1 << 20,
        }
    }
}

impl OffloadConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SetupError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let nonzero = [
            ("rx_queues", self.rx_queues as usize),
            ("engine_threads", self.engine_threads),
            ("burst_size", self.burst_size),
            ("engine_batch_size", self.engine_batch_size),
            ("offload_threshold", self.offload_threshold as usize),
            ("flow_table_capacity", self.flow_table_capacity),
            ("handoff_queue_capacity", self.handoff_queue_capacity),
            ("port_pool_size", self.port_pool_size),
            ("aged_batch_size", self.aged_batch_size),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SetupError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.port_pool_base as usize + self.port_pool_size > u16::MAX as usize + 1 {
            return Err(SetupError::InvalidConfig(format!(
                "port pool {}+{} exceeds the port range",
                self.port_pool_base, self.port_pool_size
            )));
        }
        if self.rx_queues == u16::MAX {
            return Err(SetupError::InvalidConfig(
                "rx_queues leaves no index for the hairpin queue".into(),
            ));
        }
        Ok(())
    }

    /// Hairpin queue index: the first queue after the receive queues
    pub fn hairpin_queue(&self) -> u16 {
        self.rx_queues
    }

    /// NAT address in host byte order
    pub fn nat_addr_u32(&self) -> u32 {
        u32::from(self.nat_addr)
    }
}
