//! Offload Control Block
//!
//! State shared by every worker, engine and aging thread of one port:
//! flow table, handoff queue, NAT port pool, stats and the running flag
//! all loops poll. Built once at startup and handed out behind an `Arc`.

use crate::config::OffloadConfig;
use crate::error::SetupError;
use crate::flow::{FlowEntry, FlowTable};
use crate::hw::{FlowDevice, NicPort, PortId};
use crate::port_pool::PortPool;
use crate::stats::{DataplaneStats, LatencyRecorder};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct OffloadContext {
    pub config: OffloadConfig,
    pub table: FlowTable,
    /// Worker -> flow-rule engine handoff
    pub handoff: ArrayQueue<Arc<FlowEntry>>,
    pub port_pool: PortPool,
    pub stats: DataplaneStats,
    /// Per-pair rule install latency
    pub latency: LatencyRecorder,
    pub nic: Arc<dyn NicPort>,
    pub device: Arc<dyn FlowDevice>,
    running: AtomicBool,
}

impl OffloadContext {
    pub fn new(
        config: OffloadConfig,
        nic: Arc<dyn NicPort>,
        device: Arc<dyn FlowDevice>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        Ok(Self {
            table: FlowTable::new(config.flow_table_capacity),
            handoff: ArrayQueue::new(config.handoff_queue_capacity),
            port_pool: PortPool::new(config.port_pool_base, config.port_pool_size),
            stats: DataplaneStats::default(),
            latency: LatencyRecorder::new(config.latency_samples),
            nic,
            device,
            running: AtomicBool::new(false),
            config,
        })
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::AcqRel)
    }

    pub fn port_id(&self) -> PortId {
        self.config.port_id
    }
}
