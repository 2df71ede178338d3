//! Dataplane Statistics
//!
//! Lock-free counters shared by every worker and control thread. The fast
//! path touches only the atomics; control-plane events are also reported
//! through the `metrics` facade for whatever exporter the process installs.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct DataplaneStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub dropped: AtomicU64,
    pub classify_failures: AtomicU64,
    pub flow_hits: AtomicU64,
    pub flow_misses: AtomicU64,
    pub flows_created: AtomicU64,
    pub insert_races: AtomicU64,
    pub offload_enqueued: AtomicU64,
    pub handoff_full: AtomicU64,
    pub offload_installed: AtomicU64,
    pub offload_failed: AtomicU64,
    pub flows_evicted: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub table_full: AtomicU64,
}

impl DataplaneStats {
    #[inline(always)]
    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx(&self, packets: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_drop(&self, packets: u64) {
        self.dropped.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_installed(&self) {
        Self::inc(&self.offload_installed);
        metrics::counter!("smto_offload_installed_total").increment(1);
    }

    pub fn record_install_failed(&self) {
        Self::inc(&self.offload_failed);
        metrics::counter!("smto_offload_failed_total").increment(1);
    }

    pub fn record_evicted(&self, flows: u64) {
        self.flows_evicted.fetch_add(flows, Ordering::Relaxed);
        metrics::counter!("smto_flows_evicted_total").increment(flows);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            rx_packets: load(&self.rx_packets),
            tx_packets: load(&self.tx_packets),
            rx_bytes: load(&self.rx_bytes),
            dropped: load(&self.dropped),
            classify_failures: load(&self.classify_failures),
            flow_hits: load(&self.flow_hits),
            flow_misses: load(&self.flow_misses),
            flows_created: load(&self.flows_created),
            insert_races: load(&self.insert_races),
            offload_enqueued: load(&self.offload_enqueued),
            handoff_full: load(&self.handoff_full),
            offload_installed: load(&self.offload_installed),
            offload_failed: load(&self.offload_failed),
            flows_evicted: load(&self.flows_evicted),
            pool_exhausted: load(&self.pool_exhausted),
            table_full: load(&self.table_full),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub dropped: u64,
    pub classify_failures: u64,
    pub flow_hits: u64,
    pub flow_misses: u64,
    pub flows_created: u64,
    pub insert_races: u64,
    pub offload_enqueued: u64,
    pub handoff_full: u64,
    pub offload_installed: u64,
    pub offload_failed: u64,
    pub flows_evicted: u64,
    pub pool_exhausted: u64,
    pub table_full: u64,
}

impl StatsSnapshot {
    pub fn flow_hit_rate(&self) -> f64 {
        let total = self.flow_hits + self.flow_misses;
        if total == 0 {
            return 0.0;
        }
        self.flow_hits as f64 / total as f64
    }
}

/// Bounded sample buffer; samples past the limit are discarded
pub struct LatencyRecorder {
    samples: Mutex<Vec<u64>>,
    limit: usize,
}

impl LatencyRecorder {
    pub fn new(limit: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            limit,
        }
    }

    pub fn record(&self, micros: u64) {
        metrics::histogram!("smto_install_latency_us").record(micros as f64);
        let mut samples = self.samples.lock();
        if samples.len() < self.limit {
            samples.push(micros);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> Option<LatencySummary> {
        LatencySummary::from_samples(&self.samples.lock())
    }
}

/// Order statistics over latency samples, in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
    pub avg: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        // nearest-rank percentile
        let pct = |p: usize| sorted[((n * p).div_ceil(100)).saturating_sub(1)];
        let sum: u128 = sorted.iter().map(|&v| v as u128).sum();
        Some(Self {
            count: n,
            min: sorted[0],
            p50: pct(50),
            p90: pct(90),
            p99: pct(99),
            max: sorted[n - 1],
            avg: sum as f64 / n as f64,
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} min={}us p50={}us p90={}us p99={}us max={}us avg={:.2}us",
            self.count, self.min, self.p50, self.p90, self.p99, self.max, self.avg
        )
    }
}
