//! Aging and Eviction
//!
//! The device raises an aged event from its own event context. The handler
//! only posts a wakeup onto a one-slot channel (no allocation, no blocking;
//! a wakeup already pending absorbs new ones). The deferred half runs on
//! its own thread: after a short delay it drains the device's aged list in
//! batches, merges the final hardware counters, destroys the rules and
//! removes both directions of each flow from the table.

use crate::context::OffloadContext;
use crate::error::AgingError;
use crate::flow::{FlowEntry, OffloadStatus};
use crate::hw::{AgedCallback, PortId, RuleContext};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often the deferred half rechecks the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Top half of the aged event
#[derive(Clone)]
pub struct AgedEventHandler {
    tx: Sender<PortId>,
}

impl AgedEventHandler {
    /// Handler plus the receiving end for the deferred half
    pub fn channel() -> (Self, Receiver<PortId>) {
        let (tx, rx) = channel::bounded(1);
        (Self { tx }, rx)
    }

    /// Schedule an eviction run. `Ok(false)` when one is already pending.
    pub fn notify(&self, port: PortId) -> Result<bool, AgingError> {
        match self.tx.try_send(port) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(AgingError::SchedulerClosed),
        }
    }

    /// Callback to register with the device
    pub fn into_callback(self) -> AgedCallback {
        Arc::new(move |port| {
            if let Err(e) = self.notify(port) {
                error!(port, error = %e, "aged event dropped");
            }
        })
    }
}

/// Per-run outcome
#[derive(Debug, Default)]
pub struct AgingReport {
    /// Flow pairs removed from the table
    pub evicted: usize,
    /// Per-flow failures; none of them stopped the run
    pub errors: Vec<AgingError>,
}

/// Deferred half; returns once the running flag clears or the handler is gone
pub fn aging_loop(ctx: &OffloadContext, events: Receiver<PortId>) {
    let defer = Duration::from_millis(ctx.config.aging_defer_ms);
    info!(port = ctx.port_id(), "aging started");
    while ctx.is_running() {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(port) => {
                std::thread::sleep(defer);
                if !ctx.is_running() {
                    break;
                }
                let report = evict_aged(ctx, port);
                if !report.errors.is_empty() {
                    warn!(
                        port,
                        evicted = report.evicted,
                        errors = report.errors.len(),
                        "aging run finished with errors"
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(port = ctx.port_id(), "aging stopped");
}

/// Drain the aged list of `port`, `aged_batch_size` contexts at a time
pub fn evict_aged(ctx: &OffloadContext, port: PortId) -> AgingReport {
    let mut report = AgingReport::default();
    let batch = ctx.config.aged_batch_size;
    loop {
        let contexts = match ctx.device.get_aged_rules(port, batch) {
            Ok(c) => c,
            Err(e) => {
                error!(port, error = %e, "failed to get timeout flows");
                report.errors.push(AgingError::AgedQuery(e));
                break;
            }
        };
        let n = contexts.len();
        for rc in contexts {
            evict_one(ctx, port, rc, &mut report);
        }
        if n < batch {
            break;
        }
    }
    report
}

fn evict_one(ctx: &OffloadContext, port: PortId, rc: RuleContext, report: &mut AgingReport) {
    let tuple = rc.0;
    // entries that were never offloaded belong to a newer flow on the same tuple
    let Some(entry) = ctx
        .table
        .lookup(&tuple)
        .filter(|e| e.status() == OffloadStatus::Offloaded)
    else {
        error!(port, flow = %tuple, "cannot resolve timeout flow");
        report.errors.push(AgingError::MissingContext(tuple));
        return;
    };
    let peer = ctx.table.peer_of(&entry);

    retire(ctx, port, &entry, report);
    let mut removed = ctx.table.remove_exact(&entry) as u64;
    if let Some(peer) = &peer {
        retire(ctx, port, peer, report);
        removed += ctx.table.remove_exact(peer) as u64;
    }

    if ctx.config.release_ports_on_eviction {
        let owner = std::iter::once(&entry).chain(peer.as_ref());
        for nat_port in owner.filter_map(|e| e.nat_port()) {
            ctx.port_pool.release(nat_port);
        }
    }

    ctx.stats.record_evicted(removed);
    report.evicted += 1;
}

/// Merge final counters and destroy the rule of one direction
fn retire(ctx: &OffloadContext, port: PortId, entry: &FlowEntry, report: &mut AgingReport) {
    let tuple = *entry.tuple();
    let Some(rule) = entry.take_rule() else {
        return;
    };

    let slow_path = entry.packets();
    match ctx.device.query_counters(port, rule) {
        Ok(c) => {
            info!(
                port,
                flow = %tuple,
                total = slow_path + c.hits,
                fast_path = c.hits,
                slow_path,
                "flow timeout"
            );
            entry.merge_counters(c.hits, c.bytes);
        }
        Err(e) => {
            error!(port, flow = %tuple, error = %e, "cannot query the counter of a timeout flow");
            report.errors.push(AgingError::Query { tuple, source: e });
        }
    }

    match ctx.device.destroy_rule(port, rule) {
        Ok(()) => info!(port, flow = %tuple, "flow deleted on timeout"),
        Err(e) => {
            error!(port, flow = %tuple, error = %e, "cannot remove offload rule from nic");
            report.errors.push(AgingError::Destroy { tuple, source: e });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::context::tests::{sim_context, small_config};
    use crate::engine::offload_pair;
    use crate::hw::{FlowDevice, HwCounters};
    use crate::key::{FlowTuple, IPPROTO_UDP};

    fn tuple(n: u16) -> FlowTuple {
        FlowTuple::new(IPPROTO_UDP, 0x0A000001, 0x0A000002, 5000 + n, 53)
    }

    /// Pair with `packets` software packets on the forward side, offloaded
    fn offloaded_pair(
        ctx: &OffloadContext,
        t: FlowTuple,
        packets: u64,
    ) -> (Arc<FlowEntry>, Arc<FlowEntry>) {
        let port = ctx.port_pool.acquire().unwrap();
        let (fwd, peer) = FlowEntry::pair(t, Some((ctx.config.nat_addr_u32(), port)), 100);
        let (fwd, peer) = ctx.table.insert_pair(fwd, peer).unwrap();
        for _ in 1..packets {
            fwd.record_packet(100);
        }
        assert!(fwd.try_begin_offload());
        offload_pair(ctx, &fwd).unwrap();
        (fwd, peer)
    }

    #[test]
    fn test_eviction_merges_counters() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = offloaded_pair(&ctx, tuple(1), 5);
        assert_eq!(fwd.packets(), 5);
        dev.set_counters(fwd.tuple(), HwCounters { hits: 995, bytes: 99_500 });
        let available = ctx.port_pool.available();

        dev.age_flow(fwd.tuple());
        let report = evict_aged(&ctx, 0);

        assert_eq!(report.evicted, 1);
        assert!(report.errors.is_empty());
        assert_eq!(fwd.packets(), 1000);
        assert_eq!(fwd.bytes(), 100_000);
        assert!(ctx.table.lookup(fwd.tuple()).is_none());
        assert!(ctx.table.lookup(peer.tuple()).is_none());
        assert!(ctx.table.is_empty());
        assert_eq!(dev.rule_count(), 0);
        assert_eq!(ctx.port_pool.available(), available + 1);
        assert_eq!(ctx.stats.snapshot().flows_evicted, 2);
    }

    #[test]
    fn test_ports_kept_when_release_disabled() {
        let (ctx, _, dev) = sim_context(OffloadConfig {
            release_ports_on_eviction: false,
            ..small_config()
        });
        let (fwd, _) = offloaded_pair(&ctx, tuple(1), 5);
        let available = ctx.port_pool.available();
        dev.age_flow(fwd.tuple());
        evict_aged(&ctx, 0);
        assert_eq!(ctx.port_pool.available(), available);
    }

    #[test]
    fn test_bad_flow_does_not_stop_batch() {
        let (ctx, _, dev) = sim_context(small_config());
        let pairs: Vec<_> = (0..3).map(|n| offloaded_pair(&ctx, tuple(n), 5)).collect();
        dev.fail_query_for(*pairs[0].0.tuple());
        dev.fail_destroy_for(*pairs[1].0.tuple());
        for (fwd, _) in &pairs {
            dev.age_flow(fwd.tuple());
        }

        let report = evict_aged(&ctx, 0);
        assert_eq!(report.evicted, 3);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, AgingError::Query { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, AgingError::Destroy { .. })));
        // entries are removed even when the destroy failed
        assert!(ctx.table.is_empty());
    }

    #[test]
    fn test_peer_report_after_pair_evicted() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = offloaded_pair(&ctx, tuple(1), 5);
        dev.age_flow(fwd.tuple());
        dev.age_flow(peer.tuple());

        let report = evict_aged(&ctx, 0);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.errors, vec![AgingError::MissingContext(*peer.tuple())]);
    }

    #[test]
    fn test_drains_in_batches() {
        let (ctx, _, dev) = sim_context(OffloadConfig {
            aged_batch_size: 2,
            ..small_config()
        });
        for n in 0..5 {
            let (fwd, _) = offloaded_pair(&ctx, tuple(n), 5);
            dev.age_flow(fwd.tuple());
        }
        let report = evict_aged(&ctx, 0);
        assert_eq!(report.evicted, 5);
        assert!(ctx.table.is_empty());
    }

    #[test]
    fn test_handler_coalesces() {
        let (handler, rx) = AgedEventHandler::channel();
        assert!(handler.notify(0).unwrap());
        assert!(!handler.notify(0).unwrap());
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert!(handler.notify(0).unwrap());
        drop(rx);
        assert_eq!(handler.notify(0).unwrap_err(), AgingError::SchedulerClosed);

        // the device may still raise events after the deferred half is gone
        let callback = handler.into_callback();
        callback(0);
        callback(0);
    }

    #[test]
    fn test_aging_loop_runs_on_event() {
        let (ctx, _, dev) = sim_context(small_config());
        let (handler, rx) = AgedEventHandler::channel();
        dev.register_aged_callback(0, handler.into_callback()).unwrap();
        let (fwd, _) = offloaded_pair(&ctx, tuple(1), 5);
        ctx.set_running(true);

        let worker_ctx = ctx.clone();
        let thread = std::thread::spawn(move || aging_loop(&worker_ctx, rx));
        dev.age_flow(fwd.tuple());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ctx.table.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.set_running(false);
        thread.join().unwrap();
        assert!(ctx.table.is_empty());
    }

    #[test]
    fn test_aged_query_failure_reported() {
        let (ctx, _, _) = sim_context(small_config());
        // wrong port: the device refuses the query
        let report = evict_aged(&ctx, 9);
        assert!(matches!(report.errors[..], [AgingError::AgedQuery(_)]));
    }
}
