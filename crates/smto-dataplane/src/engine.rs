//! Flow-Rule Engine
//!
//! Control-plane threads draining the handoff queue. For each queued flow
//! the engine installs a hardware rule for both directions before marking
//! either `OFFLOADED`. A failure on either side leaves both entries
//! `NOT_OFFLOADED`, so the next packet past the threshold retries.

use crate::context::OffloadContext;
use crate::error::{Direction, HwError, OffloadError, SetupError};
use crate::flow::{FlowEntry, OffloadStatus};
use crate::hw::{self, RuleHandle};
use crate::worker::WorkerParams;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of handling one queued flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadOutcome {
    /// Rules installed for both directions
    Installed,
    /// Nothing to do: stale queue item or pair handled elsewhere
    Skipped,
}

/// Engine loop; returns once the running flag clears
pub fn create_flow_loop(ctx: &OffloadContext, params: WorkerParams) {
    info!(port = params.port_id, queue = params.queue_id, "flow engine started");
    let mut batch = Vec::with_capacity(ctx.config.engine_batch_size);
    while ctx.is_running() {
        if drain_batch(ctx, &mut batch) == 0 {
            std::thread::yield_now();
        }
    }
    info!(port = params.port_id, "flow engine stopped");
}

/// Pop up to one batch from the handoff queue and offload it
pub fn drain_batch(ctx: &OffloadContext, batch: &mut Vec<Arc<FlowEntry>>) -> usize {
    batch.clear();
    while batch.len() < ctx.config.engine_batch_size {
        match ctx.handoff.pop() {
            Some(entry) => batch.push(entry),
            None => break,
        }
    }

    let n = batch.len();
    for entry in batch.drain(..) {
        if let Err(e) = offload_pair(ctx, &entry) {
            error!(port = ctx.port_id(), flow = %entry.tuple(), error = %e, "flow offload failed");
        }
    }
    n
}

/// Install rules for `entry` and its peer.
///
/// Installs for a pair are serialized on the canonical entry, so a pair
/// whose two directions were both queued is installed once.
pub fn offload_pair(
    ctx: &OffloadContext,
    entry: &Arc<FlowEntry>,
) -> Result<OffloadOutcome, OffloadError> {
    if entry.status() != OffloadStatus::Offloading {
        return Ok(OffloadOutcome::Skipped);
    }
    let Some(peer) = ctx.table.peer_of(entry) else {
        entry.revert_offload();
        ctx.stats.record_install_failed();
        return Err(OffloadError::PeerMissing(*entry.peer()));
    };

    let canonical = if entry.is_canonical() { entry } else { &peer };
    let _guard = canonical.install_lock();

    // the pair may have been handled while we waited
    if entry.status() != OffloadStatus::Offloading {
        return Ok(OffloadOutcome::Skipped);
    }
    match peer.status() {
        OffloadStatus::NotOffloaded => {
            if !peer.try_begin_offload() {
                // only reachable if the peer raced us to OFFLOADING without the lock
                debug!(flow = %peer.tuple(), "peer changed state while claiming");
            }
        }
        OffloadStatus::Offloading => {}
        OffloadStatus::Offloaded => {
            warn!(flow = %entry.tuple(), "peer already offloaded, skipping");
            entry.revert_offload();
            return Ok(OffloadOutcome::Skipped);
        }
    }

    let started = Instant::now();
    let forward_rule = match install(ctx, entry) {
        Ok(h) => h,
        Err(source) => {
            revert_pair(entry, &peer);
            ctx.stats.record_install_failed();
            return Err(OffloadError::Install {
                direction: Direction::Forward,
                tuple: *entry.tuple(),
                source,
            });
        }
    };
    let peer_rule = match install(ctx, &peer) {
        Ok(h) => h,
        Err(source) => {
            if let Err(e) = ctx.device.destroy_rule(ctx.port_id(), forward_rule) {
                error!(flow = %entry.tuple(), error = %e, "cannot roll back forward rule");
            }
            revert_pair(entry, &peer);
            ctx.stats.record_install_failed();
            return Err(OffloadError::Install {
                direction: Direction::Peer,
                tuple: *peer.tuple(),
                source,
            });
        }
    };

    entry.set_rule(forward_rule);
    peer.set_rule(peer_rule);

    // a worker whose handoff push failed may have reverted the peer's claim
    // while the rules were installing; both sides finish or neither does
    if !peer.finish_offload() {
        roll_back_rules(ctx, entry, &peer);
        entry.revert_offload();
        ctx.stats.record_install_failed();
        return Err(OffloadError::ClaimLost(*peer.tuple()));
    }
    if !entry.finish_offload() {
        roll_back_rules(ctx, entry, &peer);
        peer.withdraw_offload();
        ctx.stats.record_install_failed();
        return Err(OffloadError::ClaimLost(*entry.tuple()));
    }

    ctx.latency.record(started.elapsed().as_micros() as u64);
    ctx.stats.record_installed();
    debug!(flow = %entry.tuple(), "flow offloaded");
    Ok(OffloadOutcome::Installed)
}

fn install(ctx: &OffloadContext, entry: &FlowEntry) -> Result<RuleHandle, HwError> {
    let rule = hw::offload_rule(
        entry,
        ctx.config.flow_idle_timeout_secs,
        ctx.config.hairpin_queue(),
    )?;
    ctx.device.install_rule(ctx.port_id(), &rule)
}

fn roll_back_rules(ctx: &OffloadContext, entry: &FlowEntry, peer: &FlowEntry) {
    for e in [entry, peer] {
        let Some(rule) = e.take_rule() else {
            continue;
        };
        if let Err(err) = ctx.device.destroy_rule(ctx.port_id(), rule) {
            error!(flow = %e.tuple(), error = %err, "cannot roll back flow rule");
        }
    }
}

fn revert_pair(entry: &FlowEntry, peer: &FlowEntry) {
    entry.revert_offload();
    peer.revert_offload();
}

/// Install the group-0 jump and the main-group RSS rule.
///
/// If the second rule fails the first is removed again.
pub fn install_default_rules(ctx: &OffloadContext) -> Result<Vec<RuleHandle>, SetupError> {
    let port = ctx.port_id();
    let jump = ctx
        .device
        .install_rule(port, &hw::default_jump_rule())
        .map_err(SetupError::DefaultRule)?;
    match ctx
        .device
        .install_rule(port, &hw::default_rss_rule(ctx.config.rx_queues))
    {
        Ok(rss) => {
            info!(port, "default jump and rss rules installed");
            Ok(vec![jump, rss])
        }
        Err(e) => {
            if let Err(e) = ctx.device.destroy_rule(port, jump) {
                error!(port, error = %e, "cannot remove default jump rule");
            }
            Err(SetupError::DefaultRule(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{sim_context, small_config};
    use crate::hw::{AgedCallback, FlowAction, FlowDevice, FlowRule, HwCounters, PortId, RuleContext};
    use crate::key::{FlowTuple, IPPROTO_TCP};
    use crate::sim::{SimFlowDevice, SimNic};
    use parking_lot::Mutex;

    /// Reverts a worker's claim on `victim` from inside the first install,
    /// like a worker whose handoff push failed mid-install
    struct RevertingDevice {
        inner: Arc<SimFlowDevice>,
        victim: Mutex<Option<Arc<FlowEntry>>>,
    }

    impl FlowDevice for RevertingDevice {
        fn install_rule(&self, port: PortId, rule: &FlowRule) -> Result<RuleHandle, HwError> {
            if let Some(victim) = self.victim.lock().take() {
                assert!(victim.revert_offload());
            }
            self.inner.install_rule(port, rule)
        }

        fn query_counters(&self, port: PortId, rule: RuleHandle) -> Result<HwCounters, HwError> {
            self.inner.query_counters(port, rule)
        }

        fn destroy_rule(&self, port: PortId, rule: RuleHandle) -> Result<(), HwError> {
            self.inner.destroy_rule(port, rule)
        }

        fn get_aged_rules(&self, port: PortId, max: usize) -> Result<Vec<RuleContext>, HwError> {
            self.inner.get_aged_rules(port, max)
        }

        fn register_aged_callback(&self, port: PortId, callback: AgedCallback) -> Result<(), HwError> {
            self.inner.register_aged_callback(port, callback)
        }

        fn unregister_aged_callback(&self, port: PortId) {
            self.inner.unregister_aged_callback(port)
        }

        fn flush(&self, port: PortId) -> Result<(), HwError> {
            self.inner.flush(port)
        }
    }

    fn tuple(n: u16) -> FlowTuple {
        FlowTuple::new(IPPROTO_TCP, 0x0A000001, 0x0A000002, 30000 + n, 80)
    }

    fn queued_pair(ctx: &OffloadContext, t: FlowTuple) -> (Arc<FlowEntry>, Arc<FlowEntry>) {
        let port = ctx.port_pool.acquire().unwrap();
        let (fwd, peer) = FlowEntry::pair(t, Some((ctx.config.nat_addr_u32(), port)), 60);
        let (fwd, peer) = ctx.table.insert_pair(fwd, peer).unwrap();
        assert!(fwd.try_begin_offload());
        ctx.handoff.push(fwd.clone()).unwrap();
        (fwd, peer)
    }

    #[test]
    fn test_install_both_directions() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = queued_pair(&ctx, tuple(1));

        let mut batch = Vec::new();
        assert_eq!(drain_batch(&ctx, &mut batch), 1);

        assert_eq!(fwd.status(), OffloadStatus::Offloaded);
        assert_eq!(peer.status(), OffloadStatus::Offloaded);
        assert!(fwd.rule().is_some());
        assert!(peer.rule().is_some());
        assert_ne!(fwd.rule(), peer.rule());
        assert_eq!(dev.rule_count(), 2);
        assert_eq!(ctx.latency.len(), 1);
        assert_eq!(ctx.stats.snapshot().offload_installed, 1);

        let rule = dev.rule_for(fwd.tuple()).unwrap();
        assert_eq!(
            rule.actions[..2],
            [FlowAction::SetIpv4Dst(0x05050505), FlowAction::SetTpDst(2000)]
        );
        let rule = dev.rule_for(peer.tuple()).unwrap();
        assert_eq!(
            rule.actions[..2],
            [FlowAction::SetIpv4Src(0x05050505), FlowAction::SetTpSrc(2000)]
        );
    }

    #[test]
    fn test_peer_failure_reverts_both() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = queued_pair(&ctx, tuple(1));
        dev.fail_install_for(*peer.tuple());

        let err = offload_pair(&ctx, &ctx.handoff.pop().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::Install {
                direction: Direction::Peer,
                ..
            }
        ));
        assert_eq!(fwd.status(), OffloadStatus::NotOffloaded);
        assert_eq!(peer.status(), OffloadStatus::NotOffloaded);
        assert!(fwd.rule().is_none());
        // forward rule rolled back
        assert_eq!(dev.rule_count(), 0);
        assert_eq!(ctx.stats.snapshot().offload_failed, 1);

        // eligible for retry once the device recovers
        dev.clear_install_failures();
        assert!(fwd.try_begin_offload());
        assert_eq!(offload_pair(&ctx, &fwd).unwrap(), OffloadOutcome::Installed);
    }

    #[test]
    fn test_forward_failure_reverts() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = queued_pair(&ctx, tuple(1));
        dev.fail_install_for(*fwd.tuple());

        let err = offload_pair(&ctx, &fwd).unwrap_err();
        assert!(err.to_string().contains("forward"));
        assert_eq!(fwd.status(), OffloadStatus::NotOffloaded);
        assert_eq!(peer.status(), OffloadStatus::NotOffloaded);
        assert_eq!(dev.rule_count(), 0);
    }

    #[test]
    fn test_both_directions_queued_install_once() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, peer) = queued_pair(&ctx, tuple(1));
        assert!(peer.try_begin_offload());
        ctx.handoff.push(peer.clone()).unwrap();

        let mut batch = Vec::new();
        assert_eq!(drain_batch(&ctx, &mut batch), 2);
        assert_eq!(dev.install_count(), 2);
        assert_eq!(fwd.status(), OffloadStatus::Offloaded);
        assert_eq!(peer.status(), OffloadStatus::Offloaded);
    }

    #[test]
    fn test_peer_claim_withdrawn_during_install() {
        let sim = Arc::new(SimFlowDevice::new(0));
        let dev = Arc::new(RevertingDevice {
            inner: sim.clone(),
            victim: Mutex::new(None),
        });
        let ctx = OffloadContext::new(small_config(), Arc::new(SimNic::new(0, 2)), dev.clone())
            .unwrap();
        let (fwd, peer) = queued_pair(&ctx, tuple(1));
        // a worker claims the peer; its push will fail while we install
        assert!(peer.try_begin_offload());
        *dev.victim.lock() = Some(peer.clone());

        assert_eq!(
            offload_pair(&ctx, &fwd).unwrap_err(),
            OffloadError::ClaimLost(*peer.tuple())
        );
        assert_eq!(fwd.status(), peer.status());
        assert_eq!(fwd.status(), OffloadStatus::NotOffloaded);
        assert!(fwd.rule().is_none());
        assert!(peer.rule().is_none());
        assert_eq!(sim.rule_count(), 0);
        assert_eq!(ctx.stats.snapshot().offload_failed, 1);

        // the next packet past the threshold retries cleanly
        assert!(fwd.try_begin_offload());
        assert_eq!(offload_pair(&ctx, &fwd).unwrap(), OffloadOutcome::Installed);
        assert_eq!(peer.status(), OffloadStatus::Offloaded);
        assert_eq!(sim.rule_count(), 2);
    }

    #[test]
    fn test_stale_entry_skipped() {
        let (ctx, _, dev) = sim_context(small_config());
        let (fwd, _) = queued_pair(&ctx, tuple(1));
        fwd.revert_offload();
        assert_eq!(offload_pair(&ctx, &fwd).unwrap(), OffloadOutcome::Skipped);
        assert_eq!(dev.rule_count(), 0);
    }

    #[test]
    fn test_peer_missing() {
        let (ctx, _, _) = sim_context(small_config());
        let (fwd, peer) = queued_pair(&ctx, tuple(1));
        ctx.table.remove(peer.tuple());
        assert_eq!(
            offload_pair(&ctx, &fwd).unwrap_err(),
            OffloadError::PeerMissing(*peer.tuple())
        );
        assert_eq!(fwd.status(), OffloadStatus::NotOffloaded);
    }

    #[test]
    fn test_default_rules() {
        let (ctx, _, dev) = sim_context(small_config());
        let rules = install_default_rules(&ctx).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(dev.rule_count(), 2);

        let (ctx, _, dev) = sim_context(small_config());
        dev.fail_default_rules(true);
        assert!(matches!(
            install_default_rules(&ctx),
            Err(SetupError::DefaultRule(_))
        ));
        assert_eq!(dev.rule_count(), 0);
    }

    #[test]
    fn test_concurrent_engines() {
        use std::thread;

        let (ctx, _, dev) = sim_context(small_config());
        let pairs: Vec<_> = (0..40).map(|n| queued_pair(&ctx, tuple(n))).collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let mut batch = Vec::new();
                    while drain_batch(&ctx, &mut batch) > 0 {}
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(dev.rule_count(), 80);
        for (fwd, peer) in pairs {
            assert_eq!(fwd.status(), OffloadStatus::Offloaded);
            assert_eq!(peer.status(), OffloadStatus::Offloaded);
        }
    }
}
