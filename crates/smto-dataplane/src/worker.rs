//! Fast Path Worker
//!
//! One thread per receive queue: receive a burst, classify, track and
//! forward. Nothing here blocks or returns an error. Classification, table
//! and pool failures turn into counters and debug lines, and the packet is
//! forwarded regardless.

use crate::context::OffloadContext;
use crate::error::TableError;
use crate::flow::{FlowEntry, OffloadStatus};
use crate::hw::{PortId, QueueId};
use crate::key::{self, FlowTuple, ETHER_HDR_LEN};
use crate::packet;
use crate::stats::DataplaneStats;
use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, info};

/// Port and queue a worker or engine thread serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerParams {
    pub port_id: PortId,
    pub queue_id: QueueId,
}

/// What the fast path did with one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAction {
    /// Not IPv4 TCP/UDP; forwarded untouched
    Unclassified,
    /// First packet of a new flow pair
    Created,
    /// Flow could not be tracked (table full or lost insert race)
    Untracked,
    /// Existing flow
    Tracked {
        /// This packet crossed the threshold and queued the flow
        offload_queued: bool,
        /// Headers rewritten to the flow's NAT tuple
        rewritten: bool,
    },
}

/// Worker loop; returns once the running flag clears
pub fn process_loop(ctx: &OffloadContext, params: WorkerParams) {
    info!(port = params.port_id, queue = params.queue_id, "worker started");
    let mut burst = Vec::with_capacity(ctx.config.burst_size);
    while ctx.is_running() {
        if poll_once(ctx, params, &mut burst) == 0 {
            std::thread::yield_now();
        }
    }
    info!(port = params.port_id, queue = params.queue_id, "worker stopped");
}

/// Receive, process and transmit one burst. Returns packets received.
pub fn poll_once(ctx: &OffloadContext, params: WorkerParams, burst: &mut Vec<BytesMut>) -> usize {
    burst.clear();
    let n = ctx
        .nic
        .receive_burst(params.port_id, params.queue_id, ctx.config.burst_size, burst);
    if n == 0 {
        return 0;
    }

    let bytes: usize = burst.iter().map(|p| p.len()).sum();
    ctx.stats.record_rx(n as u64, bytes as u64);
    for pkt in burst.iter_mut() {
        process_packet(ctx, params.queue_id, pkt);
    }

    let sent = ctx.nic.transmit_burst(params.port_id, params.queue_id, burst);
    ctx.stats.record_tx(sent as u64);
    if !burst.is_empty() {
        // unsent packets are ours to free
        ctx.stats.record_drop(burst.len() as u64);
        burst.clear();
    }
    n
}

/// Classify and track one packet, rewriting it if its flow is offloaded
pub fn process_packet(ctx: &OffloadContext, queue: QueueId, pkt: &mut BytesMut) -> PacketAction {
    let tuple = match key::classify(&pkt[..]) {
        Ok(t) => t,
        Err(e) => {
            DataplaneStats::inc(&ctx.stats.classify_failures);
            debug!(queue, error = %e, "unclassified packet forwarded");
            return PacketAction::Unclassified;
        }
    };
    let len = pkt.len() as u64;

    match ctx.table.lookup(&tuple) {
        Some(entry) => {
            DataplaneStats::inc(&ctx.stats.flow_hits);
            track(ctx, &entry, &tuple, pkt, len)
        }
        None => {
            DataplaneStats::inc(&ctx.stats.flow_misses);
            create_flow(ctx, queue, tuple, pkt, len)
        }
    }
}

fn create_flow(
    ctx: &OffloadContext,
    queue: QueueId,
    tuple: FlowTuple,
    pkt: &mut BytesMut,
    len: u64,
) -> PacketAction {
    let nat_port = ctx.port_pool.acquire();
    if nat_port.is_none() {
        DataplaneStats::inc(&ctx.stats.pool_exhausted);
        debug!(flow = %tuple, "port pool exhausted, tracking without rewrite");
    }

    let nat = nat_port.map(|port| (ctx.config.nat_addr_u32(), port));
    let (forward, peer) = FlowEntry::pair(tuple, nat, len);
    match ctx.table.insert_pair(forward, peer) {
        Ok(_) => {
            DataplaneStats::inc(&ctx.stats.flows_created);
            debug!(flow = %tuple.with_queue(queue), "new flow");
            PacketAction::Created
        }
        Err(e) => {
            if let Some(port) = nat_port {
                ctx.port_pool.release(port);
            }
            match e {
                TableError::AlreadyExists => {
                    DataplaneStats::inc(&ctx.stats.insert_races);
                    match ctx.table.lookup(&tuple) {
                        Some(entry) => track(ctx, &entry, &tuple, pkt, len),
                        None => PacketAction::Untracked,
                    }
                }
                TableError::TableFull => {
                    DataplaneStats::inc(&ctx.stats.table_full);
                    debug!(flow = %tuple, "flow table full");
                    PacketAction::Untracked
                }
            }
        }
    }
}

fn track(
    ctx: &OffloadContext,
    entry: &Arc<FlowEntry>,
    tuple: &FlowTuple,
    pkt: &mut BytesMut,
    len: u64,
) -> PacketAction {
    let count = entry.record_packet(len);

    let mut offload_queued = false;
    if count >= ctx.config.offload_threshold
        && entry.status() == OffloadStatus::NotOffloaded
        && entry.try_begin_offload()
    {
        match ctx.handoff.push(Arc::clone(entry)) {
            Ok(()) => {
                DataplaneStats::inc(&ctx.stats.offload_enqueued);
                offload_queued = true;
            }
            Err(_) => {
                entry.revert_offload();
                DataplaneStats::inc(&ctx.stats.handoff_full);
                debug!(flow = %tuple, "handoff queue full, offload deferred");
            }
        }
    }

    let mut rewritten = false;
    if entry.status() == OffloadStatus::Offloaded {
        if let Some(to) = entry.rewritten() {
            match packet::rewrite(&mut pkt[..], ETHER_HDR_LEN, tuple, to) {
                Ok(()) => rewritten = true,
                Err(e) => debug!(flow = %tuple, error = %e, "rewrite skipped"),
            }
        }
    }

    PacketAction::Tracked {
        offload_queued,
        rewritten,
    }
}
