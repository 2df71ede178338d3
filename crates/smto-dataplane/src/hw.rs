//! Hardware interface
//!
//! The NIC receive/transmit path and the NIC flow-offload engine are
//! external collaborators; the dataplane talks to them only through
//! [`NicPort`] and [`FlowDevice`]. Rules are described by [`FlowRule`],
//! a plain value the device translates into its own rule format.

use crate::error::HwError;
use crate::flow::FlowEntry;
use crate::key::{FlowTuple, IPPROTO_TCP, IPPROTO_UDP};
use bytes::BytesMut;
use std::sync::Arc;

pub type PortId = u16;
pub type QueueId = u16;

/// Opaque handle of an installed rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleHandle(pub u64);

/// Context attached to a rule's age action and handed back when it ages
/// out. Resolved through the flow table, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleContext(pub FlowTuple);

/// Root group; only the default jump rule lives here
pub const GROUP_ROOT: u32 = 0;
/// Group holding the RSS fallback and all offload rules
pub const GROUP_MAIN: u32 = 1;
pub const PRIORITY_OFFLOAD: u32 = 0;
pub const PRIORITY_RSS: u32 = 1;

const EINVAL: i32 = -22;

/// Toeplitz key giving the same hash for both directions of a flow
pub const SYMMETRIC_RSS_KEY: [u8; 40] = {
    let mut key = [0u8; 40];
    let mut i = 0;
    while i < key.len() {
        key[i] = 0x6D;
        key[i + 1] = 0x5A;
        i += 2;
    }
    key
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowPattern {
    /// Any IPv4 packet
    AnyIpv4,
    /// Exact IPv4 + TCP/UDP 5-tuple
    FiveTuple(FlowTuple),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    Jump(u32),
    Rss { queues: Vec<QueueId>, key: Vec<u8> },
    SetIpv4Src(u32),
    SetIpv4Dst(u32),
    SetTpSrc(u16),
    SetTpDst(u16),
    Count,
    Age { timeout_secs: u32, context: RuleContext },
    Queue(QueueId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub attr: FlowAttr,
    pub pattern: FlowPattern,
    pub actions: Vec<FlowAction>,
}

impl FlowRule {
    /// Context of the rule's age action, if any
    pub fn age_context(&self) -> Option<RuleContext> {
        self.actions.iter().find_map(|a| match a {
            FlowAction::Age { context, .. } => Some(*context),
            _ => None,
        })
    }
}

/// Final counters of a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwCounters {
    pub hits: u64,
    pub bytes: u64,
}

/// Aged-event handler. Invoked from the device's event context: it must
/// not block or allocate.
pub type AgedCallback = Arc<dyn Fn(PortId) + Send + Sync>;

/// NIC receive/transmit queues
pub trait NicPort: Send + Sync {
    /// Append up to `max` received packets to `out`, returning how many
    fn receive_burst(
        &self,
        port: PortId,
        queue: QueueId,
        max: usize,
        out: &mut Vec<BytesMut>,
    ) -> usize;

    /// Transmit from the front of `packets`. Sent packets are removed;
    /// unsent ones stay in the vector and belong to the caller.
    fn transmit_burst(&self, port: PortId, queue: QueueId, packets: &mut Vec<BytesMut>) -> usize;
}

/// NIC flow-offload engine
pub trait FlowDevice: Send + Sync {
    fn install_rule(&self, port: PortId, rule: &FlowRule) -> Result<RuleHandle, HwError>;

    fn query_counters(&self, port: PortId, rule: RuleHandle) -> Result<HwCounters, HwError>;

    fn destroy_rule(&self, port: PortId, rule: RuleHandle) -> Result<(), HwError>;

    /// Contexts of up to `max` rules that aged out since the last call
    fn get_aged_rules(&self, port: PortId, max: usize) -> Result<Vec<RuleContext>, HwError>;

    fn register_aged_callback(&self, port: PortId, callback: AgedCallback) -> Result<(), HwError>;

    fn unregister_aged_callback(&self, port: PortId);

    /// Destroy every rule on the port
    fn flush(&self, port: PortId) -> Result<(), HwError>;
}

/// Group 0: send all IPv4 to the main group
pub fn default_jump_rule() -> FlowRule {
    FlowRule {
        attr: FlowAttr {
            group: GROUP_ROOT,
            priority: 0,
            ingress: true,
        },
        pattern: FlowPattern::AnyIpv4,
        actions: vec![FlowAction::Jump(GROUP_MAIN)],
    }
}

/// Main-group fallback: spread unmatched traffic over the receive queues
pub fn default_rss_rule(rx_queues: u16) -> FlowRule {
    FlowRule {
        attr: FlowAttr {
            group: GROUP_MAIN,
            priority: PRIORITY_RSS,
            ingress: true,
        },
        pattern: FlowPattern::AnyIpv4,
        actions: vec![FlowAction::Rss {
            queues: (0..rx_queues).collect(),
            key: SYMMETRIC_RSS_KEY.to_vec(),
        }],
    }
}

/// Offload rule for one flow direction.
///
/// Set actions are emitted for every field the rewrite changes, followed
/// by a counter, the idle-timeout age action and the hairpin queue.
pub fn offload_rule(
    entry: &FlowEntry,
    idle_timeout_secs: u32,
    hairpin_queue: QueueId,
) -> Result<FlowRule, HwError> {
    let key = entry.tuple();
    if key.protocol != IPPROTO_TCP && key.protocol != IPPROTO_UDP {
        return Err(HwError::new(
            EINVAL,
            format!("unsupported l4 proto type {}", key.protocol),
        ));
    }

    let mut actions = Vec::with_capacity(7);
    if let Some(rw) = entry.rewritten() {
        if rw.addr1 != key.addr1 {
            actions.push(FlowAction::SetIpv4Src(rw.addr1));
        }
        if rw.addr2 != key.addr2 {
            actions.push(FlowAction::SetIpv4Dst(rw.addr2));
        }
        if rw.port1 != key.port1 {
            actions.push(FlowAction::SetTpSrc(rw.port1));
        }
        if rw.port2 != key.port2 {
            actions.push(FlowAction::SetTpDst(rw.port2));
        }
    }
    actions.push(FlowAction::Count);
    actions.push(FlowAction::Age {
        timeout_secs: idle_timeout_secs,
        context: RuleContext(*key),
    });
    actions.push(FlowAction::Queue(hairpin_queue));

    Ok(FlowRule {
        attr: FlowAttr {
            group: GROUP_MAIN,
            priority: PRIORITY_OFFLOAD,
            ingress: true,
        },
        pattern: FlowPattern::FiveTuple(*key),
        actions,
    })
}
