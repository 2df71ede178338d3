//! Simulated NIC
//!
//! In-process [`NicPort`] and [`FlowDevice`] used by tests, benches and the
//! agent. Packets are injected into receive queues and collected from
//! transmit queues; the flow device keeps installed rules in a map, lets a
//! test age rules out, and can be told to fail individual operations.

use crate::error::HwError;
use crate::hw::{
    AgedCallback, FlowDevice, FlowPattern, FlowRule, HwCounters, NicPort, PortId, QueueId,
    RuleContext, RuleHandle,
};
use crate::key::FlowTuple;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

const ENOENT: i32 = -2;
const EIO: i32 = -5;
const ENOTSUP: i32 = -95;

/// Simulated receive/transmit queues of one port
pub struct SimNic {
    port: PortId,
    rx: Vec<Mutex<VecDeque<BytesMut>>>,
    tx: Vec<Mutex<Vec<BytesMut>>>,
    /// Packets accepted per transmit call
    tx_limit: AtomicUsize,
}

impl SimNic {
    pub fn new(port: PortId, queues: u16) -> Self {
        Self {
            port,
            rx: (0..queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            tx: (0..queues).map(|_| Mutex::new(Vec::new())).collect(),
            tx_limit: AtomicUsize::new(usize::MAX),
        }
    }

    /// Queue a packet for reception
    pub fn inject(&self, queue: QueueId, packet: &[u8]) {
        if let Some(q) = self.rx.get(queue as usize) {
            q.lock().push_back(BytesMut::from(packet));
        }
    }

    /// Take everything transmitted on `queue` so far
    pub fn take_transmitted(&self, queue: QueueId) -> Vec<BytesMut> {
        self.tx
            .get(queue as usize)
            .map(|q| std::mem::take(&mut *q.lock()))
            .unwrap_or_default()
    }

    pub fn pending_rx(&self, queue: QueueId) -> usize {
        self.rx.get(queue as usize).map_or(0, |q| q.lock().len())
    }

    /// Cap the packets accepted by each transmit call
    pub fn set_tx_limit(&self, limit: usize) {
        self.tx_limit.store(limit, Ordering::Relaxed);
    }
}

impl NicPort for SimNic {
    fn receive_burst(
        &self,
        port: PortId,
        queue: QueueId,
        max: usize,
        out: &mut Vec<BytesMut>,
    ) -> usize {
        let Some(q) = self.rx.get(queue as usize).filter(|_| port == self.port) else {
            return 0;
        };
        let mut q = q.lock();
        let n = max.min(q.len());
        out.extend(q.drain(..n));
        n
    }

    fn transmit_burst(&self, port: PortId, queue: QueueId, packets: &mut Vec<BytesMut>) -> usize {
        let Some(q) = self.tx.get(queue as usize).filter(|_| port == self.port) else {
            return 0;
        };
        let n = packets.len().min(self.tx_limit.load(Ordering::Relaxed));
        q.lock().extend(packets.drain(..n));
        n
    }
}

struct SimRule {
    rule: FlowRule,
    counters: HwCounters,
    aged: bool,
}

#[derive(Default)]
struct DeviceState {
    next_handle: u64,
    rules: HashMap<RuleHandle, SimRule>,
    by_tuple: HashMap<FlowTuple, RuleHandle>,
    aged: VecDeque<RuleContext>,
    fail_install: HashSet<FlowTuple>,
    fail_query: HashSet<FlowTuple>,
    fail_destroy: HashSet<FlowTuple>,
    fail_default_rules: bool,
    fail_register: bool,
    installs: u64,
}

/// Simulated flow-offload engine of one port
pub struct SimFlowDevice {
    port: PortId,
    state: Mutex<DeviceState>,
    callback: Mutex<Option<AgedCallback>>,
}

impl SimFlowDevice {
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            state: Mutex::new(DeviceState::default()),
            callback: Mutex::new(None),
        }
    }

    pub fn fail_install_for(&self, tuple: FlowTuple) {
        self.state.lock().fail_install.insert(tuple);
    }

    pub fn clear_install_failures(&self) {
        self.state.lock().fail_install.clear();
    }

    pub fn fail_query_for(&self, tuple: FlowTuple) {
        self.state.lock().fail_query.insert(tuple);
    }

    pub fn fail_destroy_for(&self, tuple: FlowTuple) {
        self.state.lock().fail_destroy.insert(tuple);
    }

    pub fn fail_default_rules(&self, fail: bool) {
        self.state.lock().fail_default_rules = fail;
    }

    pub fn fail_register(&self, fail: bool) {
        self.state.lock().fail_register = fail;
    }

    /// Set the hardware counters of the rule matching `tuple`
    pub fn set_counters(&self, tuple: &FlowTuple, counters: HwCounters) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.by_tuple.get(tuple).copied() else {
            return false;
        };
        match state.rules.get_mut(&handle) {
            Some(r) => {
                r.counters = counters;
                true
            }
            None => false,
        }
    }

    /// Age out the rule matching `tuple` and raise the aged event
    pub fn age_flow(&self, tuple: &FlowTuple) -> bool {
        let aged = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let rule = state
                .by_tuple
                .get(tuple)
                .and_then(|h| state.rules.get_mut(h))
                .filter(|r| !r.aged);
            match rule.and_then(|r| {
                r.aged = true;
                r.rule.age_context()
            }) {
                Some(ctx) => {
                    state.aged.push_back(ctx);
                    true
                }
                None => false,
            }
        };
        if aged {
            self.raise_aged_event();
        }
        aged
    }

    /// Age out every installed rule with an age action
    pub fn age_all(&self) -> usize {
        let n = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let mut n = 0;
            for r in state.rules.values_mut().filter(|r| !r.aged) {
                if let Some(ctx) = r.rule.age_context() {
                    r.aged = true;
                    state.aged.push_back(ctx);
                    n += 1;
                }
            }
            n
        };
        if n > 0 {
            self.raise_aged_event();
        }
        n
    }

    fn raise_aged_event(&self) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(self.port);
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.len()
    }

    /// Successful installs since creation
    pub fn install_count(&self) -> u64 {
        self.state.lock().installs
    }

    pub fn rule_for(&self, tuple: &FlowTuple) -> Option<FlowRule> {
        let state = self.state.lock();
        let handle = state.by_tuple.get(tuple)?;
        state.rules.get(handle).map(|r| r.rule.clone())
    }

    fn check_port(&self, port: PortId) -> Result<(), HwError> {
        if port != self.port {
            return Err(HwError::new(ENOENT, format!("no such port {port}")));
        }
        Ok(())
    }
}

impl FlowDevice for SimFlowDevice {
    fn install_rule(&self, port: PortId, rule: &FlowRule) -> Result<RuleHandle, HwError> {
        self.check_port(port)?;
        let mut state = self.state.lock();
        let tuple = match &rule.pattern {
            FlowPattern::FiveTuple(t) => Some(*t),
            FlowPattern::AnyIpv4 => None,
        };
        match tuple {
            Some(t) if state.fail_install.contains(&t) => {
                return Err(HwError::new(EIO, "hardware flow table full"));
            }
            Some(t) if state.by_tuple.contains_key(&t) => {
                return Err(HwError::new(-17, "flow rule already exists"));
            }
            None if state.fail_default_rules => {
                return Err(HwError::new(ENOTSUP, "action not supported"));
            }
            _ => {}
        }

        state.next_handle += 1;
        state.installs += 1;
        let handle = RuleHandle(state.next_handle);
        if let Some(t) = tuple {
            state.by_tuple.insert(t, handle);
        }
        state.rules.insert(
            handle,
            SimRule {
                rule: rule.clone(),
                counters: HwCounters::default(),
                aged: false,
            },
        );
        Ok(handle)
    }

    fn query_counters(&self, port: PortId, rule: RuleHandle) -> Result<HwCounters, HwError> {
        self.check_port(port)?;
        let state = self.state.lock();
        let r = state
            .rules
            .get(&rule)
            .ok_or_else(|| HwError::new(ENOENT, "flow not found"))?;
        if let FlowPattern::FiveTuple(t) = &r.rule.pattern {
            if state.fail_query.contains(t) {
                return Err(HwError::new(EIO, "counter query failed"));
            }
        }
        Ok(r.counters)
    }

    fn destroy_rule(&self, port: PortId, rule: RuleHandle) -> Result<(), HwError> {
        self.check_port(port)?;
        let mut state = self.state.lock();
        let tuple = match state.rules.get(&rule) {
            None => return Err(HwError::new(ENOENT, "flow not found")),
            Some(r) => match &r.rule.pattern {
                FlowPattern::FiveTuple(t) => Some(*t),
                FlowPattern::AnyIpv4 => None,
            },
        };
        if let Some(t) = tuple {
            if state.fail_destroy.contains(&t) {
                return Err(HwError::new(EIO, "rule destroy failed"));
            }
            state.by_tuple.remove(&t);
        }
        state.rules.remove(&rule);
        Ok(())
    }

    fn get_aged_rules(&self, port: PortId, max: usize) -> Result<Vec<RuleContext>, HwError> {
        self.check_port(port)?;
        let mut state = self.state.lock();
        let n = max.min(state.aged.len());
        Ok(state.aged.drain(..n).collect())
    }

    fn register_aged_callback(&self, port: PortId, callback: AgedCallback) -> Result<(), HwError> {
        self.check_port(port)?;
        if self.state.lock().fail_register {
            return Err(HwError::new(ENOTSUP, "aged event not supported"));
        }
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn unregister_aged_callback(&self, _port: PortId) {
        *self.callback.lock() = None;
    }

    fn flush(&self, port: PortId) -> Result<(), HwError> {
        self.check_port(port)?;
        let mut state = self.state.lock();
        state.rules.clear();
        state.by_tuple.clear();
        state.aged.clear();
        Ok(())
    }
}
