//! Concurrent Flow Tracking Table
//!
//! Each direction of a connection is its own entry keyed by [`FlowTuple`];
//! the reverse direction is the entry's peer. Peers are created, inserted
//! and evicted together, and link to each other by tuple only: the table
//! owns both entries.
//!
//! # Design
//!
//! - Sharded concurrent map (`DashMap`) with the FNV flow hasher
//! - Per-entry atomics for counters and offload status
//! - Insert-if-absent, so exactly one worker wins a fresh tuple
//! - Entry count tracked separately to enforce the configured capacity

use crate::error::TableError;
use crate::hw::RuleHandle;
use crate::key::{FlowBuildHasher, FlowTuple};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on buckets reserved up front
const PREALLOC_LIMIT: usize = 1 << 16;

/// Offload state of one flow direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OffloadStatus {
    NotOffloaded = 0,
    Offloading = 1,
    Offloaded = 2,
}

impl OffloadStatus {
    #[inline(always)]
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Offloading,
            2 => Self::Offloaded,
            _ => Self::NotOffloaded,
        }
    }
}

/// Per-direction flow state
pub struct FlowEntry {
    tuple: FlowTuple,
    peer: FlowTuple,
    rewritten: Option<FlowTuple>,
    /// NAT port owned by this entry, returned to the pool on eviction
    nat_port: Option<u16>,
    created_at: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
    status: AtomicU8,
    rule: Mutex<Option<RuleHandle>>,
    /// Serializes installation of the pair; only the canonical entry's lock is used
    install_lock: Mutex<()>,
}

impl FlowEntry {
    fn new(tuple: FlowTuple, rewritten: Option<FlowTuple>, nat_port: Option<u16>) -> Self {
        Self {
            tuple,
            peer: tuple.reverse(),
            rewritten,
            nat_port,
            created_at: Instant::now(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            status: AtomicU8::new(OffloadStatus::NotOffloaded as u8),
            rule: Mutex::new(None),
            install_lock: Mutex::new(()),
        }
    }

    /// Build both directions of a new flow from its first packet.
    ///
    /// With a NAT binding the forward direction's destination is rewritten
    /// to `nat_addr:nat_port` and the peer carries the reverse of that tuple.
    /// The forward entry owns the port and is credited with the first packet.
    pub fn pair(
        tuple: FlowTuple,
        nat: Option<(u32, u16)>,
        first_len: u64,
    ) -> (FlowEntry, FlowEntry) {
        let rewritten = nat.map(|(addr, port)| FlowTuple { addr2: addr, port2: port, ..tuple });
        let forward = FlowEntry::new(tuple, rewritten, nat.map(|(_, port)| port));
        let peer = FlowEntry::new(tuple.reverse(), rewritten.map(|r| r.reverse()), None);
        forward.packets.store(1, Ordering::Relaxed);
        forward.bytes.store(first_len, Ordering::Relaxed);
        (forward, peer)
    }

    #[inline(always)]
    pub fn tuple(&self) -> &FlowTuple {
        &self.tuple
    }

    /// Key of the reverse-direction entry
    #[inline(always)]
    pub fn peer(&self) -> &FlowTuple {
        &self.peer
    }

    #[inline(always)]
    pub fn rewritten(&self) -> Option<&FlowTuple> {
        self.rewritten.as_ref()
    }

    pub fn nat_port(&self) -> Option<u16> {
        self.nat_port
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The lower tuple of the pair; it serializes installs for both
    #[inline]
    pub fn is_canonical(&self) -> bool {
        self.tuple <= self.peer
    }

    #[inline(always)]
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Count one packet and return the new packet total
    #[inline(always)]
    pub fn record_packet(&self, len: u64) -> u64 {
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fold final hardware counters into the software ones
    pub fn merge_counters(&self, hits: u64, bytes: u64) {
        self.packets.fetch_add(hits, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn status(&self) -> OffloadStatus {
        OffloadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn transition(&self, from: OffloadStatus, to: OffloadStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// NOT_OFFLOADED -> OFFLOADING; false if another thread got there first
    #[inline(always)]
    pub fn try_begin_offload(&self) -> bool {
        self.transition(OffloadStatus::NotOffloaded, OffloadStatus::Offloading)
    }

    /// OFFLOADING -> NOT_OFFLOADED, leaving the entry eligible for retry
    #[inline]
    pub fn revert_offload(&self) -> bool {
        self.transition(OffloadStatus::Offloading, OffloadStatus::NotOffloaded)
    }

    /// OFFLOADING -> OFFLOADED
    pub fn finish_offload(&self) -> bool {
        self.transition(OffloadStatus::Offloading, OffloadStatus::Offloaded)
    }

    /// OFFLOADED -> NOT_OFFLOADED, undoing a finish whose peer could not follow
    pub fn withdraw_offload(&self) -> bool {
        self.transition(OffloadStatus::Offloaded, OffloadStatus::NotOffloaded)
    }

    pub fn rule(&self) -> Option<RuleHandle> {
        *self.rule.lock()
    }

    pub fn set_rule(&self, handle: RuleHandle) {
        *self.rule.lock() = Some(handle);
    }

    pub fn take_rule(&self) -> Option<RuleHandle> {
        self.rule.lock().take()
    }

    pub(crate) fn install_lock(&self) -> MutexGuard<'_, ()> {
        self.install_lock.lock()
    }
}

impl std::fmt::Debug for FlowEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEntry")
            .field("tuple", &self.tuple)
            .field("rewritten", &self.rewritten)
            .field("packets", &self.packets())
            .field("bytes", &self.bytes())
            .field("status", &self.status())
            .finish()
    }
}

/// Concurrent flow table
pub struct FlowTable {
    map: DashMap<FlowTuple, Arc<FlowEntry>, FlowBuildHasher>,
    count: AtomicUsize,
    capacity: usize,
}

impl FlowTable {
    /// Create a table holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity_and_hasher(
                capacity.min(PREALLOC_LIMIT),
                FlowBuildHasher::default(),
            ),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    #[inline]
    pub fn lookup(&self, tuple: &FlowTuple) -> Option<Arc<FlowEntry>> {
        self.map.get(tuple).map(|r| Arc::clone(r.value()))
    }

    /// Reverse-direction entry of `entry`, if still present
    #[inline]
    pub fn peer_of(&self, entry: &FlowEntry) -> Option<Arc<FlowEntry>> {
        self.lookup(entry.peer())
    }

    fn reserve(&self, n: usize) -> Result<(), TableError> {
        let prev = self.count.fetch_add(n, Ordering::AcqRel);
        if prev + n > self.capacity {
            self.count.fetch_sub(n, Ordering::AcqRel);
            return Err(TableError::TableFull);
        }
        Ok(())
    }

    fn unreserve(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::AcqRel);
    }

    /// Insert an entry under its own tuple
    pub fn insert(&self, entry: FlowEntry) -> Result<Arc<FlowEntry>, TableError> {
        self.reserve(1)?;
        let inserted = self.insert_reserved(entry);
        if inserted.is_err() {
            self.unreserve(1);
        }
        inserted
    }

    fn insert_reserved(&self, entry: FlowEntry) -> Result<Arc<FlowEntry>, TableError> {
        match self.map.entry(entry.tuple) {
            Entry::Occupied(_) => Err(TableError::AlreadyExists),
            Entry::Vacant(v) => {
                let entry = Arc::new(entry);
                v.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Insert both directions of a flow.
    ///
    /// The lower tuple goes in first, so two workers racing on the same
    /// connection from opposite directions collide on the same key. If the
    /// second insert loses, the first is rolled back and the pair is
    /// reported as `AlreadyExists`. Returned in argument order.
    pub fn insert_pair(
        &self,
        forward: FlowEntry,
        peer: FlowEntry,
    ) -> Result<(Arc<FlowEntry>, Arc<FlowEntry>), TableError> {
        self.reserve(2)?;
        let swapped = peer.tuple < forward.tuple;
        let (first, second) = if swapped { (peer, forward) } else { (forward, peer) };

        let first = match self.insert_reserved(first) {
            Ok(e) => e,
            Err(e) => {
                self.unreserve(2);
                return Err(e);
            }
        };
        let second = match self.insert_reserved(second) {
            Ok(e) => e,
            Err(e) => {
                self.map
                    .remove_if(first.tuple(), |_, v| Arc::ptr_eq(v, &first));
                self.unreserve(2);
                return Err(e);
            }
        };

        Ok(if swapped { (second, first) } else { (first, second) })
    }

    pub fn remove(&self, tuple: &FlowTuple) -> Option<Arc<FlowEntry>> {
        let (_, entry) = self.map.remove(tuple)?;
        self.unreserve(1);
        Some(entry)
    }

    /// Remove `entry` only if it is still the one stored under its tuple
    pub fn remove_exact(&self, entry: &Arc<FlowEntry>) -> bool {
        let removed = self
            .map
            .remove_if(entry.tuple(), |_, v| Arc::ptr_eq(v, entry))
            .is_some();
        if removed {
            self.unreserve(1);
        }
        removed
    }

    /// Snapshot of the current entries
    pub fn iter(&self) -> Vec<(FlowTuple, Arc<FlowEntry>)> {
        self.map
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect()
    }

    /// Remove every entry, returning what was removed
    pub fn drain(&self) -> Vec<Arc<FlowEntry>> {
        let keys: Vec<FlowTuple> = self.map.iter().map(|r| *r.key()).collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{IPPROTO_TCP, IPPROTO_UDP};
    use proptest::prelude::*;

    const NAT: u32 = 0x05050505;

    fn tuple(n: u32) -> FlowTuple {
        FlowTuple::new(IPPROTO_TCP, 0xC0A80000 + n, 0x08080808, 40000, 443)
    }

    #[test]
    fn test_pair_links_and_rewrite() {
        let (fwd, peer) = FlowEntry::pair(tuple(1), Some((NAT, 2000)), 100);
        assert_eq!(fwd.peer(), peer.tuple());
        assert_eq!(peer.peer(), fwd.tuple());
        assert_eq!(fwd.packets(), 1);
        assert_eq!(fwd.bytes(), 100);
        assert_eq!(peer.packets(), 0);

        let rw = fwd.rewritten().unwrap();
        assert_eq!(rw.addr2, NAT);
        assert_eq!(rw.port2, 2000);
        assert_eq!(rw.addr1, tuple(1).addr1);
        assert_eq!(rw.port1, tuple(1).port1);
        assert_eq!(peer.rewritten().unwrap(), &rw.reverse());
        assert_eq!(fwd.nat_port(), Some(2000));
        assert_eq!(peer.nat_port(), None);
    }

    #[test]
    fn test_insert_lookup_same_entry() {
        let table = FlowTable::new(16);
        let (fwd, peer) = FlowEntry::pair(tuple(1), None, 60);
        table.insert_pair(fwd, peer).unwrap();
        assert_eq!(table.len(), 2);

        let a = table.lookup(&tuple(1)).unwrap();
        let b = table.lookup(&tuple(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.record_packet(60);
        assert_eq!(b.packets(), 2);

        let p = table.peer_of(&a).unwrap();
        assert!(Arc::ptr_eq(&table.peer_of(&p).unwrap(), &a));
    }

    #[test]
    fn test_duplicate_insert() {
        let table = FlowTable::new(16);
        let (fwd, peer) = FlowEntry::pair(tuple(1), None, 60);
        table.insert_pair(fwd, peer).unwrap();

        let (fwd, peer) = FlowEntry::pair(tuple(1), None, 60);
        assert_eq!(table.insert_pair(fwd, peer).unwrap_err(), TableError::AlreadyExists);
        // the same connection seen from the other side collides as well
        let (fwd, peer) = FlowEntry::pair(tuple(1).reverse(), None, 60);
        assert_eq!(table.insert_pair(fwd, peer).unwrap_err(), TableError::AlreadyExists);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_pair_rollback_when_second_half_exists() {
        let table = FlowTable::new(16);
        let t = tuple(1);
        let (lo, hi) = if t < t.reverse() { (t, t.reverse()) } else { (t.reverse(), t) };
        let (stale, _) = FlowEntry::pair(hi, None, 0);
        table.insert(stale).unwrap();

        let (fwd, peer) = FlowEntry::pair(lo, None, 0);
        assert_eq!(table.insert_pair(fwd, peer).unwrap_err(), TableError::AlreadyExists);
        assert!(table.lookup(&lo).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_full() {
        let table = FlowTable::new(3);
        let (fwd, peer) = FlowEntry::pair(tuple(1), None, 0);
        table.insert_pair(fwd, peer).unwrap();
        let (fwd, peer) = FlowEntry::pair(tuple(2), None, 0);
        assert_eq!(table.insert_pair(fwd, peer).unwrap_err(), TableError::TableFull);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_and_drain() {
        let table = FlowTable::new(16);
        for n in 0..3 {
            let (fwd, peer) = FlowEntry::pair(tuple(n), None, 0);
            table.insert_pair(fwd, peer).unwrap();
        }
        let e = table.remove(&tuple(0)).unwrap();
        assert_eq!(e.tuple(), &tuple(0));
        assert!(table.remove(&tuple(0)).is_none());
        assert_eq!(table.iter().len(), 5);

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_exact_ignores_replacement() {
        let table = FlowTable::new(16);
        let (old, _) = FlowEntry::pair(tuple(1), None, 0);
        let old = table.insert(old).unwrap();
        table.remove(&tuple(1));
        let (new, _) = FlowEntry::pair(tuple(1), None, 0);
        table.insert(new).unwrap();

        assert!(!table.remove_exact(&old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_status_transitions() {
        let (e, _) = FlowEntry::pair(tuple(1), None, 0);
        assert_eq!(e.status(), OffloadStatus::NotOffloaded);
        assert!(!e.finish_offload());
        assert!(e.try_begin_offload());
        assert!(!e.try_begin_offload());
        assert!(e.revert_offload());
        assert_eq!(e.status(), OffloadStatus::NotOffloaded);
        assert!(e.try_begin_offload());
        assert!(e.finish_offload());
        assert_eq!(e.status(), OffloadStatus::Offloaded);
        assert!(!e.try_begin_offload());
        assert!(!e.revert_offload());
        assert!(e.withdraw_offload());
        assert_eq!(e.status(), OffloadStatus::NotOffloaded);
        assert!(!e.withdraw_offload());
    }

    #[test]
    fn test_concurrent_insert_one_winner() {
        use std::thread;

        let table = Arc::new(FlowTable::new(1 << 16));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                let mut won = 0;
                for n in 0..1000 {
                    let (fwd, peer) = FlowEntry::pair(tuple(n), None, 0);
                    if table.insert_pair(fwd, peer).is_ok() {
                        won += 1;
                    }
                }
                won
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000);
        assert_eq!(table.len(), 2000);
    }

    proptest! {
        #[test]
        fn prop_peer_links_are_mutual(
            addr1 in any::<u32>(),
            addr2 in any::<u32>(),
            port1 in any::<u16>(),
            port2 in any::<u16>(),
            nat_port in any::<u16>(),
            udp in any::<bool>(),
        ) {
            let proto = if udp { IPPROTO_UDP } else { IPPROTO_TCP };
            let t = FlowTuple::new(proto, addr1, addr2, port1, port2);
            prop_assume!(t != t.reverse());
            let table = FlowTable::new(4);
            let (fwd, peer) = FlowEntry::pair(t, Some((NAT, nat_port)), 0);
            let (fwd, _) = table.insert_pair(fwd, peer).unwrap();

            let peer = table.peer_of(&fwd).unwrap();
            let back = table.peer_of(&peer).unwrap();
            prop_assert!(Arc::ptr_eq(&back, &fwd));
            prop_assert!(fwd.tuple().is_reverse_of(peer.tuple()));
            prop_assert_eq!(
                peer.rewritten().copied(),
                fwd.rewritten().map(|r| r.reverse())
            );
        }
    }
}
