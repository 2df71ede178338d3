//! Flow Key Codec
//!
//! Extracts the IPv4 5-tuple from a raw frame with a single masked 128-bit
//! load over IPv4 header bytes 8..24 (TTL, protocol, checksum, addresses and,
//! for option-less headers, the L4 ports). TTL and checksum are masked out.

use crate::error::ClassifyError;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::net::Ipv4Addr;

/// Ethernet header length (no VLAN)
pub const ETHER_HDR_LEN: usize = 14;

/// IPv4 EtherType
pub const ETHER_TYPE_IPV4: u16 = 0x0800;

/// IP protocol numbers
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Minimum IPv4 header length
pub const IPV4_MIN_HDR_LEN: usize = 20;

const TUPLE_WINDOW_OFFSET: usize = 8;
const TUPLE_WINDOW_LEN: usize = 16;
const TUPLE_WINDOW_MASK: u128 = 0x00FF_0000_FFFF_FFFF_FFFF_FFFF_FFFF_FFFF;

/// IPv4 5-tuple identifying one direction of a flow
///
/// Values are in host byte order. `addr1`/`port1` is the source side of
/// the packets this tuple matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowTuple {
    /// IP protocol (TCP=6, UDP=17)
    pub protocol: u8,
    /// Source address
    pub addr1: u32,
    /// Destination address
    pub addr2: u32,
    /// Source port
    pub port1: u16,
    /// Destination port
    pub port2: u16,
}

impl FlowTuple {
    #[inline(always)]
    pub const fn new(protocol: u8, addr1: u32, addr2: u32, port1: u16, port2: u16) -> Self {
        Self {
            protocol,
            addr1,
            addr2,
            port1,
            port2,
        }
    }

    /// Tuple of the reply direction
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self::new(self.protocol, self.addr2, self.addr1, self.port2, self.port1)
    }

    /// True when `other` is this tuple with endpoints swapped
    #[inline]
    pub fn is_reverse_of(&self, other: &FlowTuple) -> bool {
        self.reverse() == *other
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr1)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr2)
    }

    /// FNV-1a over the tuple fields
    #[inline]
    pub fn hash_value(&self) -> u64 {
        let mut h = FlowHasher::default();
        std::hash::Hash::hash(self, &mut h);
        h.finish()
    }

    /// Render with the receive queue appended, for worker logs
    pub fn with_queue(&self, queue: u16) -> QueueTagged<'_> {
        QueueTagged { tuple: self, queue }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-({})-{}:{}",
            self.src_addr(),
            self.port1,
            self.protocol,
            self.dst_addr(),
            self.port2
        )
    }
}

/// Tuple plus queue id
pub struct QueueTagged<'a> {
    tuple: &'a FlowTuple,
    queue: u16,
}

impl fmt::Display for QueueTagged<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - queue=0x{:x}", self.tuple, self.queue)
    }
}

/// Classify an Ethernet frame
pub fn classify(frame: &[u8]) -> Result<FlowTuple, ClassifyError> {
    if frame.len() < ETHER_HDR_LEN {
        return Err(ClassifyError::Truncated {
            needed: ETHER_HDR_LEN,
            len: frame.len(),
        });
    }
    let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    if ether_type != ETHER_TYPE_IPV4 {
        return Err(ClassifyError::UnsupportedPacketType("not IPv4"));
    }
    extract(frame, ETHER_HDR_LEN)
}

/// Extract the 5-tuple of the IPv4 header at `l3_offset`
#[inline]
pub fn extract(packet: &[u8], l3_offset: usize) -> Result<FlowTuple, ClassifyError> {
    let min = l3_offset + IPV4_MIN_HDR_LEN;
    if packet.len() < min {
        return Err(ClassifyError::Truncated {
            needed: min,
            len: packet.len(),
        });
    }

    let ip = &packet[l3_offset..];
    if ip[0] >> 4 != 4 {
        return Err(ClassifyError::UnsupportedPacketType("not IPv4"));
    }
    let ihl = ((ip[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HDR_LEN {
        return Err(ClassifyError::UnsupportedPacketType("bad IPv4 header length"));
    }
    if u16::from_be_bytes([ip[6], ip[7]]) & 0x1FFF != 0 {
        return Err(ClassifyError::UnsupportedPacketType("IPv4 fragment"));
    }
    let protocol = ip[9];
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return Err(ClassifyError::UnsupportedPacketType("not TCP/UDP"));
    }
    // ports sit right after the (possibly optioned) IP header
    let needed = l3_offset + ihl + 4;
    if packet.len() < needed {
        return Err(ClassifyError::Truncated {
            needed,
            len: packet.len(),
        });
    }

    let mut window = [0u8; TUPLE_WINDOW_LEN];
    window.copy_from_slice(&ip[TUPLE_WINDOW_OFFSET..TUPLE_WINDOW_OFFSET + TUPLE_WINDOW_LEN]);
    let word = u128::from_be_bytes(window) & TUPLE_WINDOW_MASK;

    let ports = if ihl == IPV4_MIN_HDR_LEN {
        word as u32
    } else {
        u32::from_be_bytes([ip[ihl], ip[ihl + 1], ip[ihl + 2], ip[ihl + 3]])
    };

    Ok(FlowTuple {
        protocol: (word >> 112) as u8,
        addr1: (word >> 64) as u32,
        addr2: (word >> 32) as u32,
        port1: (ports >> 16) as u16,
        port2: ports as u16,
    })
}

/// FNV-1a hasher used for the flow table
#[derive(Clone, Copy)]
pub struct FlowHasher(u64);

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl Default for FlowHasher {
    #[inline]
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Hasher for FlowHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// `BuildHasher` for maps keyed by [`FlowTuple`]
pub type FlowBuildHasher = BuildHasherDefault<FlowHasher>;
