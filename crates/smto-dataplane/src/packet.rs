//! In-place header rewrite
//!
//! Applies a flow's rewrite tuple to an IPv4 TCP/UDP packet. The IPv4
//! header checksum is recomputed; the L4 checksum is patched incrementally
//! (RFC 1624) for every changed 16-bit word, pseudo-header included.

use crate::error::ClassifyError;
use crate::key::{FlowTuple, IPPROTO_TCP, IPPROTO_UDP};

const TCP_CSUM_OFFSET: usize = 16;
const UDP_CSUM_OFFSET: usize = 6;

/// Rewrite the packet at `l3_offset` from `from` to `to`.
///
/// `from` must be the tuple the packet classified to. Only fields that
/// differ are written.
pub fn rewrite(
    frame: &mut [u8],
    l3_offset: usize,
    from: &FlowTuple,
    to: &FlowTuple,
) -> Result<(), ClassifyError> {
    let len = frame.len();
    let ip = frame
        .get_mut(l3_offset..)
        .ok_or(ClassifyError::Truncated { needed: l3_offset, len })?;
    if ip.len() < 20 {
        return Err(ClassifyError::Truncated { needed: l3_offset + 20, len: l3_offset + ip.len() });
    }
    let ihl = ((ip[0] & 0x0F) as usize) * 4;
    let csum_at = match from.protocol {
        IPPROTO_TCP => ihl + TCP_CSUM_OFFSET,
        IPPROTO_UDP => ihl + UDP_CSUM_OFFSET,
        _ => return Err(ClassifyError::UnsupportedPacketType("not TCP/UDP")),
    };
    if ip.len() < csum_at + 2 {
        return Err(ClassifyError::Truncated {
            needed: l3_offset + csum_at + 2,
            len: l3_offset + ip.len(),
        });
    }

    let mut l4_csum = u16::from_be_bytes([ip[csum_at], ip[csum_at + 1]]);
    // a zero UDP checksum means none was computed
    let patch_l4 = !(from.protocol == IPPROTO_UDP && l4_csum == 0);

    let mut patch = |ip: &mut [u8], at: usize, old: u16, new: u16| {
        if old != new {
            ip[at..at + 2].copy_from_slice(&new.to_be_bytes());
            l4_csum = csum_update(l4_csum, old, new);
        }
    };

    patch(ip, 12, (from.addr1 >> 16) as u16, (to.addr1 >> 16) as u16);
    patch(ip, 14, from.addr1 as u16, to.addr1 as u16);
    patch(ip, 16, (from.addr2 >> 16) as u16, (to.addr2 >> 16) as u16);
    patch(ip, 18, from.addr2 as u16, to.addr2 as u16);
    patch(ip, ihl, from.port1, to.port1);
    patch(ip, ihl + 2, from.port2, to.port2);

    if patch_l4 {
        if from.protocol == IPPROTO_UDP && l4_csum == 0 {
            l4_csum = 0xFFFF;
        }
        ip[csum_at..csum_at + 2].copy_from_slice(&l4_csum.to_be_bytes());
    }

    ip[10] = 0;
    ip[11] = 0;
    let ip_csum = ipv4_checksum(&ip[..ihl]);
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    Ok(())
}

/// Incremental checksum update: HC' = ~(~HC + ~m + m')
#[inline(always)]
fn csum_update(csum: u16, old: u16, new: u16) -> u16 {
    let mut sum = (!csum) as u32 + (!old) as u32 + new as u32;
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum = (sum & 0xFFFF) + (sum >> 16);
    !(sum as u16)
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum += u16::from_be_bytes([w[0], w[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// IPv4 header checksum (checksum field must be zero)
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    !fold(sum_words(header))
}
