//! Internet checksum (RFC 1071) and the TCP pseudo-header checksum.

use std::net::Ipv4Addr;

use super::tcp::CHECKSUM_OFFSET;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Running one's complement sum over 16-bit big-endian words.
///
/// Words are accumulated into a `u32` and folded on `finish`, so inputs of
/// any practical length are fine. Each `add` must start on a word boundary
/// except the last; a trailing odd byte is treated as the high byte of a
/// zero-padded word.
#[derive(Debug, Default, Clone, Copy)]
struct OnesComplement {
    sum: u32,
}

impl OnesComplement {
    fn add(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.add_word(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.add_word((*last as u16) << 8);
        }
    }

    fn add_word(&mut self, word: u16) {
        self.sum += word as u32;
        // Fold eagerly so the accumulator never overflows.
        if self.sum > 0xFFFF {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// Folded 16-bit sum, not complemented.
    fn folded(&self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }
}

/// RFC 1071 internet checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut acc = OnesComplement::default();
    acc.add(data);
    !acc.folded()
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, segment_len: usize) -> OnesComplement {
    let mut acc = OnesComplement::default();
    acc.add(&src.octets());
    acc.add(&dst.octets());
    acc.add(&[0, IPPROTO_TCP]);
    acc.add(&(segment_len as u16).to_be_bytes());
    acc
}

/// Compute the TCP checksum of `segment` sent from `src` to `dst`.
///
/// The checksum field (bytes 16-17 of the segment) is treated as zero, so a
/// segment can be checksummed whether or not the field is already filled.
pub fn tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    let mut acc = pseudo_header(src, dst, segment.len());
    if segment.len() >= CHECKSUM_OFFSET + 2 {
        acc.add(&segment[..CHECKSUM_OFFSET]);
        acc.add(&segment[CHECKSUM_OFFSET + 2..]);
    } else {
        acc.add(segment);
    }
    !acc.folded()
}

/// Check a received segment's checksum, field included.
///
/// A correct segment sums to 0xFFFF, so the complemented sum is zero.
pub fn verify_tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    let mut acc = pseudo_header(src, dst, segment.len());
    acc.add(segment);
    !acc.folded() == 0
}
