//! Minimal IPv4 header handling for frames read from a raw socket.
//!
//! Linux raw `IPPROTO_TCP` sockets deliver the full IPv4 datagram on
//! receive. Only enough of the header is parsed to find the TCP segment.

use std::net::Ipv4Addr;

use super::checksum::IPPROTO_TCP;
use super::tcp::CodecError;

/// Minimum IPv4 header length (IHL = 5).
pub const MIN_HEADER_LEN: usize = 20;

/// The parts of an IPv4 datagram the listener cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Frame<'a> {
    pub source: Ipv4Addr,
    /// Transport payload, truncated to the datagram's total length.
    pub payload: &'a [u8],
}

/// Split an IPv4 datagram carrying TCP into header fields and segment.
pub fn parse_tcp_datagram(frame: &[u8]) -> Result<Ipv4Frame<'_>, CodecError> {
    if frame.len() < MIN_HEADER_LEN {
        return Err(CodecError::MalformedSegment(format!(
            "IPv4 frame of {} bytes shorter than minimum header",
            frame.len()
        )));
    }
    let version = frame[0] >> 4;
    if version != 4 {
        return Err(CodecError::MalformedSegment(format!(
            "IP version {version}, expected 4"
        )));
    }
    let header_len = (frame[0] & 0x0F) as usize * 4;
    if header_len < MIN_HEADER_LEN || header_len > frame.len() {
        return Err(CodecError::MalformedSegment(format!(
            "IPv4 header length {header_len} invalid for {}-byte frame",
            frame.len()
        )));
    }
    if frame[9] != IPPROTO_TCP {
        return Err(CodecError::MalformedSegment(format!(
            "IP protocol {}, expected TCP",
            frame[9]
        )));
    }

    // Trust the smaller of the declared and received lengths.
    let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    let end = total_len.clamp(header_len, frame.len());

    Ok(Ipv4Frame {
        source: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
        payload: &frame[header_len..end],
    })
}
