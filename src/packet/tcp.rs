//! TCP header encoding and decoding.
//!
//! Pure codec: no I/O, no allocation beyond the output buffer. Multi-byte
//! fields are big-endian on the wire. Bits 96..111 of the header pack
//! `data_offset(4) | reserved(3) | ecn(3) | control(6)`.

/// FIN control flag.
pub const FIN: u8 = 0x01;
/// SYN control flag.
pub const SYN: u8 = 0x02;
/// RST control flag.
pub const RST: u8 = 0x04;
/// PSH control flag.
pub const PSH: u8 = 0x08;
/// ACK control flag.
pub const ACK: u8 = 0x10;
/// URG control flag.
pub const URG: u8 = 0x20;

/// Size of a TCP header without options.
pub const BASE_HEADER_LEN: usize = 20;

/// Largest header the 4-bit data offset can describe (15 words).
pub const MAX_HEADER_LEN: usize = 60;

/// Option kind: end of option list.
pub const OPT_END: u8 = 0;
/// Option kind: no-operation (used for padding).
pub const OPT_NOP: u8 = 1;

/// Byte offset of the checksum field within the TCP header.
pub const CHECKSUM_OFFSET: usize = 16;

/// Errors from encoding or decoding a TCP header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed TCP segment: {0}")]
    MalformedSegment(String),

    #[error("TCP options too long: {0} bytes (max 40)")]
    OptionsTooLong(usize),
}

/// A single TCP option.
///
/// `length` counts the kind and length bytes themselves. End-of-list and
/// no-op options occupy one byte on the wire and report `length == 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub length: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    /// Single-byte no-op option.
    pub fn nop() -> Self {
        Self {
            kind: OPT_NOP,
            length: 1,
            data: Vec::new(),
        }
    }

    /// Single-byte end-of-list option.
    pub fn end() -> Self {
        Self {
            kind: OPT_END,
            length: 1,
            data: Vec::new(),
        }
    }

    /// A kind/length/value option. `length` is derived from `data`.
    pub fn new(kind: u8, data: Vec<u8>) -> Self {
        let length = (data.len() + 2).min(u8::MAX as usize) as u8;
        Self { kind, length, data }
    }

    fn is_single_byte(&self) -> bool {
        self.kind == OPT_END || self.kind == OPT_NOP
    }

    /// Number of bytes this option occupies on the wire.
    pub fn wire_len(&self) -> usize {
        if self.is_single_byte() {
            1
        } else {
            2 + self.data.len()
        }
    }
}

/// A decoded TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// Header length in 32-bit words (5..=15).
    pub data_offset: u8,
    /// 3 reserved bits.
    pub reserved: u8,
    /// 3 ECN bits (NS, CWR, ECE).
    pub ecn_flags: u8,
    /// 6 control bits, see [`SYN`], [`ACK`], [`RST`] etc.
    pub control_flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    /// Whether a single control flag is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.control_flags & flag != 0
    }

    /// Length of the options once padded to a 4-byte boundary.
    fn padded_options_len(&self) -> usize {
        let raw: usize = self.options.iter().map(TcpOption::wire_len).sum();
        (raw + 3) & !3
    }

    /// Encoded length of this header, including padded options.
    pub fn encoded_len(&self) -> usize {
        BASE_HEADER_LEN + self.padded_options_len()
    }

    /// Serialize the header in network byte order.
    ///
    /// The emitted data offset is computed from the padded option length,
    /// not taken from `self.data_offset`. Options are padded with no-ops.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let options_len = self.padded_options_len();
        if BASE_HEADER_LEN + options_len > MAX_HEADER_LEN {
            return Err(CodecError::OptionsTooLong(options_len));
        }
        let total = BASE_HEADER_LEN + options_len;
        let mut buf = Vec::with_capacity(total);

        buf.extend_from_slice(&self.source_port.to_be_bytes());
        buf.extend_from_slice(&self.destination_port.to_be_bytes());
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.acknowledgment_number.to_be_bytes());

        let words = (total / 4) as u16;
        let mix = words << 12
            | ((self.reserved & 0x07) as u16) << 9
            | ((self.ecn_flags & 0x07) as u16) << 6
            | (self.control_flags & 0x3F) as u16;
        buf.extend_from_slice(&mix.to_be_bytes());

        buf.extend_from_slice(&self.window_size.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.urgent_pointer.to_be_bytes());

        for opt in &self.options {
            buf.push(opt.kind);
            if !opt.is_single_byte() {
                buf.push(opt.length);
                buf.extend_from_slice(&opt.data);
            }
        }
        buf.resize(total, OPT_NOP);

        Ok(buf)
    }

    /// Parse a TCP header from the start of `bytes`.
    ///
    /// Any payload after the header is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < BASE_HEADER_LEN {
            return Err(CodecError::MalformedSegment(format!(
                "{} bytes, need at least {BASE_HEADER_LEN}",
                bytes.len()
            )));
        }

        let mix = u16::from_be_bytes([bytes[12], bytes[13]]);
        let data_offset = (mix >> 12) as u8;
        let header_len = data_offset as usize * 4;
        if header_len < BASE_HEADER_LEN {
            return Err(CodecError::MalformedSegment(format!(
                "data offset {data_offset} below minimum of 5"
            )));
        }
        if header_len > bytes.len() {
            return Err(CodecError::MalformedSegment(format!(
                "data offset {data_offset} implies {header_len} bytes, only {} present",
                bytes.len()
            )));
        }

        let options = decode_options(&bytes[BASE_HEADER_LEN..header_len])?;

        Ok(Self {
            source_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            destination_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            sequence_number: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            acknowledgment_number: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            data_offset,
            reserved: ((mix >> 9) & 0x07) as u8,
            ecn_flags: ((mix >> 6) & 0x07) as u8,
            control_flags: (mix & 0x3F) as u8,
            window_size: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
            urgent_pointer: u16::from_be_bytes([bytes[18], bytes[19]]),
            options,
        })
    }
}

/// Decode the option area. Trailing no-ops that only pad the last option
/// out to a word boundary are padding, not options, and are dropped; this
/// is the exact inverse of the padding `encode` adds.
fn decode_options(area: &[u8]) -> Result<Vec<TcpOption>, CodecError> {
    let mut options = Vec::new();
    let mut pos = 0;
    // Offset just past the last kind/length/value option, and the option
    // count at that point.
    let mut last_end = 0;
    let mut kept = 0;

    while let Some(&kind) = area.get(pos) {
        match kind {
            OPT_END => {
                // Whatever follows end-of-list is padding.
                options.push(TcpOption::end());
                return Ok(options);
            }
            OPT_NOP => {
                options.push(TcpOption::nop());
                pos += 1;
            }
            _ => {
                let length = *area.get(pos + 1).ok_or_else(|| {
                    CodecError::MalformedSegment(format!("option {kind} truncated before length"))
                })? as usize;
                if length < 2 || pos + length > area.len() {
                    return Err(CodecError::MalformedSegment(format!(
                        "option {kind} has invalid length {length}"
                    )));
                }
                options.push(TcpOption {
                    kind,
                    length: length as u8,
                    data: area[pos + 2..pos + length].to_vec(),
                });
                pos += length;
                last_end = pos;
                kept = options.len();
            }
        }
    }

    if last_end % 4 != 0 && (last_end + 3) & !3 == area.len() {
        options.truncate(kept);
    }
    Ok(options)
}
