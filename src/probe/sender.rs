//! SYN probe construction and transmission.
//!
//! Each probe is a bare TCP header (no options, no payload) with a random
//! sequence number and only SYN set. The kernel supplies the IPv4 header, so
//! only the TCP checksum is computed here.

use std::net::Ipv4Addr;

use crate::packet::checksum::tcp_checksum;
use crate::packet::tcp::{CodecError, TcpHeader, CHECKSUM_OFFSET, SYN};
use crate::Timestamp;

use super::tracker::PendingProbe;
use super::transport::Transport;

/// Fixed source port for all probes.
pub const DEFAULT_SOURCE_PORT: u16 = 0xaa47;

/// Advertised receive window on probes.
pub const DEFAULT_WINDOW: u16 = 0xaaaa;

/// Error from sending a single probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("raw socket open failed: {0}")]
    Dial(String),

    #[error("segment write failed: {0}")]
    Write(String),

    #[error("short write: wrote {written}/{expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A probe ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedProbe {
    pub sequence_number: u32,
    pub destination_port: u16,
    /// Encoded, checksummed TCP segment.
    pub segment: Vec<u8>,
}

/// Builds and sends SYN probes from one local address to one remote host.
pub struct ProbeSender {
    local: Ipv4Addr,
    remote: Ipv4Addr,
    source_port: u16,
    window: u16,
    transport: Box<dyn Transport>,
    next_sequence: Box<dyn FnMut() -> u32 + Send>,
    probe_counter: u64,
}

impl ProbeSender {
    pub fn new(local: Ipv4Addr, remote: Ipv4Addr, transport: Box<dyn Transport>) -> Self {
        Self {
            local,
            remote,
            source_port: DEFAULT_SOURCE_PORT,
            window: DEFAULT_WINDOW,
            transport,
            next_sequence: Box::new(rand::random::<u32>),
            probe_counter: 0,
        }
    }

    /// Override the source port stamped on every probe.
    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = port;
        self
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Replace the random sequence number generator.
    pub fn with_sequence_source(mut self, source: impl FnMut() -> u32 + Send + 'static) -> Self {
        self.next_sequence = Box::new(source);
        self
    }

    /// The SYN header for a probe, checksum still zero.
    pub fn build_syn(&self, sequence_number: u32, destination_port: u16) -> TcpHeader {
        TcpHeader {
            source_port: self.source_port,
            destination_port,
            sequence_number,
            acknowledgment_number: 0,
            data_offset: 5,
            reserved: 0,
            ecn_flags: 0,
            control_flags: SYN,
            window_size: self.window,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
        }
    }

    /// Encode a SYN and fill in its checksum for `local` → `remote`.
    pub fn syn_segment(
        &self,
        sequence_number: u32,
        destination_port: u16,
    ) -> Result<Vec<u8>, ProbeError> {
        let mut segment = self.build_syn(sequence_number, destination_port).encode()?;
        let checksum = tcp_checksum(&segment, self.local, self.remote);
        segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
        Ok(segment)
    }

    /// Draw the next sequence number and build the probe segment.
    pub fn prepare(&mut self, destination_port: u16) -> Result<PreparedProbe, ProbeError> {
        let sequence_number = (self.next_sequence)();
        self.prepare_with_sequence(sequence_number, destination_port)
    }

    /// Build the probe segment for a caller-chosen sequence number.
    pub fn prepare_with_sequence(
        &self,
        sequence_number: u32,
        destination_port: u16,
    ) -> Result<PreparedProbe, ProbeError> {
        Ok(PreparedProbe {
            sequence_number,
            destination_port,
            segment: self.syn_segment(sequence_number, destination_port)?,
        })
    }

    /// Put a prepared probe on the wire.
    ///
    /// The returned entry is what the caller inserts into the tracker.
    pub fn transmit(&mut self, probe: &PreparedProbe) -> Result<PendingProbe, ProbeError> {
        let sent: Timestamp = self.transport.send_segment(self.remote, &probe.segment)?;
        self.probe_counter += 1;
        Ok(PendingProbe {
            sequence_number: probe.sequence_number,
            destination_port: probe.destination_port,
            sent,
        })
    }

    /// Prepare and transmit a probe with the next sequence number.
    pub fn send(&mut self, destination_port: u16) -> Result<PendingProbe, ProbeError> {
        let probe = self.prepare(destination_port)?;
        self.transmit(&probe)
    }

    /// Number of probes successfully transmitted.
    pub fn probe_count(&self) -> u64 {
        self.probe_counter
    }

    /// The underlying transport (downcast in tests via `as_any`).
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::verify_tcp_checksum;
    use crate::packet::tcp::{ACK, RST};
    use crate::probe::transport::MockTransport;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn sender() -> ProbeSender {
        ProbeSender::new(LOCAL, REMOTE, Box::new(MockTransport::new()))
    }

    fn mock(sender: &ProbeSender) -> &MockTransport {
        sender
            .transport()
            .as_any()
            .downcast_ref::<MockTransport>()
            .expect("transport must be MockTransport")
    }

    // ==========================================================================
    // Segment construction
    // ==========================================================================

    #[test]
    fn test_syn_segment_fields() {
        let segment = sender().syn_segment(0x01020304, 443).unwrap();
        assert_eq!(segment.len(), 20, "no options, no payload");
        let header = TcpHeader::decode(&segment).unwrap();
        assert_eq!(header.source_port, DEFAULT_SOURCE_PORT);
        assert_eq!(header.destination_port, 443);
        assert_eq!(header.sequence_number, 0x01020304);
        assert_eq!(header.acknowledgment_number, 0);
        assert_eq!(header.data_offset, 5);
        assert_eq!(header.window_size, DEFAULT_WINDOW);
        assert!(header.has_flag(SYN));
        assert!(!header.has_flag(ACK));
        assert!(!header.has_flag(RST));
    }

    #[test]
    fn test_syn_segment_checksum_verifies() {
        let segment = sender().syn_segment(1000, 80).unwrap();
        let checksum = u16::from_be_bytes([segment[16], segment[17]]);
        assert_ne!(checksum, 0, "TCP checksum must be computed");
        assert!(
            verify_tcp_checksum(&segment, LOCAL, REMOTE),
            "segment must verify against the pseudo-header it was built for"
        );
        assert!(!verify_tcp_checksum(&segment, LOCAL, Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_with_source_port() {
        let s = sender().with_source_port(50000);
        let header = TcpHeader::decode(&s.syn_segment(1, 80).unwrap()).unwrap();
        assert_eq!(header.source_port, 50000);
    }

    #[test]
    fn test_prepare_uses_fresh_sequence_numbers() {
        let mut s = sender();
        let seqs: std::collections::HashSet<u32> =
            (0..16).map(|_| s.prepare(80).unwrap().sequence_number).collect();
        assert!(seqs.len() > 1, "sequence numbers must be randomised");
    }

    #[test]
    fn test_sequence_source_override() {
        let mut next = 41u32;
        let mut s = sender().with_sequence_source(move || {
            next += 1;
            next
        });
        assert_eq!(s.prepare(80).unwrap().sequence_number, 42);
        assert_eq!(s.prepare(80).unwrap().sequence_number, 43);
    }

    #[test]
    fn test_prepared_segment_carries_sequence_number() {
        let probe = sender().prepare(8080).unwrap();
        let header = TcpHeader::decode(&probe.segment).unwrap();
        assert_eq!(header.sequence_number, probe.sequence_number);
        assert_eq!(header.destination_port, 8080);
    }

    // ==========================================================================
    // Transmission
    // ==========================================================================

    #[test]
    fn test_send_writes_segment_to_remote() {
        let mut s = sender();
        let pending = s.send(80).unwrap();
        assert_eq!(pending.destination_port, 80);
        assert_eq!(s.probe_count(), 1);

        let m = mock(&s);
        assert_eq!(m.sent_count(), 1);
        let (to, segment) = &m.sent[0];
        assert_eq!(*to, REMOTE);
        let header = TcpHeader::decode(segment).unwrap();
        assert_eq!(header.sequence_number, pending.sequence_number);
        assert_eq!(pending.expected_ack(), pending.sequence_number.wrapping_add(1));
    }

    #[test]
    fn test_transmit_failure_is_per_probe() {
        let mut failing = MockTransport::new();
        failing.fail_next_send = true;
        let mut s = ProbeSender::new(LOCAL, REMOTE, Box::new(failing));

        let probe = s.prepare_with_sequence(77, 80).unwrap();
        assert!(matches!(s.transmit(&probe), Err(ProbeError::Dial(_))));
        assert_eq!(s.probe_count(), 0);
        assert!(s.send(81).is_ok(), "next probe must go out normally");
        assert_eq!(s.probe_count(), 1);
        assert_eq!(mock(&s).sent_count(), 1);
    }

    #[test]
    fn test_send_timestamp_precedes_return() {
        let mut s = sender();
        let before = std::time::Instant::now();
        let pending = s.send(80).unwrap();
        assert!(pending.sent.instant >= before);
        assert!(pending.sent.instant <= std::time::Instant::now());
    }
}
