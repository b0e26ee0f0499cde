//! Reply listener.
//!
//! Reads raw IPv4 frames, keeps those sent by the probed host, and resolves
//! SYN-ACK (open port) and RST (closed port) replies against the tracker.
//!
//! Replies are not correlated by port: the scheduler walks the destination
//! port between probes, and the acknowledgment number alone identifies the
//! probe. A frame from any other host is dropped before it is decoded.

use std::net::Ipv4Addr;

use tokio::sync::{mpsc, oneshot};

use crate::packet::ipv4::parse_tcp_datagram;
use crate::packet::tcp::{CodecError, TcpHeader, ACK, RST, SYN};
use crate::{ProbeResult, ReplyKind, Timestamp};

use super::tracker::{correlation_key, ProbeTracker, SharedTracker};
use super::transport::{FrameSource, RECV_BUFFER_LEN};

/// Errors from the listening socket. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("raw socket creation failed: {0}")]
    Socket(String),

    #[error("failed to bind raw socket to {addr}: {reason}")]
    Bind { addr: Ipv4Addr, reason: String },

    #[error("raw socket read failed: {0}")]
    Read(String),

    #[error("failed to start listener thread: {0}")]
    Thread(String),
}

/// What the listener did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameDisposition {
    /// Sent by a host other than the probed one.
    ForeignSource(Ipv4Addr),
    /// Could not be parsed as IPv4/TCP.
    Malformed(CodecError),
    /// TCP, but neither RST nor SYN+ACK.
    NotAReply { control_flags: u8 },
    /// A reply whose acknowledgment number matches no pending probe.
    Unexpected { acknowledgment_number: u32 },
    /// A reply that resolved a pending probe.
    Resolved(ProbeResult),
}

/// Classify a TCP header as a probe reply.
pub fn reply_kind(header: &TcpHeader) -> Option<ReplyKind> {
    if header.has_flag(RST) {
        Some(ReplyKind::Rst)
    } else if header.has_flag(SYN) && header.has_flag(ACK) {
        Some(ReplyKind::SynAck)
    } else {
        None
    }
}

/// Matches replies from one remote host against the shared tracker.
pub struct ReplyListener {
    remote: Ipv4Addr,
    tracker: SharedTracker,
    results: mpsc::UnboundedSender<ProbeResult>,
}

impl ReplyListener {
    pub fn new(
        remote: Ipv4Addr,
        tracker: SharedTracker,
        results: mpsc::UnboundedSender<ProbeResult>,
    ) -> Self {
        Self {
            remote,
            tracker,
            results,
        }
    }

    /// Handle one raw frame received from `from` at `received`.
    ///
    /// Only a `Resolved` outcome touches the tracker.
    pub fn handle_frame(
        &self,
        tracker: &mut ProbeTracker,
        frame: &[u8],
        from: Ipv4Addr,
        received: Timestamp,
    ) -> FrameDisposition {
        if from != self.remote {
            return FrameDisposition::ForeignSource(from);
        }

        let header = match parse_tcp_datagram(frame).and_then(|ip| TcpHeader::decode(ip.payload))
        {
            Ok(h) => h,
            Err(e) => return FrameDisposition::Malformed(e),
        };

        let Some(kind) = reply_kind(&header) else {
            return FrameDisposition::NotAReply {
                control_flags: header.control_flags,
            };
        };

        match tracker.resolve(header.acknowledgment_number) {
            Some(probe) => FrameDisposition::Resolved(ProbeResult::answered(&probe, received, kind)),
            None => FrameDisposition::Unexpected {
                acknowledgment_number: header.acknowledgment_number,
            },
        }
    }

    /// Read frames from `source` until it fails.
    ///
    /// Never returns under normal operation; the returned error is the read
    /// failure that stopped the loop. Must run on a blocking thread, not
    /// inside the async runtime.
    pub fn run<S: FrameSource + ?Sized>(&self, source: &mut S) -> ListenError {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (n, from) = match source.recv_frame(&mut buf) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "reply listener stopped");
                    return e;
                }
            };
            let received = Timestamp::now();

            let mut tracker = self.tracker.blocking_lock();
            let disposition = self.handle_frame(&mut tracker, &buf[..n], from, received);
            if let FrameDisposition::Resolved(result) = &disposition {
                // Queued before the lock is released, so an empty tracker
                // means every answer is already in the channel.
                let _ = self.results.send(result.clone());
            }
            drop(tracker);

            match disposition {
                FrameDisposition::Resolved(result) => {
                    tracing::debug!(
                        sequence_number = result.sequence_number,
                        port = result.destination_port,
                        latency = ?result.latency(),
                        "probe answered"
                    );
                }
                FrameDisposition::Unexpected {
                    acknowledgment_number,
                } => {
                    tracing::warn!(
                        ack = acknowledgment_number,
                        key = correlation_key(acknowledgment_number),
                        "unexpected packet, not pending"
                    );
                }
                FrameDisposition::Malformed(e) => {
                    tracing::debug!(error = %e, %from, "discarding malformed frame");
                }
                FrameDisposition::NotAReply { control_flags } => {
                    tracing::trace!(flags = control_flags, "ignoring non-reply segment");
                }
                FrameDisposition::ForeignSource(_) => {}
            }
        }
    }

    /// Run the listener on a dedicated OS thread.
    ///
    /// The returned receiver completes with the fatal error if the loop
    /// stops. The thread is never joined; it is abandoned at process exit.
    pub fn spawn<S: FrameSource + 'static>(
        self,
        mut source: S,
    ) -> Result<oneshot::Receiver<ListenError>, ListenError> {
        let (failed_tx, failed_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("reply-listener".into())
            .spawn(move || {
                let err = self.run(&mut source);
                let _ = failed_tx.send(err);
            })
            .map_err(|e| ListenError::Thread(e.to_string()))?;
        Ok(failed_rx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::packet::tcp::{TcpOption, FIN, PSH};
    use crate::probe::tracker::{new_shared_tracker, PendingProbe};
    use crate::probe::transport::MockFrameSource;
    use crate::ProbeOutcome;

    pub(crate) const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    pub(crate) const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    /// IPv4 datagram from `src` carrying a reply segment with `flags` and `ack`.
    pub(crate) fn reply_frame(src: Ipv4Addr, flags: u8, ack: u32) -> Vec<u8> {
        let tcp = TcpHeader {
            source_port: 80,
            destination_port: 0xaa47,
            sequence_number: 0x5000,
            acknowledgment_number: ack,
            data_offset: 6,
            reserved: 0,
            ecn_flags: 0,
            control_flags: flags,
            window_size: 64240,
            checksum: 0,
            urgent_pointer: 0,
            options: vec![TcpOption::new(2, vec![0x05, 0xb4])],
        }
        .encode()
        .unwrap();

        let mut frame = vec![0u8; 20];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&((20 + tcp.len()) as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 6;
        frame[12..16].copy_from_slice(&src.octets());
        frame[16..20].copy_from_slice(&LOCAL.octets());
        frame.extend_from_slice(&tcp);
        frame
    }

    fn listener() -> (ReplyListener, mpsc::UnboundedReceiver<ProbeResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyListener::new(REMOTE, new_shared_tracker(), tx), rx)
    }

    fn pending(seq: u32, sent: Timestamp) -> PendingProbe {
        PendingProbe {
            sequence_number: seq,
            destination_port: 80,
            sent,
        }
    }

    // ==========================================================================
    // Frame classification
    // ==========================================================================

    #[test]
    fn test_syn_ack_resolves_with_latency() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        let sent = Timestamp::now();
        tracker.insert(pending(1000, sent));

        let received = sent.after(Duration::from_millis(5));
        let frame = reply_frame(REMOTE, SYN | ACK, 1001);
        match l.handle_frame(&mut tracker, &frame, REMOTE, received) {
            FrameDisposition::Resolved(result) => {
                assert_eq!(result.sequence_number, 1000);
                assert_eq!(
                    result.outcome,
                    ProbeOutcome::Answered {
                        latency: Duration::from_millis(5),
                        reply: ReplyKind::SynAck,
                    }
                );
                assert_eq!(result.received_at, Some(received.wall));
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
        assert!(tracker.is_empty(), "resolved probe must be removed");
    }

    #[test]
    fn test_rst_resolves_as_closed() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        tracker.insert(pending(12345, Timestamp::now()));

        let frame = reply_frame(REMOTE, RST | ACK, 12346);
        let d = l.handle_frame(&mut tracker, &frame, REMOTE, Timestamp::now());
        match d {
            FrameDisposition::Resolved(r) => {
                assert!(matches!(r.outcome, ProbeOutcome::Answered { reply: ReplyKind::Rst, .. }));
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_rst_counts_as_reply() {
        assert_eq!(reply_kind(&decode(RST)), Some(ReplyKind::Rst));
        assert_eq!(reply_kind(&decode(SYN | ACK)), Some(ReplyKind::SynAck));
        assert_eq!(reply_kind(&decode(SYN)), None);
        assert_eq!(reply_kind(&decode(ACK)), None);
        assert_eq!(reply_kind(&decode(FIN | ACK)), None);
    }

    fn decode(flags: u8) -> TcpHeader {
        let frame = reply_frame(REMOTE, flags, 1);
        TcpHeader::decode(&frame[20..]).unwrap()
    }

    #[test]
    fn test_wrong_ack_is_unexpected_and_leaves_tracker() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        tracker.insert(pending(12345, Timestamp::now()));

        for ack in [12345u32, 12347, 0] {
            let frame = reply_frame(REMOTE, SYN | ACK, ack);
            let d = l.handle_frame(&mut tracker, &frame, REMOTE, Timestamp::now());
            assert_eq!(
                d,
                FrameDisposition::Unexpected {
                    acknowledgment_number: ack
                }
            );
        }
        assert_eq!(tracker.len(), 1, "unmatched replies must not mutate tracker");
    }

    #[test]
    fn test_foreign_source_never_touches_tracker() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        tracker.insert(pending(1000, Timestamp::now()));

        let other = Ipv4Addr::new(10, 0, 0, 99);
        let frame = reply_frame(other, SYN | ACK, 1001);
        let d = l.handle_frame(&mut tracker, &frame, other, Timestamp::now());
        assert_eq!(d, FrameDisposition::ForeignSource(other));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_non_reply_flags_never_touch_tracker() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        tracker.insert(pending(1000, Timestamp::now()));

        for flags in [SYN, ACK, FIN | ACK, PSH | ACK, 0] {
            let frame = reply_frame(REMOTE, flags, 1001);
            let d = l.handle_frame(&mut tracker, &frame, REMOTE, Timestamp::now());
            assert_eq!(d, FrameDisposition::NotAReply { control_flags: flags });
        }
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_malformed_frame_is_discarded() {
        let (l, _rx) = listener();
        let mut tracker = ProbeTracker::new();
        tracker.insert(pending(1000, Timestamp::now()));

        let mut frame = reply_frame(REMOTE, SYN | ACK, 1001);
        frame.truncate(30); // TCP header cut short
        let d = l.handle_frame(&mut tracker, &frame, REMOTE, Timestamp::now());
        assert!(matches!(d, FrameDisposition::Malformed(_)));
        assert_eq!(tracker.len(), 1);
    }

    // ==========================================================================
    // Read loop
    // ==========================================================================

    #[test]
    fn test_run_resolves_and_reports_until_read_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = new_shared_tracker();
        let l = ReplyListener::new(REMOTE, tracker.clone(), tx);
        {
            let mut t = tracker.blocking_lock();
            t.insert(pending(1000, Timestamp::now()));
            t.insert(pending(2000, Timestamp::now()));
        }

        let mut source = MockFrameSource::from_frames(vec![
            (vec![0x45, 0x00], REMOTE),                       // malformed
            (reply_frame(REMOTE, SYN | ACK, 1001), REMOTE),   // resolves 1000
            (reply_frame(REMOTE, SYN | ACK, 1001), REMOTE),   // duplicate, unexpected
            (reply_frame(LOCAL, RST, 2001), LOCAL),           // wrong host
        ]);

        let err = l.run(&mut source);
        assert!(matches!(err, ListenError::Read(_)), "loop ends on read error");

        let result = rx.try_recv().expect("one result must be reported");
        assert_eq!(result.sequence_number, 1000);
        assert!(rx.try_recv().is_err(), "exactly one result");
        assert_eq!(tracker.blocking_lock().len(), 1, "probe 2000 still pending");
    }

    #[test]
    fn test_spawn_reports_fatal_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let l = ReplyListener::new(REMOTE, new_shared_tracker(), tx);
        let failed = l.spawn(MockFrameSource::from_frames(vec![])).unwrap();
        let err = failed.blocking_recv().expect("listener must report its failure");
        assert!(matches!(err, ListenError::Read(_)));
    }
}
