//! synping: TCP handshake latency monitor.
//!
//! Sends raw SYN segments to a remote host at a fixed cadence and matches the
//! SYN-ACK or RST replies back to their probes by acknowledgment number,
//! reporting per-probe latency or loss. No connection is ever completed.
//! Usable as a library or via the CLI.

pub mod cli;
pub mod packet;
pub mod probe;
pub mod session;
pub mod timing;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Re-export key types for library users.
pub use probe::listener::{ListenError, ReplyListener};
pub use probe::sender::{ProbeError, ProbeSender};
pub use probe::tracker::{PendingProbe, ProbeTracker, SharedTracker};
pub use session::{Session, SessionConfig, SessionError};
pub use timing::{SessionSummary, TimingStats};

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// A point in time captured on both clocks.
///
/// Latency is always computed from the monotonic `instant`; `wall` is only
/// for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    /// Capture the current time.
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// The same timestamp shifted forward by `delta` on both clocks.
    pub fn after(&self, delta: Duration) -> Self {
        let wall_delta =
            chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            instant: self.instant + delta,
            wall: self.wall + wall_delta,
        }
    }

    /// Monotonic time elapsed from `earlier` to `self`, zero if reversed.
    pub fn since(&self, earlier: &Timestamp) -> Duration {
        self.instant.saturating_duration_since(earlier.instant)
    }
}

/// Nanoseconds since the Unix epoch, 0 if out of range.
pub fn unix_nanos(t: &DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Probe results
// ─────────────────────────────────────────────────────────────────────────────

/// Which reply answered a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// SYN-ACK: the port is open.
    SynAck,
    /// RST: the port is closed, but the host answered.
    Rst,
}

impl std::fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SynAck => write!(f, "syn-ack"),
            Self::Rst => write!(f, "rst"),
        }
    }
}

/// Why a probe was reported lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// No reply within the configured per-probe timeout.
    Timeout,
    /// Still pending when the session stopped.
    Shutdown,
    /// The SYN could not be transmitted.
    SendFailed,
    /// Its sequence number was reused while still in flight, so a reply
    /// can no longer be attributed to it.
    Displaced,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::SendFailed => write!(f, "send-failed"),
            Self::Displaced => write!(f, "displaced"),
        }
    }
}

/// Final state of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Answered {
        #[serde(rename = "latency_ns", with = "duration_ns")]
        latency: Duration,
        reply: ReplyKind,
    },
    Lost {
        reason: LossReason,
    },
}

/// One line of output: a probe and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Sequence number carried by the SYN.
    pub sequence_number: u32,
    /// Destination port the SYN was sent to.
    pub destination_port: u16,
    /// Wall-clock send time.
    pub sent_at: DateTime<Utc>,
    /// Wall-clock receive time, `None` when lost.
    pub received_at: Option<DateTime<Utc>>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    /// A probe answered by `reply` at `received`.
    pub fn answered(probe: &PendingProbe, received: Timestamp, reply: ReplyKind) -> Self {
        Self {
            sequence_number: probe.sequence_number,
            destination_port: probe.destination_port,
            sent_at: probe.sent.wall,
            received_at: Some(received.wall),
            outcome: ProbeOutcome::Answered {
                latency: received.since(&probe.sent),
                reply,
            },
        }
    }

    /// A probe that will never be answered.
    pub fn lost(probe: &PendingProbe, reason: LossReason) -> Self {
        Self {
            sequence_number: probe.sequence_number,
            destination_port: probe.destination_port,
            sent_at: probe.sent.wall,
            received_at: None,
            outcome: ProbeOutcome::Lost { reason },
        }
    }

    /// Measured latency, if the probe was answered.
    pub fn latency(&self) -> Option<Duration> {
        match self.outcome {
            ProbeOutcome::Answered { latency, .. } => Some(latency),
            ProbeOutcome::Lost { .. } => None,
        }
    }

    /// Returns true if the probe got a reply.
    pub fn is_answered(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Answered { .. })
    }
}

mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ns = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(ns))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
