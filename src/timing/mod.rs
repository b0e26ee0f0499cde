//! Latency accounting for a probing session.

pub mod stats;

pub use stats::{as_micros_f64, calculate_stats, mean, percentile, std_dev};

use serde::{Deserialize, Serialize};

use crate::{LossReason, ProbeOutcome, ProbeResult, ReplyKind};

/// Latency statistics, all values in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub p50: f64,
    pub p90: f64,
}

impl TimingStats {
    pub fn empty() -> Self {
        Self {
            samples: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
            p50: 0.0,
            p90: 0.0,
        }
    }
}

/// Running totals for one session, fed every reported result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Probes the scheduler attempted, including failed sends.
    pub sent: u64,
    pub syn_ack: u64,
    pub rst: u64,
    pub timed_out: u64,
    pub unanswered_at_shutdown: u64,
    pub send_failed: u64,
    /// Entries pushed out of the tracker by a reused sequence number.
    pub displaced: u64,
    /// Answered latencies in microseconds, in arrival order.
    #[serde(skip)]
    latencies_us: Vec<f64>,
}

impl SessionSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &ProbeResult) {
        match result.outcome {
            ProbeOutcome::Answered { latency, reply } => {
                match reply {
                    ReplyKind::SynAck => self.syn_ack += 1,
                    ReplyKind::Rst => self.rst += 1,
                }
                self.latencies_us.push(as_micros_f64(latency));
            }
            ProbeOutcome::Lost { reason } => match reason {
                LossReason::Timeout => self.timed_out += 1,
                LossReason::Shutdown => self.unanswered_at_shutdown += 1,
                LossReason::SendFailed => self.send_failed += 1,
                LossReason::Displaced => self.displaced += 1,
            },
        }
    }

    pub fn answered(&self) -> u64 {
        self.syn_ack + self.rst
    }

    pub fn lost(&self) -> u64 {
        self.timed_out + self.unanswered_at_shutdown + self.send_failed + self.displaced
    }

    /// Lost share of all resolved probes, 0 when nothing resolved.
    pub fn loss_percent(&self) -> f64 {
        let resolved = self.answered() + self.lost();
        if resolved == 0 {
            return 0.0;
        }
        self.lost() as f64 * 100.0 / resolved as f64
    }

    pub fn stats(&self) -> TimingStats {
        calculate_stats(&self.latencies_us)
    }
}
