//! Probe scheduler.
//!
//! One call to [`Scheduler::tick`] per interval: send a probe to the current
//! port, track it, advance the port, and sweep probes past their timeout.

use std::time::{Duration, Instant};

use crate::{LossReason, ProbeResult, Timestamp};

use super::sender::ProbeSender;
use super::tracker::{PendingProbe, SharedTracker};

pub struct Scheduler {
    sender: ProbeSender,
    tracker: SharedTracker,
    next_port: u16,
    timeout: Option<Duration>,
    sent: u64,
}

impl Scheduler {
    /// `timeout` of `None` disables the sweep; loss is then only reported
    /// when the session drains the tracker.
    pub fn new(
        sender: ProbeSender,
        tracker: SharedTracker,
        first_port: u16,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            sender,
            tracker,
            next_port: first_port,
            timeout,
            sent: 0,
        }
    }

    /// Fire one probe and collect the losses this tick produced.
    ///
    /// A probe that fails to transmit is returned as `Lost(SendFailed)` and
    /// never enters the tracker. An entry pushed out by a reused sequence
    /// number is returned as `Lost(Displaced)`.
    pub async fn tick(&mut self) -> Vec<ProbeResult> {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        self.sent += 1;

        let mut results = Vec::new();

        // Held across the write: a reply that beats the insert would
        // otherwise find nothing pending. The write blocks this worker for
        // a few syscalls once per interval; the listener thread is the only
        // other lock holder.
        let mut tracker = self.tracker.lock().await;
        let sent = match self.sender.prepare(port) {
            Ok(probe) => self
                .sender
                .transmit(&probe)
                .map_err(|e| (probe.sequence_number, e)),
            // Nothing went out, so there is no sequence number to report.
            Err(e) => Err((0, e)),
        };

        match sent {
            Ok(pending) => {
                tracing::debug!(
                    sequence_number = pending.sequence_number,
                    port,
                    "probe sent"
                );
                if let Some(old) = tracker.insert(pending) {
                    results.push(ProbeResult::lost(&old, LossReason::Displaced));
                }
            }
            Err((sequence_number, e)) => {
                tracing::warn!(error = %e, port, "probe send failed");
                let failed = PendingProbe {
                    sequence_number,
                    destination_port: port,
                    sent: Timestamp::now(),
                };
                results.push(ProbeResult::lost(&failed, LossReason::SendFailed));
            }
        }

        if let Some(timeout) = self.timeout {
            let expired = tracker.expire(Instant::now(), timeout);
            results.extend(
                expired
                    .iter()
                    .map(|p| ProbeResult::lost(p, LossReason::Timeout)),
            );
        }

        results
    }

    /// Destination port the next tick will probe.
    pub fn next_port(&self) -> u16 {
        self.next_port
    }

    /// Number of ticks fired, including probes that failed to send.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn sender(&self) -> &ProbeSender {
        &self.sender
    }
}
