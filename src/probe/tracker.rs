//! In-flight probe table.
//!
//! The scheduler inserts an entry for every SYN it sends; the reply listener
//! removes entries as SYN-ACK/RST replies arrive; the scheduler's sweep and
//! the shutdown path remove whatever is left. Entries are never updated in
//! place.
//!
//! Entries are keyed by the probe's sequence number. A reply acknowledges
//! `sequence_number + 1`, so the listener looks up `ack − 1`
//! (see [`correlation_key`]). Both directions wrap at 2^32.
//!
//! Two probes in flight with the same random sequence number would collide
//! on one key. At one probe per interval this is an accepted approximation:
//! the newer entry takes the key and the older one is handed back to the
//! caller, which reports it lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::Timestamp;

/// Tracker shared between the scheduler task and the listener thread.
pub type SharedTracker = Arc<Mutex<ProbeTracker>>;

/// Create a new empty shared tracker.
pub fn new_shared_tracker() -> SharedTracker {
    Arc::new(Mutex::new(ProbeTracker::new()))
}

/// Key under which a reply with acknowledgment number `ack` is looked up.
pub fn correlation_key(ack: u32) -> u32 {
    ack.wrapping_sub(1)
}

/// A SYN that has been sent and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProbe {
    pub sequence_number: u32,
    pub destination_port: u16,
    /// Captured immediately before the segment was written.
    pub sent: Timestamp,
}

impl PendingProbe {
    /// Acknowledgment number a genuine reply to this probe carries.
    pub fn expected_ack(&self) -> u32 {
        self.sequence_number.wrapping_add(1)
    }
}

/// Map of in-flight probes, keyed by sequence number.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    pending: HashMap<u32, PendingProbe>,
}

impl ProbeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent probe.
    ///
    /// Returns the entry it displaced if another probe with the same
    /// sequence number was still in flight.
    pub fn insert(&mut self, probe: PendingProbe) -> Option<PendingProbe> {
        let displaced = self.pending.insert(probe.sequence_number, probe);
        if let Some(old) = &displaced {
            tracing::warn!(
                sequence_number = old.sequence_number,
                port = old.destination_port,
                "correlation key collision, older probe displaced"
            );
        }
        displaced
    }

    /// Remove and return the probe a reply with acknowledgment `ack` answers.
    pub fn resolve(&mut self, ack: u32) -> Option<PendingProbe> {
        self.pending.remove(&correlation_key(ack))
    }

    /// Whether a reply carrying `ack` would match an in-flight probe.
    pub fn is_pending(&self, ack: u32) -> bool {
        self.pending.contains_key(&correlation_key(ack))
    }

    /// Remove and return every probe sent at least `timeout` before `now`,
    /// oldest first.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingProbe> {
        let expired_keys: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent.instant) >= timeout)
            .map(|(&k, _)| k)
            .collect();

        let mut expired: Vec<PendingProbe> = expired_keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect();
        expired.sort_by_key(|p| p.sent.instant);
        expired
    }

    /// Remove and return every pending probe, oldest first.
    pub fn drain(&mut self) -> Vec<PendingProbe> {
        let mut all: Vec<PendingProbe> = self.pending.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.sent.instant);
        all
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
