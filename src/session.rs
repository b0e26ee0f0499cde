//! A probing session: listener thread, scheduler loop, shutdown drain.
//!
//! [`Session::run`] owns the tracker for its lifetime. It starts the reply
//! listener on its own thread, fires the scheduler on every interval tick,
//! forwards every result to the caller's `report` callback, and stops on the
//! shutdown future, on a fatal listener error, or once a configured probe
//! count has been sent and the linger period has passed.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::probe::listener::{ListenError, ReplyListener};
use crate::probe::scheduler::Scheduler;
use crate::probe::sender::{ProbeSender, DEFAULT_SOURCE_PORT, DEFAULT_WINDOW};
use crate::probe::tracker::new_shared_tracker;
use crate::probe::transport::{FrameSource, Transport};
use crate::timing::SessionSummary;
use crate::{LossReason, ProbeResult};

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Far enough out that an idle linger timer never fires.
const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("reply listener failed: {0}")]
    Listener(#[from] ListenError),
}

/// Resolved parameters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    /// Destination port of the first probe; each later probe uses the next.
    pub first_port: u16,
    pub interval: Duration,
    /// Per-probe loss timeout. `None` reports loss only at shutdown.
    pub timeout: Option<Duration>,
    /// Stop after this many probes. `None` runs until shutdown.
    pub count: Option<u64>,
    pub source_port: u16,
    pub window: u16,
}

impl SessionConfig {
    pub fn new(local: Ipv4Addr, remote: Ipv4Addr) -> Self {
        Self {
            local,
            remote,
            first_port: DEFAULT_PORT,
            interval: DEFAULT_INTERVAL,
            timeout: Some(DEFAULT_TIMEOUT),
            count: None,
            source_port: DEFAULT_SOURCE_PORT,
            window: DEFAULT_WINDOW,
        }
    }

    /// How long to keep listening after the last probe of a counted run.
    pub fn linger(&self) -> Duration {
        self.timeout.unwrap_or(self.interval)
    }
}

pub struct Session {
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run until `shutdown` completes, the probe count is exhausted, or the
    /// listener fails.
    ///
    /// Every result, including the losses drained at the end, is passed to
    /// `report` exactly once and folded into the returned summary.
    pub async fn run<S, F, R>(
        self,
        transport: Box<dyn Transport>,
        source: S,
        shutdown: F,
        mut report: R,
    ) -> Result<SessionSummary, SessionError>
    where
        S: FrameSource + 'static,
        F: Future<Output = ()>,
        R: FnMut(&ProbeResult),
    {
        let cfg = self.config;
        let tracker = new_shared_tracker();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let listener = ReplyListener::new(cfg.remote, tracker.clone(), results_tx);
        let mut listener_failed = listener.spawn(source)?;

        let sender = ProbeSender::new(cfg.local, cfg.remote, transport)
            .with_source_port(cfg.source_port)
            .with_window(cfg.window);
        let mut scheduler = Scheduler::new(sender, tracker.clone(), cfg.first_port, cfg.timeout);

        let mut summary = SessionSummary::new();
        let mut emit = |result: &ProbeResult, summary: &mut SessionSummary| {
            summary.record(result);
            report(result);
        };

        tracing::info!(
            local = %cfg.local,
            remote = %cfg.remote,
            port = cfg.first_port,
            interval_ms = cfg.interval.as_millis() as u64,
            "probing started"
        );

        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut lingering = cfg.count == Some(0);
        let linger = tokio::time::sleep(if lingering { Duration::ZERO } else { NEVER });
        tokio::pin!(linger);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("interrupted, draining pending probes");
                    break;
                }
                failed = &mut listener_failed => {
                    let err = failed.unwrap_or_else(|_| {
                        ListenError::Thread("listener exited without reporting".into())
                    });
                    return Err(SessionError::Listener(err));
                }
                Some(result) = results_rx.recv() => {
                    emit(&result, &mut summary);
                    if lingering && tracker.lock().await.is_empty() {
                        break;
                    }
                }
                _ = ticker.tick(), if !lingering => {
                    for result in scheduler.tick().await {
                        emit(&result, &mut summary);
                    }
                    if cfg.count.is_some_and(|n| scheduler.sent() >= n) {
                        lingering = true;
                        if tracker.lock().await.is_empty() {
                            break;
                        }
                        linger.as_mut().reset(Instant::now() + cfg.linger());
                    }
                }
                _ = &mut linger, if lingering => {
                    break;
                }
            }
        }

        // Answers queued before the drain still count.
        while let Ok(result) = results_rx.try_recv() {
            emit(&result, &mut summary);
        }

        let (expired, remaining) = {
            let mut tracker = tracker.lock().await;
            let expired = match cfg.timeout {
                Some(timeout) => tracker.expire(std::time::Instant::now(), timeout),
                None => Vec::new(),
            };
            (expired, tracker.drain())
        };
        for probe in &expired {
            emit(&ProbeResult::lost(probe, LossReason::Timeout), &mut summary);
        }
        for probe in &remaining {
            emit(&ProbeResult::lost(probe, LossReason::Shutdown), &mut summary);
        }

        summary.sent = scheduler.sent();
        tracing::info!(
            sent = summary.sent,
            transmitted = scheduler.sender().probe_count(),
            answered = summary.answered(),
            lost = summary.lost(),
            "probing stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    use crate::packet::tcp::{TcpHeader, ACK, RST, SYN};
    use crate::probe::listener::tests::{reply_frame, LOCAL, REMOTE};
    use crate::probe::sender::ProbeError;
    use crate::probe::transport::{FrameInjector, MockFrameSource, MockTransport};
    use crate::{ProbeOutcome, ReplyKind, Timestamp};

    /// Transport that answers selected probes through a frame injector, the
    /// way a remote host would.
    struct ReplyingTransport {
        injector: FrameInjector,
        /// Reply to probe `i` (0-based) iff `answer(i)`.
        answer: fn(usize) -> bool,
        flags: u8,
        sent: usize,
    }

    impl Transport for ReplyingTransport {
        fn send_segment(
            &mut self,
            _remote: Ipv4Addr,
            segment: &[u8],
        ) -> Result<Timestamp, ProbeError> {
            let stamp = Timestamp::now();
            let header = TcpHeader::decode(segment)?;
            if (self.answer)(self.sent) {
                let ack = header.sequence_number.wrapping_add(1);
                self.injector
                    .inject(reply_frame(REMOTE, self.flags, ack), REMOTE);
            }
            self.sent += 1;
            Ok(stamp)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn config(count: Option<u64>, timeout: Option<Duration>) -> SessionConfig {
        SessionConfig {
            interval: Duration::from_millis(10),
            count,
            timeout,
            ..SessionConfig::new(LOCAL, REMOTE)
        }
    }

    fn collecting() -> (Arc<Mutex<Vec<ProbeResult>>>, impl FnMut(&ProbeResult)) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |r: &ProbeResult| sink.lock().unwrap().push(r.clone()))
    }

    #[test]
    fn test_config_defaults() {
        let cfg = SessionConfig::new(LOCAL, REMOTE);
        assert_eq!(cfg.first_port, 80);
        assert_eq!(cfg.interval, Duration::from_millis(1000));
        assert_eq!(cfg.timeout, Some(Duration::from_millis(3000)));
        assert_eq!(cfg.count, None);
        assert_eq!(cfg.source_port, 0xaa47);
        assert_eq!(cfg.linger(), Duration::from_millis(3000));

        let no_timeout = SessionConfig { timeout: None, ..cfg };
        assert_eq!(no_timeout.linger(), Duration::from_millis(1000));
    }

    // ==========================================================================
    // Counted runs
    // ==========================================================================

    #[tokio::test]
    async fn test_all_probes_answered() {
        let (injector, source) = MockFrameSource::channel();
        let transport = ReplyingTransport {
            injector: injector.clone(),
            answer: |_| true,
            flags: SYN | ACK,
            sent: 0,
        };
        let (seen, report) = collecting();

        let summary = Session::new(config(Some(3), Some(Duration::from_secs(2))))
            .run(Box::new(transport), source, std::future::pending(), report)
            .await
            .unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.syn_ack, 3);
        assert_eq!(summary.lost(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let ports: Vec<u16> = seen.iter().map(|r| r.destination_port).collect();
        assert_eq!(ports, vec![80, 81, 82]);
        assert!(seen.iter().all(|r| matches!(
            r.outcome,
            ProbeOutcome::Answered { reply: ReplyKind::SynAck, .. }
        )));
        drop(injector);
    }

    #[tokio::test]
    async fn test_unanswered_probes_are_drained_as_lost() {
        // Probes 0 and 2 get an RST, 1 and 3 are never answered.
        let (injector, source) = MockFrameSource::channel();
        let transport = ReplyingTransport {
            injector: injector.clone(),
            answer: |i| i % 2 == 0,
            flags: RST | ACK,
            sent: 0,
        };
        let (seen, report) = collecting();

        let summary = Session::new(config(Some(4), None))
            .run(Box::new(transport), source, std::future::pending(), report)
            .await
            .unwrap();

        assert_eq!(summary.sent, 4);
        assert_eq!(summary.rst, 2);
        assert_eq!(summary.unanswered_at_shutdown, 2, "N - M probes reported lost");
        assert_eq!(summary.timed_out, 0);
        assert_eq!(seen.lock().unwrap().len(), 4, "every probe reported exactly once");
        drop(injector);
    }

    #[tokio::test]
    async fn test_counted_run_times_out_silent_probes() {
        let (injector, source) = MockFrameSource::channel();
        let (seen, report) = collecting();

        let summary = Session::new(config(Some(3), Some(Duration::from_millis(30))))
            .run(Box::new(MockTransport::new()), source, std::future::pending(), report)
            .await
            .unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.answered(), 0);
        assert_eq!(summary.timed_out, 3);
        assert_eq!(summary.loss_percent(), 100.0);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.received_at.is_none()));
        drop(injector);
    }

    #[tokio::test]
    async fn test_zero_count_sends_nothing() {
        let (injector, source) = MockFrameSource::channel();
        let summary = Session::new(config(Some(0), None))
            .run(Box::new(MockTransport::new()), source, std::future::pending(), |_| {})
            .await
            .unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.lost(), 0);
        drop(injector);
    }

    // ==========================================================================
    // Shutdown and failure
    // ==========================================================================

    #[tokio::test]
    async fn test_shutdown_drains_pending_as_lost() {
        let (injector, source) = MockFrameSource::channel();
        let (seen, report) = collecting();

        let shutdown = tokio::time::sleep(Duration::from_millis(45));
        let summary = Session::new(config(None, None))
            .run(Box::new(MockTransport::new()), source, shutdown, report)
            .await
            .unwrap();

        assert!(summary.sent >= 1);
        assert_eq!(summary.unanswered_at_shutdown, summary.sent);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len() as u64, summary.sent);
        assert!(seen.iter().all(|r| r.outcome
            == ProbeOutcome::Lost {
                reason: LossReason::Shutdown
            }));
        drop(injector);
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_session() {
        let (injector, source) = MockFrameSource::channel();
        let mut transport = MockTransport::new();
        transport.fail_next_send = true;

        let summary = Session::new(config(Some(3), None))
            .run(Box::new(transport), source, std::future::pending(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.send_failed, 1);
        assert_eq!(summary.unanswered_at_shutdown, 2);
        drop(injector);
    }

    #[tokio::test]
    async fn test_listener_failure_is_fatal() {
        let source = MockFrameSource::from_frames(vec![]);
        let result = Session::new(config(None, None))
            .run(
                Box::new(MockTransport::new()),
                source,
                std::future::pending(),
                |_| {},
            )
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Listener(ListenError::Read(_)))
        ));
    }
}
