//! Output formatters for probe results and the session summary.
//!
//! Supports pretty (one tab-separated line per probe) and JSON (one object
//! per line) output formats.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::timing::{SessionSummary, TimingStats};
use crate::{unix_nanos, LossReason, ProbeOutcome, ProbeResult};

use super::OutputFmt;

/// Format one probe result as a single line (no trailing newline).
pub fn format_result(result: &ProbeResult, fmt: OutputFmt) -> String {
    match fmt {
        OutputFmt::Pretty => format_pretty(result),
        OutputFmt::Json => serde_json::to_string(result)
            .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}")),
    }
}

/// `sendTime: <ns>\treceiveTime: <ns>\tlatency: <latency>`
///
/// A lost probe has receive time 0 and latency `timeout`, or `send-failed`
/// when the SYN never went out.
pub fn format_pretty(result: &ProbeResult) -> String {
    let send_ns = unix_nanos(&result.sent_at);
    let receive_ns = result.received_at.as_ref().map(unix_nanos).unwrap_or(0);
    let latency = match result.outcome {
        ProbeOutcome::Answered { latency, .. } => format_latency(latency),
        ProbeOutcome::Lost {
            reason: LossReason::SendFailed,
        } => LossReason::SendFailed.to_string(),
        ProbeOutcome::Lost { .. } => "timeout".to_string(),
    };
    format!("sendTime: {send_ns}\treceiveTime: {receive_ns}\tlatency: {latency}")
}

/// Format the end-of-session summary block.
pub fn format_summary(summary: &SessionSummary, remote: Ipv4Addr, fmt: OutputFmt) -> String {
    match fmt {
        OutputFmt::Pretty => format_summary_pretty(summary, remote),
        OutputFmt::Json => serde_json::to_string(&JsonSummary::new(summary, remote))
            .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}")),
    }
}

fn format_summary_pretty(summary: &SessionSummary, remote: Ipv4Addr) -> String {
    let mut out = String::new();
    out.push_str(&format!("--- {remote} synping statistics ---\n"));
    out.push_str(&format!(
        "{} probes sent, {} answered ({} syn-ack, {} rst), {:.1}% loss\n",
        summary.sent,
        summary.answered(),
        summary.syn_ack,
        summary.rst,
        summary.loss_percent()
    ));

    let mut lost_parts = Vec::new();
    if summary.timed_out > 0 {
        lost_parts.push(format!("{} timed out", summary.timed_out));
    }
    if summary.unanswered_at_shutdown > 0 {
        lost_parts.push(format!("{} unanswered at exit", summary.unanswered_at_shutdown));
    }
    if summary.send_failed > 0 {
        lost_parts.push(format!("{} failed to send", summary.send_failed));
    }
    if summary.displaced > 0 {
        lost_parts.push(format!("{} displaced", summary.displaced));
    }
    if !lost_parts.is_empty() {
        out.push_str(&format!("lost: {}\n", lost_parts.join(", ")));
    }

    let stats = summary.stats();
    if stats.samples > 0 {
        out.push_str(&format!(
            "rtt min/mean/p50/p90/max/std = {}/{}/{}/{}/{}/{}\n",
            format_micros(stats.min),
            format_micros(stats.mean),
            format_micros(stats.p50),
            format_micros(stats.p90),
            format_micros(stats.max),
            format_micros(stats.std),
        ));
    }
    out
}

#[derive(serde::Serialize)]
struct JsonSummary<'a> {
    remote: String,
    #[serde(flatten)]
    counts: &'a SessionSummary,
    answered: u64,
    lost: u64,
    loss_percent: f64,
    /// Microseconds.
    rtt: TimingStats,
}

impl<'a> JsonSummary<'a> {
    fn new(summary: &'a SessionSummary, remote: Ipv4Addr) -> Self {
        Self {
            remote: remote.to_string(),
            counts: summary,
            answered: summary.answered(),
            lost: summary.lost(),
            loss_percent: summary.loss_percent(),
            rtt: summary.stats(),
        }
    }
}

fn format_micros(us: f64) -> String {
    format_latency(Duration::from_nanos((us * 1_000.0).round() as u64))
}

/// Render a duration in the largest unit below it, keeping every
/// significant digit: `750ns`, `1.5µs`, `5ms`, `2.000123ms`, `1.25s`.
pub fn format_latency(d: Duration) -> String {
    let ns = d.as_nanos();
    let (unit_ns, suffix, digits) = match ns {
        0 => return "0s".to_string(),
        1..=999 => return format!("{ns}ns"),
        1_000..=999_999 => (1_000, "µs", 3usize),
        1_000_000..=999_999_999 => (1_000_000, "ms", 6),
        _ => (1_000_000_000, "s", 9),
    };

    let whole = ns / unit_ns;
    let fraction = ns % unit_ns;
    if fraction == 0 {
        return format!("{whole}{suffix}");
    }
    let fraction = format!("{fraction:0digits$}");
    format!("{whole}.{}{suffix}", fraction.trim_end_matches('0'))
}
