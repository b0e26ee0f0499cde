//! Statistical calculations for latency samples.

use std::time::Duration;

use super::TimingStats;

/// Calculate statistics from latency samples.
///
/// # Arguments
/// * `samples` - Latency samples in microseconds
///
/// # Returns
/// A TimingStats struct with mean, std, p50, and p90 values.
/// Returns empty stats if samples is empty.
pub fn calculate_stats(samples: &[f64]) -> TimingStats {
    if samples.is_empty() {
        return TimingStats::empty();
    }

    let m = mean(samples);
    let s = std_dev(samples, m);

    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    TimingStats {
        samples: samples.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: m,
        std: s,
        p50: percentile(&sorted, 0.50),
        p90: percentile(&sorted, 0.90),
    }
}

/// A latency as fractional microseconds.
pub fn as_micros_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000.0
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Percentile `p` (0.0 to 1.0) of ascending samples, linearly interpolated
/// between closest ranks.
pub fn percentile(sorted_samples: &[f64], p: f64) -> f64 {
    match sorted_samples.len() {
        0 => return 0.0,
        1 => return sorted_samples[0],
        _ => {}
    }

    let rank = p.clamp(0.0, 1.0) * (sorted_samples.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;

    sorted_samples[lower] * (1.0 - frac) + sorted_samples[upper] * frac
}
