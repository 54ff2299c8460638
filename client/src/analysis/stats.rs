//! Summary statistics over sample series
//!
//! All functions return 0 for inputs too short to say anything, never NaN.

use crate::testing::Sample;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Percentile `p` (0..=100) with linear interpolation between closest ranks
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted(values);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Mean after dropping `trim_fraction` of the values from each end
pub fn trimmed_mean(values: &[f64], trim_fraction: f64) -> f64 {
    let sorted = sorted(values);
    let cut = (sorted.len() as f64 * trim_fraction.clamp(0.0, 0.5)).floor() as usize;
    if sorted.len() <= cut * 2 {
        return mean(&sorted);
    }
    mean(&sorted[cut..sorted.len() - cut])
}

/// Mean absolute difference between consecutive values
pub fn jitter(rtts: &[f64]) -> f64 {
    if rtts.len() < 2 {
        return 0.0;
    }
    let total: f64 = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (rtts.len() - 1) as f64
}

/// 100 for a perfectly steady rate series, falling with the coefficient of
/// variation, clamped to 0..=100
pub fn stability_score(rates: &[f64]) -> f64 {
    if rates.len() < 2 {
        return 0.0;
    }
    let m = mean(rates);
    if m <= 0.0 {
        return 0.0;
    }
    let cv = std_dev(rates) / m;
    (100.0 * (1.0 - cv)).clamp(0.0, 100.0)
}

/// Cumulative bytes at `at_ms`, linearly interpolated between samples with an
/// implicit `(0, 0)` origin
pub fn bytes_at(samples: &[Sample], at_ms: f64) -> f64 {
    if at_ms <= 0.0 || samples.is_empty() {
        return 0.0;
    }
    let Some(idx) = samples.iter().position(|s| s.at_ms >= at_ms) else {
        return samples[samples.len() - 1].value;
    };

    let cur = samples[idx];
    let prev = if idx == 0 {
        Sample::new(0.0, 0.0)
    } else {
        samples[idx - 1]
    };
    if cur.at_ms <= prev.at_ms {
        return cur.value;
    }
    prev.value + (cur.value - prev.value) * (at_ms - prev.at_ms) / (cur.at_ms - prev.at_ms)
}

/// `8 * Δbytes / Δt` between two cumulative samples, in bits per second
pub fn instantaneous_rate(prev: Sample, cur: Sample) -> Option<f64> {
    let dt_ms = cur.at_ms - prev.at_ms;
    if dt_ms <= 0.0 {
        return None;
    }
    Some(8.0 * (cur.value - prev.value) / (dt_ms / 1000.0))
}

/// Aggregate rate in bits per second over the trailing `fraction` of a phase
/// that ran for `duration_ms`
///
/// The window ends at the phase's end, not at its last sample, so a transfer
/// that went quiet early is charged for the idle tail. Excluding the head of
/// the phase keeps connection warm-up out of the sustained rate.
pub fn trailing_window_rate(samples: &[Sample], duration_ms: f64, fraction: f64) -> f64 {
    let Some(last) = samples.last() else {
        return 0.0;
    };
    let end_ms = duration_ms.max(last.at_ms);
    let start_ms = end_ms * (1.0 - fraction.clamp(0.0, 1.0));
    let window_ms = end_ms - start_ms;
    if window_ms <= 0.0 {
        return 0.0;
    }
    let bytes = last.value - bytes_at(samples, start_ms);
    8.0 * bytes / (window_ms / 1000.0)
}

/// Rates over consecutive `bin_ms` bins from `from_ms` up to `to_ms`
///
/// Bins past the last sample count as idle.
pub fn interval_rates(samples: &[Sample], bin_ms: f64, from_ms: f64, to_ms: f64) -> Vec<f64> {
    let Some(last) = samples.last() else {
        return Vec::new();
    };
    if bin_ms <= 0.0 {
        return Vec::new();
    }

    let end_ms = to_ms.max(last.at_ms);
    let mut rates = Vec::new();
    let mut start = from_ms.max(0.0);
    while start + bin_ms <= end_ms {
        let delta = bytes_at(samples, start + bin_ms) - bytes_at(samples, start);
        rates.push(8.0 * delta / (bin_ms / 1000.0));
        start += bin_ms;
    }
    rates
}
