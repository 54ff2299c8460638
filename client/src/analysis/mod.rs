//! Metric aggregation
//!
//! Turns the phase results of a session into a [`Report`]. Pure: the same
//! results and settings always give the same report.

mod quality;
mod report;
pub mod stats;

pub use quality::QualityPolicy;
pub use report::{Diagnostic, FlatReport, PhaseOutcome, PhaseSummary, Report, RunStatus};

#[cfg(test)]
pub(crate) use report::tests::sample_report as report_fixture;

use crate::config::SessionConfig;
use crate::testing::{Completion, PhaseKind, PhaseResult};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// Share of RTT samples dropped from each end for the trimmed mean
const LATENCY_TRIM_FRACTION: f64 = 0.1;

/// Session facts the report carries alongside the metrics
#[derive(Debug, Clone)]
pub struct ReportMeta {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Rate of one throughput phase after ceiling enforcement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    pub bps: f64,
    pub stability: f64,
    /// Raw rate when it exceeded the ceiling and was discarded
    pub rejected_bps: Option<f64>,
}

/// Trailing-window rate and stability of a throughput phase
///
/// The window is anchored to the phase's elapsed duration. A rate above the
/// sanity ceiling is a measurement artifact, so it is reported as 0.
pub fn throughput_estimate(result: &PhaseResult, config: &SessionConfig) -> RateEstimate {
    let samples = result.samples();
    let fraction = config.throughput.window_fraction;
    let duration_ms = result.duration_ms();
    let raw = stats::trailing_window_rate(samples, duration_ms, fraction);

    let end_ms = samples.last().map(|s| s.at_ms.max(duration_ms)).unwrap_or(0.0);
    let bins = stats::interval_rates(
        samples,
        config.throughput.progress_interval_ms as f64,
        end_ms * (1.0 - fraction),
        end_ms,
    );
    let stability = stats::stability_score(&bins);

    let ceiling = config.throughput.rate_ceiling_bps;
    if raw > ceiling {
        warn!(
            "{} rate {:.0} bps exceeds sanity ceiling {:.0} bps, discarding it",
            result.kind(),
            raw,
            ceiling
        );
        RateEstimate {
            bps: 0.0,
            stability: 0.0,
            rejected_bps: Some(raw),
        }
    } else {
        RateEstimate {
            bps: raw,
            stability,
            rejected_bps: None,
        }
    }
}

fn summarize(result: Option<&PhaseResult>) -> PhaseSummary {
    match result {
        Some(result) => PhaseSummary {
            samples: result.samples().len(),
            duration_ms: result.duration_ms(),
            outcome: match result.completion() {
                Completion::Full => PhaseOutcome::Full,
                Completion::Partial => PhaseOutcome::Partial,
            },
        },
        None => PhaseSummary::skipped(),
    }
}

fn finite(value: f64, field: &'static str, diagnostics: &mut Vec<Diagnostic>) -> f64 {
    if value.is_finite() {
        value
    } else {
        diagnostics.push(Diagnostic::NonFinite { field });
        0.0
    }
}

/// Combine phase results into the final report
pub fn aggregate(results: &[PhaseResult], config: &SessionConfig, meta: ReportMeta) -> Report {
    let find = |kind: PhaseKind| results.iter().find(|r| r.kind() == kind);
    let latency_result = find(PhaseKind::Latency);
    let download_result = find(PhaseKind::Download);
    let upload_result = find(PhaseKind::Upload);

    let mut diagnostics = Vec::new();
    for result in results.iter().filter(|r| r.is_partial()) {
        diagnostics.push(Diagnostic::PartialPhase {
            phase: result.kind(),
        });
    }

    let rtts: Vec<f64> = latency_result
        .map(|r| r.samples().iter().map(|s| s.value).collect())
        .unwrap_or_default();
    let (attempted, lost) = latency_result
        .map(|r| (r.attempted(), r.lost()))
        .unwrap_or((0, 0));
    let packet_loss_percent = if attempted == 0 {
        0.0
    } else {
        100.0 * lost as f64 / attempted as f64
    };

    let latency_ms = finite(stats::mean(&rtts), "latency", &mut diagnostics);
    let jitter_ms = finite(stats::jitter(&rtts), "jitter", &mut diagnostics);

    let mut rate = |result: Option<&PhaseResult>, kind: PhaseKind| -> (f64, f64) {
        let Some(result) = result else {
            return (0.0, 0.0);
        };
        let estimate = throughput_estimate(result, config);
        if let Some(measured_bps) = estimate.rejected_bps {
            diagnostics.push(Diagnostic::RateCeiling {
                phase: kind,
                measured_bps,
            });
        }
        (estimate.bps, estimate.stability)
    };
    let (download_bps, download_stability) = rate(download_result, PhaseKind::Download);
    let (upload_bps, upload_stability) = rate(upload_result, PhaseKind::Upload);

    let quality_score = if rtts.is_empty() {
        diagnostics.push(Diagnostic::NoLatencyData);
        0.0
    } else {
        config.quality.score(latency_ms, jitter_ms, packet_loss_percent)
    };

    Report {
        session_id: meta.session_id,
        status: meta.status,
        started_at: meta.started_at,
        finished_at: meta.finished_at,
        latency_min_ms: finite(stats::percentile(&rtts, 0.0), "latency_min", &mut diagnostics),
        latency_max_ms: finite(stats::percentile(&rtts, 100.0), "latency_max", &mut diagnostics),
        latency_p50_ms: finite(stats::percentile(&rtts, 50.0), "latency_p50", &mut diagnostics),
        latency_p95_ms: finite(stats::percentile(&rtts, 95.0), "latency_p95", &mut diagnostics),
        latency_trimmed_ms: finite(
            stats::trimmed_mean(&rtts, LATENCY_TRIM_FRACTION),
            "latency_trimmed",
            &mut diagnostics,
        ),
        latency_ms,
        jitter_ms,
        packet_loss_percent: finite(packet_loss_percent, "packet_loss_percent", &mut diagnostics),
        download_bps: finite(download_bps, "download_bps", &mut diagnostics),
        upload_bps: finite(upload_bps, "upload_bps", &mut diagnostics),
        download_stability: finite(download_stability, "download_stability", &mut diagnostics),
        upload_stability: finite(upload_stability, "upload_stability", &mut diagnostics),
        quality_score: finite(quality_score, "quality_score", &mut diagnostics),
        latency: summarize(latency_result),
        download: summarize(download_result),
        upload: summarize(upload_result),
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Sample;

    const MIB: f64 = 1024.0 * 1024.0;

    fn meta(status: RunStatus) -> ReportMeta {
        ReportMeta {
            session_id: Uuid::new_v4(),
            status,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn latency(rtts: &[f64]) -> PhaseResult {
        let samples: Vec<Sample> = rtts
            .iter()
            .enumerate()
            .map(|(i, rtt)| Sample::new(100.0 * (i + 1) as f64, *rtt))
            .collect();
        PhaseResult::from_samples(PhaseKind::Latency, &samples, Completion::Full)
    }

    fn uniform(kind: PhaseKind, total_mib: u32, over_ms: f64, completion: Completion) -> PhaseResult {
        let step = over_ms / total_mib as f64;
        let samples: Vec<Sample> = (1..=total_mib)
            .map(|k| Sample::new(step * k as f64, MIB * k as f64))
            .collect();
        PhaseResult::from_samples(kind, &samples, completion)
    }

    #[test]
    fn test_full_report() {
        let config = SessionConfig::default();
        let results = vec![
            latency(&[40.0, 60.0, 50.0, 70.0]),
            uniform(PhaseKind::Download, 10, 8000.0, Completion::Full),
            uniform(PhaseKind::Upload, 5, 5000.0, Completion::Full),
        ];

        let report = aggregate(&results, &config, meta(RunStatus::Completed));

        assert_eq!(report.latency_ms, 55.0);
        assert!((report.jitter_ms - 50.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.latency_min_ms, 40.0);
        assert_eq!(report.latency_max_ms, 70.0);
        assert!((report.download_mbps() - 10.486).abs() < 0.01);
        assert!((report.upload_mbps() - 8.389).abs() < 0.01);
        // 55 ms -> 10, 16.7 ms jitter -> 10, no loss
        assert_eq!(report.quality_score, 80.0);
        assert_eq!(report.download.outcome, PhaseOutcome::Full);
        assert_eq!(report.download.samples, 10);
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn test_zero_byte_phase_has_zero_rate() {
        let config = SessionConfig::default();
        let empty = PhaseResult::from_samples(PhaseKind::Download, &[], Completion::Partial);
        let report = aggregate(&[latency(&[20.0]), empty], &config, meta(RunStatus::Cancelled));

        assert_eq!(report.download_bps, 0.0);
        assert_eq!(report.download_stability, 0.0);
        assert_eq!(report.download.outcome, PhaseOutcome::Partial);
        assert_eq!(report.upload.outcome, PhaseOutcome::Skipped);
        assert!(report.diagnostics.contains(&Diagnostic::PartialPhase {
            phase: PhaseKind::Download
        }));
    }

    #[test]
    fn test_rate_above_ceiling_is_discarded_and_flagged() {
        let mut config = SessionConfig::default();
        config.throughput.rate_ceiling_bps = 1_000_000.0;
        let results = vec![
            latency(&[10.0, 10.0]),
            uniform(PhaseKind::Download, 10, 1000.0, Completion::Full),
        ];

        let report = aggregate(&results, &config, meta(RunStatus::Completed));

        assert_eq!(report.download_bps, 0.0);
        assert_eq!(report.download_stability, 0.0);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::RateCeiling { phase: PhaseKind::Download, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tail_counts_against_rate() {
        // One 64 KiB chunk flushed at the start of a 500 ms upload, then the
        // peer stops reading
        let mut recorder = crate::testing::PhaseRecorder::new(PhaseKind::Upload);
        recorder.attempt();
        recorder.record_at(1.0, 65_536.0);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let result = recorder.finish(Completion::Full);
        assert!((result.duration_ms() - 500.0).abs() < 2.0);

        let estimate = throughput_estimate(&result, &SessionConfig::default());
        assert_eq!(estimate.bps, 0.0);
        assert_eq!(estimate.rejected_bps, None);

        let mut whole = SessionConfig::default();
        whole.throughput.window_fraction = 1.0;
        let estimate = throughput_estimate(&result, &whole);
        // 64 KiB over the full 500 ms, about 1 Mbps
        assert!((estimate.bps - 1_048_576.0).abs() / 1_048_576.0 < 0.01);
    }

    #[test]
    fn test_packet_loss_from_lost_probes() {
        let mut recorder = crate::testing::PhaseRecorder::new(PhaseKind::Latency);
        for i in 0..4 {
            recorder.attempt();
            if i == 2 {
                recorder.record_lost();
            } else {
                recorder.record_at(10.0 * (i + 1) as f64, 20.0);
            }
        }
        let results = vec![recorder.finish(Completion::Full)];

        let report = aggregate(&results, &SessionConfig::default(), meta(RunStatus::Completed));
        assert_eq!(report.packet_loss_percent, 25.0);
        assert_eq!(report.latency.samples, 3);
        // 20 ms -> 5, 25% loss -> 40
        assert_eq!(report.quality_score, 55.0);
    }

    #[test]
    fn test_no_latency_samples_gives_zero_score() {
        let report = aggregate(&[], &SessionConfig::default(), meta(RunStatus::Cancelled));
        assert_eq!(report.quality_score, 0.0);
        assert_eq!(report.latency_ms, 0.0);
        assert_eq!(report.latency.outcome, PhaseOutcome::Skipped);
        assert!(report.diagnostics.contains(&Diagnostic::NoLatencyData));
    }

    #[test]
    fn test_report_fields_always_finite() {
        let samples = [Sample::new(10.0, f64::MAX), Sample::new(20.0, f64::MAX)];
        let rtts = PhaseResult::from_samples(PhaseKind::Latency, &samples, Completion::Full);
        let report = aggregate(&[rtts], &SessionConfig::default(), meta(RunStatus::Completed));

        let flat = report.to_flat();
        for value in [flat.latency, flat.jitter, flat.latency_p95, flat.latency_trimmed, flat.quality_score] {
            assert!(value.is_finite());
        }
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::NonFinite { field: "latency" })));
    }
}
