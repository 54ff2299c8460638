//! Final session report and its flat key-value form

use crate::testing::PhaseKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How a session ended when it produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Per-phase completion as shown in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    Full,
    Partial,
    /// Never ran (session cancelled before reaching it)
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub samples: usize,
    pub duration_ms: f64,
    pub outcome: PhaseOutcome,
}

impl PhaseSummary {
    pub fn skipped() -> Self {
        Self {
            samples: 0,
            duration_ms: 0.0,
            outcome: PhaseOutcome::Skipped,
        }
    }
}

/// Something about the report a reader should not take at face value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Diagnostic {
    /// A computed value was NaN or infinite and was replaced by 0
    NonFinite { field: &'static str },
    /// A rate exceeded the sanity ceiling and was clamped to it
    RateCeiling { phase: PhaseKind, measured_bps: f64 },
    /// A phase stopped before its natural end
    PartialPhase { phase: PhaseKind },
    /// No successful latency probe, so no quality score
    NoLatencyData,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::NonFinite { field } => write!(f, "non-finite:{}", field),
            Diagnostic::RateCeiling { phase, measured_bps } => {
                write!(f, "rate-ceiling:{}:{:.0}", phase, measured_bps)
            }
            Diagnostic::PartialPhase { phase } => write!(f, "partial:{}", phase),
            Diagnostic::NoLatencyData => write!(f, "no-latency-data"),
        }
    }
}

/// Result of one measurement session
///
/// Built once by the aggregator. Rates are bits per second; every numeric
/// field is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    pub latency_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_trimmed_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,

    pub download_bps: f64,
    pub upload_bps: f64,
    pub download_stability: f64,
    pub upload_stability: f64,
    pub quality_score: f64,

    pub latency: PhaseSummary,
    pub download: PhaseSummary,
    pub upload: PhaseSummary,

    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    /// Mean latency rounded for display
    pub fn latency_display(&self) -> i64 {
        self.latency_ms.round() as i64
    }

    pub fn download_mbps(&self) -> f64 {
        self.download_bps / 1_000_000.0
    }

    pub fn upload_mbps(&self) -> f64 {
        self.upload_bps / 1_000_000.0
    }

    pub fn phase(&self, kind: PhaseKind) -> &PhaseSummary {
        match kind {
            PhaseKind::Latency => &self.latency,
            PhaseKind::Download => &self.download,
            PhaseKind::Upload => &self.upload,
        }
    }

    pub fn to_flat(&self) -> FlatReport {
        FlatReport {
            session_id: self.session_id,
            status: self.status,
            latency: self.latency_ms,
            latency_min: self.latency_min_ms,
            latency_max: self.latency_max_ms,
            latency_p50: self.latency_p50_ms,
            latency_p95: self.latency_p95_ms,
            latency_trimmed: self.latency_trimmed_ms,
            jitter: self.jitter_ms,
            packet_loss_percent: self.packet_loss_percent,
            download_mbps: self.download_mbps(),
            upload_mbps: self.upload_mbps(),
            download_stability: self.download_stability,
            upload_stability: self.upload_stability,
            quality_score: self.quality_score,
            latency_samples: self.latency.samples as u64,
            download_samples: self.download.samples as u64,
            upload_samples: self.upload.samples as u64,
            latency_duration_ms: self.latency.duration_ms,
            download_duration_ms: self.download.duration_ms,
            upload_duration_ms: self.upload.duration_ms,
            latency_phase: self.latency.outcome,
            download_phase: self.download.outcome,
            upload_phase: self.upload.outcome,
            started_at: self.started_at,
            finished_at: self.finished_at,
            diagnostics: self
                .diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

/// Flat key-value form of a [`Report`], one scalar per key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatReport {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub latency: f64,
    pub latency_min: f64,
    pub latency_max: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_trimmed: f64,
    pub jitter: f64,
    pub packet_loss_percent: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub download_stability: f64,
    pub upload_stability: f64,
    pub quality_score: f64,
    pub latency_samples: u64,
    pub download_samples: u64,
    pub upload_samples: u64,
    pub latency_duration_ms: f64,
    pub download_duration_ms: f64,
    pub upload_duration_ms: f64,
    pub latency_phase: PhaseOutcome,
    pub download_phase: PhaseOutcome,
    pub upload_phase: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub diagnostics: String,
}

impl FlatReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// `(key, value)` pairs sorted by key, values rendered as text
    pub fn to_pairs(&self) -> serde_json::Result<Vec<(String, String)>> {
        let value = serde_json::to_value(self)?;
        let serde_json::Value::Object(map) = value else {
            return Ok(Vec::new());
        };
        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect())
    }
}
