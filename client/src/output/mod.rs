//! Output and display management

use crate::analysis::{FlatReport, PhaseOutcome, Report, RunStatus};
use crate::session::{ProgressEvent, SessionState};
use anyhow::{Context, Result};
use crossterm::style::{Color, Stylize};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File format for the exported report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Csv,
}

/// Console progress and summary printer
pub struct OutputManager {
    use_colors: bool,
}

impl OutputManager {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.use_colors {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    /// One console line for a progress event, `None` for events not worth
    /// printing
    pub fn progress_line(&self, event: &ProgressEvent) -> Option<String> {
        let snapshot = &event.snapshot;
        let detail = match event.state {
            SessionState::Probing => snapshot
                .latency_ms
                .map(|rtt| format!("rtt {:.1}ms, jitter {:.1}ms", rtt, snapshot.jitter_ms.unwrap_or(0.0))),
            SessionState::Downloading => snapshot
                .download_bps
                .map(|bps| format!("{:.2} Mbps", bps / 1_000_000.0)),
            SessionState::Uploading => snapshot
                .upload_bps
                .map(|bps| format!("{:.2} Mbps", bps / 1_000_000.0)),
            SessionState::Completed => Some(self.paint("done", Color::Green)),
            SessionState::Failed => Some(self.paint("failed", Color::Red)),
            SessionState::Cancelled => Some(self.paint("cancelled", Color::Yellow)),
            SessionState::Idle | SessionState::Aggregating => None,
        }?;

        Some(format!(
            "[{}] {:>3.0}% {:<11} {}",
            chrono::Local::now().format("%H:%M:%S"),
            event.percent_complete,
            event.state.to_string(),
            detail
        ))
    }

    pub fn update(&self, event: &ProgressEvent) {
        if let Some(line) = self.progress_line(event) {
            println!("{}", line);
        }
    }

    /// Summary table lines for a finished report
    pub fn summary_lines(&self, report: &Report) -> Vec<String> {
        let status = match report.status {
            RunStatus::Completed => self.paint("completed", Color::Green),
            RunStatus::Cancelled => self.paint("cancelled", Color::Yellow),
        };
        let outcome = |outcome: PhaseOutcome| match outcome {
            PhaseOutcome::Full => String::new(),
            PhaseOutcome::Partial => self.paint(" (partial)", Color::Yellow),
            PhaseOutcome::Skipped => self.paint(" (skipped)", Color::DarkGrey),
        };

        let mut lines = vec![
            format!("Session {} {}", report.session_id, status),
            format!(
                "  Latency   {:>8} ms  (p50 {:.1}, p95 {:.1}, min {:.1}, max {:.1}){}",
                report.latency_display(),
                report.latency_p50_ms,
                report.latency_p95_ms,
                report.latency_min_ms,
                report.latency_max_ms,
                outcome(report.latency.outcome)
            ),
            format!("  Jitter    {:>8.1} ms", report.jitter_ms),
            format!("  Loss      {:>8.1} %", report.packet_loss_percent),
            format!(
                "  Download  {:>8.2} Mbps  (stability {:.0}){}",
                report.download_mbps(),
                report.download_stability,
                outcome(report.download.outcome)
            ),
            format!(
                "  Upload    {:>8.2} Mbps  (stability {:.0}){}",
                report.upload_mbps(),
                report.upload_stability,
                outcome(report.upload.outcome)
            ),
            format!("  Quality   {:>8.0} / 100", report.quality_score),
        ];
        if !report.diagnostics.is_empty() {
            let notes: Vec<String> = report.diagnostics.iter().map(ToString::to_string).collect();
            lines.push(format!("  Notes     {}", notes.join(", ")));
        }
        lines
    }

    pub fn print_summary(&self, report: &Report) {
        for line in self.summary_lines(report) {
            println!("{}", line);
        }
    }
}

/// Write the report in `format` to `output_path`
pub fn export_report(report: &Report, output_path: &Path, format: ReportFormat) -> Result<()> {
    let flat = report.to_flat();
    match format {
        ReportFormat::Json => export_json(&flat, output_path),
        ReportFormat::Csv => export_csv(&flat, output_path),
    }
}

/// Export the flat report as a JSON object
pub fn export_json(flat: &FlatReport, output_path: &Path) -> Result<()> {
    let json = flat.to_json().context("Failed to serialize report")?;
    std::fs::write(output_path, json)
        .with_context(|| format!("Failed to write report to {:?}", output_path))?;
    Ok(())
}

/// Export the flat report as two-column `key,value` CSV
pub fn export_csv(flat: &FlatReport, output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)
        .with_context(|| format!("Failed to create {:?}", output_path))?;

    writer.write_record(["key", "value"])?;
    for (key, value) in flat.to_pairs().context("Failed to flatten report")? {
        writer.write_record([key, value])?;
    }

    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::report_fixture;
    use crate::session::MetricSnapshot;
    use uuid::Uuid;

    #[test]
    fn test_json_export_parses_back() {
        let report = report_fixture();
        let file = tempfile::NamedTempFile::new().unwrap();

        export_report(&report, file.path(), ReportFormat::Json).unwrap();

        let json = std::fs::read_to_string(file.path()).unwrap();
        let parsed = FlatReport::from_json(&json).unwrap();
        assert_eq!(parsed.session_id, report.session_id);
        assert_eq!(parsed.quality_score, report.quality_score);
    }

    #[test]
    fn test_csv_export_is_key_value() {
        let report = report_fixture();
        let file = tempfile::NamedTempFile::new().unwrap();

        export_report(&report, file.path(), ReportFormat::Csv).unwrap();

        let mut reader = csv::Reader::from_path(file.path()).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, vec!["key", "value"]);
        let rows: Vec<(String, String)> = reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                (r[0].to_string(), r[1].to_string())
            })
            .collect();
        assert!(rows.iter().any(|(k, v)| k == "status" && v == "completed"));
        assert!(rows.iter().any(|(k, _)| k == "downloadMbps"));
    }

    #[test]
    fn test_summary_marks_partial_phases() {
        let output = OutputManager::new(false);
        let lines = output.summary_lines(&report_fixture());
        let upload = lines.iter().find(|l| l.trim_start().starts_with("Upload")).unwrap();
        assert!(upload.ends_with("(partial)"));
        assert!(lines.iter().any(|l| l.contains("partial:upload")));
    }

    #[test]
    fn test_progress_line_shows_live_rate() {
        let output = OutputManager::new(false);
        let event = ProgressEvent {
            session_id: Uuid::new_v4(),
            state: SessionState::Downloading,
            phase: None,
            percent_complete: 50.0,
            snapshot: MetricSnapshot {
                download_bps: Some(42_000_000.0),
                ..MetricSnapshot::default()
            },
        };
        let line = output.progress_line(&event).unwrap();
        assert!(line.contains(" 50% downloading"));
        assert!(line.ends_with("42.00 Mbps"));

        let idle = ProgressEvent {
            state: SessionState::Aggregating,
            ..event
        };
        assert!(output.progress_line(&idle).is_none());
    }

    #[test]
    fn test_format_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: ReportFormat,
        }
        let parsed: Wrapper = toml::from_str(r#"format = "csv""#).unwrap();
        assert_eq!(parsed.format, ReportFormat::Csv);
        assert_eq!(ReportFormat::default(), ReportFormat::Json);
    }
}
