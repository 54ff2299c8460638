//! Measurement phases
//!
//! Each phase borrows the connection for its duration, records samples
//! through a [`PhaseRecorder`] and hands back an immutable [`PhaseResult`].

mod latency;
mod measurement;
mod throughput;

pub use latency::LatencyProber;
pub use measurement::{Clock, Completion, PhaseKind, PhaseRecorder, PhaseResult, Sample};
pub use throughput::{RateMeter, download, upload};

use crate::transport::{CloseReason, TransportError};
use protocol::ControlMessage;
use thiserror::Error;
use tracing::warn;

/// Why a phase could not produce a usable result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhaseError {
    #[error("{phase} phase lost its connection: {source}")]
    Transport {
        phase: PhaseKind,
        source: TransportError,
    },

    #[error("All {attempted} latency probes were lost")]
    AllProbesLost { attempted: u32 },

    #[error("{0} phase transferred no data")]
    NoData(PhaseKind),

    #[error("Server rejected {phase} phase (code {code}): {message}")]
    Remote {
        phase: PhaseKind,
        code: u16,
        message: String,
    },
}

impl PhaseError {
    pub fn transport(phase: PhaseKind, source: TransportError) -> Self {
        Self::Transport { phase, source }
    }

    pub fn closed(phase: PhaseKind, reason: CloseReason) -> Self {
        Self::transport(phase, TransportError::Closed(reason))
    }

    pub fn phase(&self) -> PhaseKind {
        match self {
            PhaseError::Transport { phase, .. } => *phase,
            PhaseError::AllProbesLost { .. } => PhaseKind::Latency,
            PhaseError::NoData(phase) => *phase,
            PhaseError::Remote { phase, .. } => *phase,
        }
    }
}

/// Intra-phase progress reported while a phase runs
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub kind: PhaseKind,
    /// 0..=100 through the phase
    pub percent: f64,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// Windowed instantaneous rate in bits per second
    pub rate_bps: Option<f64>,
    /// Cumulative bytes transferred so far
    pub bytes: Option<u64>,
}

impl PhaseUpdate {
    fn new(kind: PhaseKind, percent: f64) -> Self {
        Self {
            kind,
            percent: percent.clamp(0.0, 100.0),
            rtt_ms: None,
            jitter_ms: None,
            rate_bps: None,
            bytes: None,
        }
    }
}

/// Parse a text frame, logging and dropping anything that is not a valid
/// control message
fn decode_control(phase: PhaseKind, text: &str) -> Option<ControlMessage> {
    match ControlMessage::parse(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping control message during {} phase: {}", phase, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_control_drops_unknown_types() {
        assert_eq!(
            decode_control(PhaseKind::Download, r#"{"type":"stop"}"#),
            Some(ControlMessage::Stop)
        );
        assert_eq!(decode_control(PhaseKind::Download, r#"{"type":"teleport"}"#), None);
        assert_eq!(decode_control(PhaseKind::Latency, "not json"), None);
    }

    #[test]
    fn test_phase_error_reports_its_phase() {
        assert_eq!(PhaseError::AllProbesLost { attempted: 3 }.phase(), PhaseKind::Latency);
        let err = PhaseError::closed(PhaseKind::Upload, CloseReason::Remote);
        assert_eq!(err.phase(), PhaseKind::Upload);
        assert_eq!(
            err.to_string(),
            "upload phase lost its connection: Connection closed by peer"
        );
    }

    #[test]
    fn test_update_percent_is_clamped() {
        assert_eq!(PhaseUpdate::new(PhaseKind::Upload, 130.0).percent, 100.0);
        assert_eq!(PhaseUpdate::new(PhaseKind::Upload, -1.0).percent, 0.0);
    }
}
