//! Progress events and observers

use super::SessionState;
use crate::testing::{PhaseKind, PhaseUpdate};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Latest live readings of a running session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_bps: Option<f64>,
    pub upload_bps: Option<f64>,
    /// Bytes moved so far in the current throughput phase
    pub bytes: Option<u64>,
}

impl MetricSnapshot {
    pub(crate) fn apply(&mut self, update: &PhaseUpdate) {
        if update.rtt_ms.is_some() {
            self.latency_ms = update.rtt_ms;
        }
        if update.jitter_ms.is_some() {
            self.jitter_ms = update.jitter_ms;
        }
        if let Some(rate) = update.rate_bps {
            match update.kind {
                PhaseKind::Download => self.download_bps = Some(rate),
                PhaseKind::Upload => self.upload_bps = Some(rate),
                PhaseKind::Latency => {}
            }
        }
        if update.bytes.is_some() {
            self.bytes = update.bytes;
        }
    }
}

/// Emitted on every state transition and on intra-phase progress
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub session_id: Uuid,
    pub state: SessionState,
    pub phase: Option<PhaseKind>,
    /// 0..=100 over the whole session
    pub percent_complete: f64,
    pub snapshot: MetricSnapshot,
}

/// Receives progress events. Called on the session's task, so it should
/// return quickly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

impl ProgressObserver for mpsc::UnboundedSender<ProgressEvent> {
    fn on_progress(&self, event: &ProgressEvent) {
        // A dropped receiver just stops listening
        let _ = self.send(event.clone());
    }
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Overall progress given the current state and the percent through it
pub(crate) fn overall_percent(state: SessionState, phase_percent: f64) -> f64 {
    match state {
        SessionState::Completed => 100.0,
        SessionState::Aggregating => 100.0,
        _ => {
            let done = state.ordinal() as f64 * 100.0 + phase_percent.clamp(0.0, 100.0);
            done / 3.0
        }
    }
}
