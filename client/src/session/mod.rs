//! Measurement session
//!
//! A [`Session`] runs the latency, download and upload phases in that order
//! over a borrowed [`Transport`], then aggregates the results into a
//! [`Report`]. One session is one run: `start` succeeds at most once.

mod progress;
mod state;

pub use progress::{MetricSnapshot, NoopObserver, ProgressEvent, ProgressObserver};
pub use state::{SessionEvent, SessionState, transition};

use crate::analysis::{self, Report, ReportMeta, RunStatus};
use crate::config::{ConfigError, SessionConfig};
use crate::testing::{self, LatencyProber, PhaseError, PhaseKind, PhaseResult, PhaseUpdate};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use progress::overall_percent;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("Session is not idle (state: {state})")]
    AlreadyRunning { state: SessionState },

    #[error("Invalid session configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{phase} phase failed: {source}")]
    PhaseFailed { phase: PhaseKind, source: PhaseError },

    #[error("Invalid transition from {from} on {event:?}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },
}

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    state: RwLock<SessionState>,
    results: Mutex<Vec<PhaseResult>>,
    snapshot: Mutex<MetricSnapshot>,
    /// Last overall percent, carried into terminal events
    percent: Mutex<f64>,
    prober: Mutex<LatencyProber>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    observer: Box<dyn ProgressObserver>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: RwLock::new(SessionState::Idle),
            results: Mutex::new(Vec::new()),
            snapshot: Mutex::new(MetricSnapshot::default()),
            percent: Mutex::new(0.0),
            prober: Mutex::new(LatencyProber::new()),
            started_at: Mutex::new(None),
            cancel: CancellationToken::new(),
            observer: Box::new(NoopObserver),
        }
    }

    /// Register the observer that receives every progress event
    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    /// Results of the phases that have finished so far
    pub fn phase_results(&self) -> Vec<PhaseResult> {
        self.results.lock().clone()
    }

    /// Latest live readings
    pub fn snapshot(&self) -> MetricSnapshot {
        self.snapshot.lock().clone()
    }

    /// Request cancellation; the running phase stops at its next await point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this session when triggered
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every phase over `conn` and return the report
    ///
    /// The connection is borrowed, never closed. A cancelled run still
    /// returns `Ok` with a report marked cancelled.
    pub async fn start<T: Transport + ?Sized>(&self, conn: &mut T) -> Result<Report, SessionError> {
        {
            let mut state = self.state.write();
            if *state != SessionState::Idle {
                return Err(SessionError::AlreadyRunning { state: *state });
            }
            self.config.validate()?;
            *state = transition(*state, SessionEvent::Start)?;
        }
        let started_at = Utc::now();
        *self.started_at.lock() = Some(started_at);
        info!("Session {} started", self.id);
        self.emit(SessionState::Probing, 0.0);

        for phase in [PhaseKind::Latency, PhaseKind::Download, PhaseKind::Upload] {
            match self.run_phase(phase, conn).await {
                Ok(result) => {
                    if !result.is_monotonic() {
                        error!("{} phase produced out-of-order samples", phase);
                    }
                    self.results.lock().push(result);
                    if self.cancel.is_cancelled() {
                        return self.finish_cancelled(started_at);
                    }
                    let next = self.advance(SessionEvent::PhaseCompleted)?;
                    self.emit(next, 0.0);
                }
                Err(e) if self.cancel.is_cancelled() => {
                    warn!("{} phase error after cancellation: {}", phase, e);
                    return self.finish_cancelled(started_at);
                }
                Err(e) => {
                    error!("Session {} failed in {} phase: {}", self.id, phase, e);
                    let failed = self.advance(SessionEvent::Fail)?;
                    self.emit(failed, 0.0);
                    return Err(SessionError::PhaseFailed { phase, source: e });
                }
            }
        }

        let report = self.build_report(RunStatus::Completed, started_at);
        let done = self.advance(SessionEvent::AggregationDone)?;
        self.emit(done, 100.0);
        info!(
            "Session {} completed: {} ms, {:.2} Mbps down, {:.2} Mbps up, score {:.0}",
            self.id,
            report.latency_display(),
            report.download_mbps(),
            report.upload_mbps(),
            report.quality_score
        );
        Ok(report)
    }

    async fn run_phase<T: Transport + ?Sized>(
        &self,
        phase: PhaseKind,
        conn: &mut T,
    ) -> Result<PhaseResult, PhaseError> {
        let mut on_update = |update: PhaseUpdate| self.on_phase_update(update);
        match phase {
            PhaseKind::Latency => {
                // Single flight: only the running session touches the prober
                let mut prober = std::mem::take(&mut *self.prober.lock());
                let result = prober
                    .probe(conn, &self.config.latency, &self.cancel, &mut on_update)
                    .await;
                *self.prober.lock() = prober;
                result
            }
            PhaseKind::Download => {
                testing::download(
                    conn,
                    &self.config.download,
                    &self.config.throughput,
                    &self.cancel,
                    &mut on_update,
                )
                .await
            }
            PhaseKind::Upload => {
                testing::upload(
                    conn,
                    &self.config.upload,
                    &self.config.throughput,
                    &self.cancel,
                    &mut on_update,
                )
                .await
            }
        }
    }

    fn on_phase_update(&self, update: PhaseUpdate) {
        self.snapshot.lock().apply(&update);
        self.emit(self.state(), update.percent);
    }

    fn advance(&self, event: SessionEvent) -> Result<SessionState, SessionError> {
        let mut state = self.state.write();
        let next = transition(*state, event)?;
        info!("Session {}: {} -> {}", self.id, *state, next);
        *state = next;
        Ok(next)
    }

    fn emit(&self, state: SessionState, phase_percent: f64) {
        let percent_complete = match state {
            SessionState::Failed | SessionState::Cancelled => *self.percent.lock(),
            _ => overall_percent(state, phase_percent),
        };
        *self.percent.lock() = percent_complete;
        let event = ProgressEvent {
            session_id: self.id,
            state,
            phase: state.phase(),
            percent_complete,
            snapshot: self.snapshot(),
        };
        self.observer.on_progress(&event);
    }

    fn finish_cancelled(&self, started_at: DateTime<Utc>) -> Result<Report, SessionError> {
        let cancelled = self.advance(SessionEvent::Cancel)?;
        let report = self.build_report(RunStatus::Cancelled, started_at);
        self.emit(cancelled, 0.0);
        info!(
            "Session {} cancelled after {} phase(s)",
            self.id,
            self.results.lock().len()
        );
        Ok(report)
    }

    fn build_report(&self, status: RunStatus, started_at: DateTime<Utc>) -> Report {
        let meta = ReportMeta {
            session_id: self.id,
            status,
            started_at,
            finished_at: Utc::now(),
        };
        let results = self.results.lock();
        analysis::aggregate(&results, &self.config, meta)
    }
}
