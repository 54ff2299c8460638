//! Measurement data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Monotonic clock every sample of a phase is timestamped against
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Milliseconds since the clock started
    pub fn elapsed_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Measured phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Latency,
    Download,
    Upload,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseKind::Latency => write!(f, "latency"),
            PhaseKind::Download => write!(f, "download"),
            PhaseKind::Upload => write!(f, "upload"),
        }
    }
}

/// Whether a phase ran to its natural end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Full,
    /// Stopped early (cancellation, stalled stream); samples so far are kept
    Partial,
}

/// One `(timestamp, value)` reading
///
/// `at_ms` is milliseconds since phase start. `value` is an RTT in
/// milliseconds for latency phases and cumulative bytes for throughput phases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at_ms: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(at_ms: f64, value: f64) -> Self {
        Self { at_ms, value }
    }
}

/// Samples and bookkeeping of one finished phase. Immutable.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    kind: PhaseKind,
    samples: Vec<Sample>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    duration_ms: f64,
    attempted: u32,
    lost: u32,
    peer_bytes: Option<u64>,
    completion: Completion,
}

impl PhaseResult {
    /// Build a result from already collected samples
    pub fn from_samples(kind: PhaseKind, samples: &[Sample], completion: Completion) -> Self {
        let mut recorder = PhaseRecorder::new(kind);
        for sample in samples {
            recorder.attempt();
            recorder.record_at(sample.at_ms, sample.value);
        }
        let mut result = recorder.finish(completion);
        result.duration_ms = samples.last().map(|s| s.at_ms).unwrap_or(0.0);
        result
    }

    /// Attach the byte count the peer confirmed after the stream ended
    pub(crate) fn with_peer_bytes(mut self, bytes: u64) -> Self {
        self.peer_bytes = Some(bytes);
        self
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// Wall time the phase ran for, in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    /// Probes sent (latency) or chunks handled (throughput)
    pub fn attempted(&self) -> u32 {
        self.attempted
    }

    /// Probes that timed out without a matching reply
    pub fn lost(&self) -> u32 {
        self.lost
    }

    /// Byte count confirmed by the peer, informational only
    pub fn peer_bytes(&self) -> Option<u64> {
        self.peer_bytes
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn is_partial(&self) -> bool {
        self.completion == Completion::Partial
    }

    /// Sample timestamps never decrease
    pub fn is_monotonic(&self) -> bool {
        self.samples.windows(2).all(|w| w[0].at_ms <= w[1].at_ms)
    }

    /// Last recorded value, 0 if there are no samples
    pub fn last_value(&self) -> f64 {
        self.samples.last().map(|s| s.value).unwrap_or(0.0)
    }
}

/// Append-only builder owned by the driver of a running phase
#[derive(Debug)]
pub struct PhaseRecorder {
    kind: PhaseKind,
    clock: Clock,
    started_at: DateTime<Utc>,
    samples: Vec<Sample>,
    attempted: u32,
    lost: u32,
    peer_bytes: Option<u64>,
}

impl PhaseRecorder {
    pub fn new(kind: PhaseKind) -> Self {
        Self {
            kind,
            clock: Clock::start(),
            started_at: Utc::now(),
            samples: Vec::new(),
            attempted: 0,
            lost: 0,
            peer_bytes: None,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.clock.elapsed_ms()
    }

    /// Record `value` at the current clock reading
    pub fn record(&mut self, value: f64) -> Sample {
        let at_ms = self.clock.elapsed_ms();
        self.record_at(at_ms, value)
    }

    /// Record `value` at `at_ms`; a timestamp earlier than the previous
    /// sample is clamped to it
    pub fn record_at(&mut self, at_ms: f64, value: f64) -> Sample {
        let floor = self.samples.last().map(|s| s.at_ms).unwrap_or(0.0);
        let at_ms = if at_ms.is_finite() { at_ms.max(floor) } else { floor };
        let sample = Sample::new(at_ms, value);
        self.samples.push(sample);
        sample
    }

    pub fn attempt(&mut self) {
        self.attempted += 1;
    }

    pub fn record_lost(&mut self) {
        self.lost += 1;
    }

    pub fn set_peer_bytes(&mut self, bytes: u64) {
        self.peer_bytes = Some(bytes);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn attempted(&self) -> u32 {
        self.attempted
    }

    pub fn lost(&self) -> u32 {
        self.lost
    }

    pub fn finish(self, completion: Completion) -> PhaseResult {
        PhaseResult {
            kind: self.kind,
            duration_ms: self.clock.elapsed_ms(),
            samples: self.samples,
            started_at: self.started_at,
            ended_at: Utc::now(),
            attempted: self.attempted,
            lost: self.lost,
            peer_bytes: self.peer_bytes,
            completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_clamps_regressing_timestamps() {
        let mut recorder = PhaseRecorder::new(PhaseKind::Download);
        recorder.record_at(10.0, 100.0);
        let clamped = recorder.record_at(5.0, 200.0);
        recorder.record_at(f64::NAN, 300.0);

        assert_eq!(clamped.at_ms, 10.0);
        let result = recorder.finish(Completion::Full);
        assert!(result.is_monotonic());
        assert_eq!(result.samples().len(), 3);
        assert_eq!(result.last_value(), 300.0);
    }

    #[test]
    fn test_empty_result() {
        let result = PhaseRecorder::new(PhaseKind::Latency).finish(Completion::Partial);
        assert!(result.samples().is_empty());
        assert_eq!(result.last_value(), 0.0);
        assert!(result.is_partial());
        assert!(result.is_monotonic());
    }

    #[test]
    fn test_from_samples_keeps_order_and_duration() {
        let samples = [Sample::new(100.0, 1.0), Sample::new(250.0, 2.0)];
        let result = PhaseResult::from_samples(PhaseKind::Upload, &samples, Completion::Full);
        assert_eq!(result.samples(), &samples);
        assert_eq!(result.duration_ms(), 250.0);
        assert_eq!(result.attempted(), 2);
        assert_eq!(result.kind().to_string(), "upload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::start();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert!((clock.elapsed_ms() - 250.0).abs() < 1.0);
    }
}
