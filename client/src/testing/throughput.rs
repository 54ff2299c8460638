//! Duration-bounded bulk transfer in both directions

use super::{Completion, PhaseError, PhaseKind, PhaseRecorder, PhaseResult, PhaseUpdate, Sample, decode_control};
use crate::analysis::stats;
use crate::config::{DownloadConfig, ThroughputConfig, UploadConfig};
use crate::transport::{Frame, Inbound, Transport};
use protocol::ControlMessage;
use protocol::payload::random_chunk;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns cumulative samples into a rate at most once per interval
///
/// The rate covers everything since the previous emission, so a burst of
/// tightly spaced chunks is averaged instead of reported as a spike.
#[derive(Debug)]
pub struct RateMeter {
    interval_ms: f64,
    last: Sample,
}

impl RateMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_secs_f64() * 1000.0,
            last: Sample::new(0.0, 0.0),
        }
    }

    /// Rate in bits per second since the last emission, once at least one
    /// interval has passed
    pub fn observe(&mut self, sample: Sample) -> Option<f64> {
        if sample.at_ms - self.last.at_ms < self.interval_ms {
            return None;
        }
        let rate = stats::instantaneous_rate(self.last, sample)?;
        self.last = sample;
        Some(rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Deadline,
    PeerComplete,
    Stalled,
    Cancelled,
}

impl StreamEnd {
    fn completion(self) -> Completion {
        match self {
            StreamEnd::Deadline | StreamEnd::PeerComplete => Completion::Full,
            StreamEnd::Stalled | StreamEnd::Cancelled => Completion::Partial,
        }
    }
}

fn progress(recorder: &PhaseRecorder, duration: Duration, sample: Sample, rate_bps: f64) -> PhaseUpdate {
    let percent = 100.0 * sample.at_ms / (duration.as_secs_f64() * 1000.0);
    let mut update = PhaseUpdate::new(recorder.kind(), percent);
    update.rate_bps = Some(rate_bps);
    update.bytes = Some(sample.value as u64);
    update
}

/// Tell the server to end the active stream
///
/// Failing to deliver `stop` only matters when the run is still going. A
/// link too congested to take it within `timeout` is left to the drain.
async fn send_stop<T: Transport + ?Sized>(
    conn: &mut T,
    phase: PhaseKind,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), PhaseError> {
    match tokio::time::timeout(timeout, conn.send_control(&ControlMessage::Stop)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if cancel.is_cancelled() => {
            debug!("Could not send stop after cancellation: {}", e);
            Ok(())
        }
        Ok(Err(e)) => Err(PhaseError::transport(phase, e)),
        Err(_) => {
            warn!("{} phase: stop still queued after {:?}", phase, timeout);
            Ok(())
        }
    }
}

/// Discard inbound frames until `accept` matches a control message or the
/// drain timeout passes. Returns what `accept` extracted, if anything.
async fn drain<T, F>(
    conn: &mut T,
    phase: PhaseKind,
    timeout: Duration,
    mut accept: F,
) -> Result<Option<u64>, PhaseError>
where
    T: Transport + ?Sized,
    F: FnMut(&ControlMessage) -> Option<u64>,
{
    let deadline = Instant::now() + timeout;
    let mut discarded = 0usize;
    let outcome = loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                warn!("{} phase: no completion from server within {:?}", phase, timeout);
                break None;
            }
            inbound = conn.recv() => match inbound {
                Inbound::Closed(reason) => {
                    warn!("{} phase: connection {} while draining", phase, reason);
                    break None;
                }
                Inbound::Frame(Frame::Binary(data)) => discarded += data.len(),
                Inbound::Frame(Frame::Text(text)) => match decode_control(phase, &text) {
                    Some(ControlMessage::Error { message, code }) => {
                        return Err(PhaseError::Remote { phase, code, message });
                    }
                    Some(message) => {
                        if let Some(value) = accept(&message) {
                            break Some(value);
                        }
                    }
                    None => {}
                },
            },
        }
    };
    if discarded > 0 {
        debug!("{} phase: discarded {} late bytes", phase, discarded);
    }
    Ok(outcome)
}

/// Receive a server stream until the deadline, completion, a stall or
/// cancellation
pub async fn download<T: Transport + ?Sized>(
    conn: &mut T,
    config: &DownloadConfig,
    throughput: &ThroughputConfig,
    cancel: &CancellationToken,
    on_update: &mut (dyn FnMut(PhaseUpdate) + Send),
) -> Result<PhaseResult, PhaseError> {
    const PHASE: PhaseKind = PhaseKind::Download;
    info!(
        "Download phase: {}ms, {} byte chunks",
        config.duration_ms, config.chunk_size
    );

    let mut recorder = PhaseRecorder::new(PHASE);
    let duration = Duration::from_millis(config.duration_ms);
    let deadline = recorder.clock().origin() + duration;
    let mut meter = RateMeter::new(throughput.progress_interval());

    conn.send_control(&ControlMessage::StartDownload {
        chunk_size: config.chunk_size as u64,
        duration_ms: config.duration_ms,
    })
    .await
    .map_err(|e| PhaseError::transport(PHASE, e))?;

    // Whole chunks are the unit of progress, so a slow link legitimately
    // goes one chunk time between frames
    let stall_timeout = throughput.stall_timeout(config.chunk_size).min(duration);
    let mut total: u64 = 0;
    let mut last_chunk = Instant::now();
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            _ = sleep_until(deadline) => break StreamEnd::Deadline,
            _ = sleep_until(last_chunk + stall_timeout) => {
                warn!("Download stalled: no chunk for {:?}", stall_timeout);
                break StreamEnd::Stalled;
            }
            inbound = conn.recv() => match inbound {
                Inbound::Closed(reason) => return Err(PhaseError::closed(PHASE, reason)),
                Inbound::Frame(Frame::Binary(data)) => {
                    last_chunk = Instant::now();
                    total += data.len() as u64;
                    recorder.attempt();
                    let sample = recorder.record(total as f64);
                    if let Some(rate) = meter.observe(sample) {
                        on_update(progress(&recorder, duration, sample, rate));
                    }
                }
                Inbound::Frame(Frame::Text(text)) => match decode_control(PHASE, &text) {
                    Some(ControlMessage::DownloadComplete { bytes_sent, .. }) => {
                        recorder.set_peer_bytes(bytes_sent);
                        break StreamEnd::PeerComplete;
                    }
                    Some(ControlMessage::DownloadProgress { bytes_sent, elapsed_ms }) => {
                        debug!("Server sent {} bytes in {}ms", bytes_sent, elapsed_ms);
                    }
                    Some(ControlMessage::Error { message, code }) => {
                        return Err(PhaseError::Remote { phase: PHASE, code, message });
                    }
                    Some(other) => debug!("Ignoring {} during download", other.kind()),
                    None => {}
                },
            },
        }
    };

    let mut result = recorder.finish(end.completion());

    if end != StreamEnd::PeerComplete {
        send_stop(conn, PHASE, throughput.drain_timeout(), cancel).await?;
    }
    if end != StreamEnd::PeerComplete && end != StreamEnd::Cancelled {
        let confirmed = drain(conn, PHASE, throughput.drain_timeout(), |message| match message {
            ControlMessage::DownloadComplete { bytes_sent, .. } => Some(*bytes_sent),
            _ => None,
        })
        .await?;
        if let Some(bytes) = confirmed {
            result = result.with_peer_bytes(bytes);
        }
    }

    if total == 0 && end != StreamEnd::Cancelled {
        return Err(PhaseError::NoData(PHASE));
    }

    info!(
        "Download phase done ({:?}): {} bytes in {} chunks",
        end,
        total,
        result.samples().len()
    );
    Ok(result)
}

/// Push random chunks to the server until the deadline or cancellation
///
/// Samples count bytes the transport has flushed onto the link, not bytes
/// merely queued, so a peer that stops reading shows up as a stalled rate.
/// The server's own count is kept on the result for comparison only.
pub async fn upload<T: Transport + ?Sized>(
    conn: &mut T,
    config: &UploadConfig,
    throughput: &ThroughputConfig,
    cancel: &CancellationToken,
    on_update: &mut (dyn FnMut(PhaseUpdate) + Send),
) -> Result<PhaseResult, PhaseError> {
    const PHASE: PhaseKind = PhaseKind::Upload;
    info!(
        "Upload phase: {}ms, {} byte chunks",
        config.duration_ms, config.chunk_size
    );

    let chunk = random_chunk(config.chunk_size);
    let mut recorder = PhaseRecorder::new(PHASE);
    let duration = Duration::from_millis(config.duration_ms);
    let deadline = recorder.clock().origin() + duration;
    let mut meter = RateMeter::new(throughput.progress_interval());

    conn.send_control(&ControlMessage::StartUpload {
        duration_ms: config.duration_ms,
    })
    .await
    .map_err(|e| PhaseError::transport(PHASE, e))?;

    // Flushed bytes are polled on every send and at least once per interval
    // while the queue is full
    let mut tick = interval(throughput.progress_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let baseline = conn.flushed_bytes();
    let mut flushed: u64 = 0;
    let mut observe = |recorder: &mut PhaseRecorder, conn: &T, flushed: &mut u64| {
        let now = conn.flushed_bytes().saturating_sub(baseline);
        if now > *flushed {
            *flushed = now;
            let sample = recorder.record(now as f64);
            if let Some(rate) = meter.observe(sample) {
                on_update(progress(recorder, duration, sample, rate));
            }
        }
    };

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            _ = sleep_until(deadline) => break StreamEnd::Deadline,
            _ = tick.tick() => {}
            sent = conn.send(Frame::Binary(chunk.clone())) => {
                sent.map_err(|e| PhaseError::transport(PHASE, e))?;
                recorder.attempt();
            }
        }
        observe(&mut recorder, &*conn, &mut flushed);
    };
    observe(&mut recorder, &*conn, &mut flushed);

    let mut result = recorder.finish(end.completion());
    send_stop(conn, PHASE, throughput.drain_timeout(), cancel).await?;
    if end != StreamEnd::Cancelled {
        let confirmed = drain(conn, PHASE, throughput.drain_timeout(), |message| match message {
            ControlMessage::UploadComplete { bytes_received, .. } => Some(*bytes_received),
            ControlMessage::UploadProgress { bytes_received, .. } => {
                debug!("Server confirmed {} bytes", bytes_received);
                None
            }
            _ => None,
        })
        .await?;
        if let Some(bytes) = confirmed {
            result = result.with_peer_bytes(bytes);
        }
    }

    if flushed == 0 && end != StreamEnd::Cancelled {
        return Err(PhaseError::NoData(PHASE));
    }

    info!(
        "Upload phase done ({:?}): {} bytes flushed of {} chunks queued, server confirmed {:?}",
        end,
        flushed,
        result.attempted(),
        result.peer_bytes()
    );
    Ok(result)
}
