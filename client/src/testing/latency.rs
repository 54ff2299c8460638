//! Echo-based latency probing

use super::{Completion, PhaseError, PhaseKind, PhaseRecorder, PhaseResult, PhaseUpdate, decode_control};
use crate::analysis::stats;
use crate::config::LatencyConfig;
use crate::transport::{Frame, Inbound, Transport};
use protocol::ControlMessage;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PHASE: PhaseKind = PhaseKind::Latency;

/// Sends sequential ping probes and times the matching pongs
///
/// The sequence counter lives on the prober, so probes from successive runs
/// never reuse a number and a late pong from an earlier run is recognized as
/// stale.
#[derive(Debug, Default)]
pub struct LatencyProber {
    next_seq: u64,
}

enum ProbeOutcome {
    Reply(f64),
    Lost,
    Cancelled,
}

impl LatencyProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence number handed out
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    pub async fn probe<T: Transport + ?Sized>(
        &mut self,
        conn: &mut T,
        config: &LatencyConfig,
        cancel: &CancellationToken,
        on_update: &mut (dyn FnMut(PhaseUpdate) + Send),
    ) -> Result<PhaseResult, PhaseError> {
        info!(
            "Latency phase: {} probes, {}ms apart, {}ms timeout",
            config.count, config.interval_ms, config.timeout_ms
        );
        let mut recorder = PhaseRecorder::new(PHASE);
        let mut completion = Completion::Full;

        for i in 0..config.count {
            if cancel.is_cancelled() {
                completion = Completion::Partial;
                break;
            }

            match self.probe_once(conn, &recorder, config, cancel).await? {
                ProbeOutcome::Reply(rtt_ms) => {
                    recorder.attempt();
                    recorder.record(rtt_ms);
                    let rtts: Vec<f64> = recorder.samples().iter().map(|s| s.value).collect();
                    let mut update = PhaseUpdate::new(
                        PHASE,
                        100.0 * (i + 1) as f64 / config.count as f64,
                    );
                    update.rtt_ms = Some(rtt_ms);
                    update.jitter_ms = Some(stats::jitter(&rtts));
                    on_update(update);
                }
                ProbeOutcome::Lost => {
                    recorder.attempt();
                    recorder.record_lost();
                    on_update(PhaseUpdate::new(
                        PHASE,
                        100.0 * (i + 1) as f64 / config.count as f64,
                    ));
                }
                ProbeOutcome::Cancelled => {
                    completion = Completion::Partial;
                    break;
                }
            }

            if i + 1 < config.count {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        completion = Completion::Partial;
                        break;
                    }
                    _ = sleep(config.interval()) => {}
                }
            }
        }

        if recorder.samples().is_empty() && completion == Completion::Full {
            return Err(PhaseError::AllProbesLost {
                attempted: recorder.attempted(),
            });
        }

        let result = recorder.finish(completion);
        info!(
            "Latency phase done: {}/{} replies",
            result.samples().len(),
            result.attempted()
        );
        Ok(result)
    }

    /// Send one ping and wait for its pong, the timeout or cancellation
    async fn probe_once<T: Transport + ?Sized>(
        &mut self,
        conn: &mut T,
        recorder: &PhaseRecorder,
        config: &LatencyConfig,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, PhaseError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let clock = recorder.clock();
        let send_time = clock.elapsed_ms();

        conn.send_control(&ControlMessage::Ping { seq, send_time })
            .await
            .map_err(|e| PhaseError::transport(PHASE, e))?;

        let deadline = Instant::now() + config.timeout();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ProbeOutcome::Cancelled),
                _ = sleep_until(deadline) => {
                    debug!("Probe {} timed out", seq);
                    return Ok(ProbeOutcome::Lost);
                }
                inbound = conn.recv() => match inbound {
                    Inbound::Closed(reason) => return Err(PhaseError::closed(PHASE, reason)),
                    Inbound::Frame(Frame::Binary(data)) => {
                        debug!("Dropping {} stray binary bytes", data.len());
                    }
                    Inbound::Frame(Frame::Text(text)) => match decode_control(PHASE, &text) {
                        Some(ControlMessage::Pong { seq: reply, .. }) if reply == seq => {
                            let rtt_ms = clock.elapsed_ms() - send_time;
                            debug!("Probe {} -> {:.2}ms", seq, rtt_ms);
                            return Ok(ProbeOutcome::Reply(rtt_ms));
                        }
                        Some(ControlMessage::Pong { seq: reply, .. }) => {
                            warn!("Dropping stale pong {} while waiting for {}", reply, seq);
                        }
                        Some(ControlMessage::Error { message, code }) => {
                            return Err(PhaseError::Remote { phase: PHASE, code, message });
                        }
                        Some(other) => debug!("Ignoring {} during latency phase", other.kind()),
                        None => {}
                    },
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, memory_pair};
    use std::time::Duration;

    fn config(count: u32) -> LatencyConfig {
        LatencyConfig {
            count,
            interval_ms: 100,
            timeout_ms: 500,
        }
    }

    /// Echo peer that answers each ping after `delay_ms`, skipping the
    /// sequence numbers in `drop_seqs`
    fn spawn_echo(mut peer: MemoryTransport, delay_ms: u64, drop_seqs: Vec<u64>) {
        tokio::spawn(async move {
            while let Inbound::Frame(Frame::Text(text)) = peer.recv().await {
                let Ok(ControlMessage::Ping { seq, send_time }) = ControlMessage::parse(&text) else {
                    continue;
                };
                if drop_seqs.contains(&seq) {
                    continue;
                }
                sleep(Duration::from_millis(delay_ms)).await;
                if peer
                    .send_control(&ControlMessage::Pong { seq, send_time })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtts_follow_peer_delay() {
        let (mut conn, peer) = memory_pair(16);
        spawn_echo(peer, 30, Vec::new());

        let mut updates = Vec::new();
        let mut prober = LatencyProber::new();
        let result = prober
            .probe(&mut conn, &config(5), &CancellationToken::new(), &mut |u| updates.push(u))
            .await
            .unwrap();

        assert_eq!(result.samples().len(), 5);
        assert_eq!(result.attempted(), 5);
        assert_eq!(result.lost(), 0);
        assert!(!result.is_partial());
        for sample in result.samples() {
            assert!((sample.value - 30.0).abs() < 1.0, "rtt was {}", sample.value);
        }
        assert!(result.is_monotonic());
        assert_eq!(updates.len(), 5);
        assert_eq!(updates[4].percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_probes_are_counted() {
        let (mut conn, peer) = memory_pair(16);
        spawn_echo(peer, 10, vec![2, 4]);

        let mut prober = LatencyProber::new();
        let mut updates = Vec::new();
        let result = prober
            .probe(&mut conn, &config(5), &CancellationToken::new(), &mut |u| updates.push(u))
            .await
            .unwrap();

        assert_eq!(result.attempted(), 5);
        assert_eq!(result.lost(), 2);
        assert_eq!(result.samples().len(), 3);

        // Progress moves on lost pings too, without an RTT
        assert_eq!(updates.len(), 5);
        assert_eq!(updates.iter().filter(|u| u.rtt_ms.is_none()).count(), 2);
        assert!(updates.windows(2).all(|w| w[0].percent < w[1].percent));
        assert_eq!(updates[4].percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_probes_lost_fails_phase() {
        let (mut conn, peer) = memory_pair(16);
        spawn_echo(peer, 10, vec![1, 2, 3]);

        let mut prober = LatencyProber::new();
        let err = prober
            .probe(&mut conn, &config(3), &CancellationToken::new(), &mut |_| {})
            .await
            .unwrap_err();

        assert_eq!(err, PhaseError::AllProbesLost { attempted: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_survives_runs_and_stale_pongs_are_dropped() {
        let (mut conn, mut peer) = memory_pair(16);
        tokio::spawn(async move {
            while let Inbound::Frame(Frame::Text(text)) = peer.recv().await {
                let Ok(ControlMessage::Ping { seq, send_time }) = ControlMessage::parse(&text) else {
                    continue;
                };
                // A late reply to an older probe arrives first
                let stale = ControlMessage::Pong { seq: seq.saturating_sub(1), send_time: 0.0 };
                let _ = peer.send_control(&stale).await;
                sleep(Duration::from_millis(5)).await;
                let _ = peer.send_control(&ControlMessage::Pong { seq, send_time }).await;
            }
        });

        let mut prober = LatencyProber::new();
        let token = CancellationToken::new();
        let first = prober.probe(&mut conn, &config(2), &token, &mut |_| {}).await.unwrap();
        let second = prober.probe(&mut conn, &config(2), &token, &mut |_| {}).await.unwrap();

        assert_eq!(prober.last_seq(), 4);
        assert_eq!(first.samples().len(), 2);
        assert_eq!(second.samples().len(), 2);
        assert!(second.samples().iter().all(|s| (s.value - 5.0).abs() < 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_partial_result() {
        let (mut conn, peer) = memory_pair(16);
        spawn_echo(peer, 10, Vec::new());

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let mut prober = LatencyProber::new();
        let result = prober
            .probe(&mut conn, &config(10), &token, &mut |_| {})
            .await
            .unwrap();

        assert!(result.is_partial());
        assert!(!result.samples().is_empty());
        assert!(result.samples().len() < 10);
        assert_eq!(result.lost(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_fails_phase() {
        let (mut conn, mut peer) = memory_pair(16);
        tokio::spawn(async move {
            let _ = peer.recv().await;
            let _ = peer
                .send_control(&ControlMessage::error(503, "echo disabled"))
                .await;
            sleep(Duration::from_secs(5)).await;
        });

        let mut prober = LatencyProber::new();
        let err = prober
            .probe(&mut conn, &config(3), &CancellationToken::new(), &mut |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PhaseError::Remote {
                phase: PhaseKind::Latency,
                code: 503,
                message: "echo disabled".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_connection_fails_phase() {
        let (mut conn, peer) = memory_pair(16);
        drop(peer);

        let mut prober = LatencyProber::new();
        let err = prober
            .probe(&mut conn, &config(3), &CancellationToken::new(), &mut |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PhaseError::Transport { phase: PhaseKind::Latency, .. }));
    }
}
