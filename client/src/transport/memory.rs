//! In-process transport pair
//!
//! Two [`MemoryTransport`] ends joined by bounded channels. Used to drive a
//! session against an in-process peer, mostly in tests.

use super::{CloseReason, Frame, Inbound, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    inbound: mpsc::Receiver<Frame>,
    /// Cancelled when this end calls `close`
    local_closed: CancellationToken,
    /// Cancelled when the other end calls `close`
    remote_closed: CancellationToken,
    /// Binary bytes the other end has taken off our outbound queue
    flushed: Arc<AtomicU64>,
    /// Binary bytes we have taken off the inbound queue
    taken: Arc<AtomicU64>,
}

/// Create two connected ends, each direction buffering up to `capacity` frames
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let a_closed = CancellationToken::new();
    let b_closed = CancellationToken::new();
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let a = MemoryTransport {
        outbound: Mutex::new(Some(a_tx)),
        inbound: a_rx,
        local_closed: a_closed.clone(),
        remote_closed: b_closed.clone(),
        flushed: a_to_b.clone(),
        taken: b_to_a.clone(),
    };
    let b = MemoryTransport {
        outbound: Mutex::new(Some(b_tx)),
        inbound: b_rx,
        local_closed: b_closed,
        remote_closed: a_closed,
        flushed: b_to_a,
        taken: a_to_b,
    };
    (a, b)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.remote_closed.is_cancelled() {
            return Err(TransportError::Closed(CloseReason::Remote));
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::Closed(CloseReason::Local))?;

        tokio::select! {
            result = sender.send(frame) => result.map_err(|_| {
                TransportError::Closed(CloseReason::Lost("peer dropped".to_string()))
            }),
            _ = self.remote_closed.cancelled() => Err(TransportError::Closed(CloseReason::Remote)),
        }
    }

    async fn recv(&mut self) -> Inbound {
        tokio::select! {
            biased;
            _ = self.local_closed.cancelled() => Inbound::Closed(CloseReason::Local),
            frame = self.inbound.recv() => match frame {
                Some(frame) => {
                    if let Frame::Binary(data) = &frame {
                        self.taken.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Inbound::Frame(frame)
                }
                None => Inbound::Closed(CloseReason::Remote),
            },
        }
    }

    fn close(&self) {
        self.outbound.lock().take();
        self.local_closed.cancel();
    }

    fn flushed_bytes(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, mut b) = memory_pair(8);
        a.send(Frame::Text("one".into())).await.unwrap();
        a.send(Frame::Binary(Bytes::from_static(b"two"))).await.unwrap();
        // Queued but not yet taken by the other end
        assert_eq!(a.flushed_bytes(), 0);

        assert_eq!(b.recv().await, Inbound::Frame(Frame::Text("one".into())));
        assert_eq!(
            b.recv().await,
            Inbound::Frame(Frame::Binary(Bytes::from_static(b"two")))
        );
        assert_eq!(a.flushed_bytes(), 3);
        assert_eq!(b.flushed_bytes(), 0);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let (mut a, mut b) = memory_pair(8);
        a.send(Frame::Text("last".into())).await.unwrap();
        a.close();

        assert_eq!(a.recv().await, Inbound::Closed(CloseReason::Local));
        // Frames sent before the close are still delivered
        assert_eq!(b.recv().await, Inbound::Frame(Frame::Text("last".into())));
        assert_eq!(b.recv().await, Inbound::Closed(CloseReason::Remote));
        assert_eq!(
            b.send(Frame::Text("late".into())).await,
            Err(TransportError::Closed(CloseReason::Remote))
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (a, mut b) = memory_pair(1);
        a.send(Frame::Text("fills queue".into())).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            a.send(Frame::Text("waits".into())),
        )
        .await;
        assert!(blocked.is_err());

        assert!(matches!(b.recv().await, Inbound::Frame(_)));
        a.send(Frame::Text("fits now".into())).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_peer_is_lost_connection() {
        let (a, b) = memory_pair(1);
        drop(b);
        assert!(matches!(
            a.send(Frame::Text("x".into())).await,
            Err(TransportError::Closed(CloseReason::Lost(_)))
        ));
    }
}
