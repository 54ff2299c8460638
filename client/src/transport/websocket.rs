//! WebSocket transport (tokio-tungstenite)

use super::{CloseReason, Frame, Inbound, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// WebSocket connection with a writer task behind a bounded queue and a
/// reader task feeding an inbound queue
pub struct WsTransport {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    closed: CancellationToken,
    close_reason: Option<CloseReason>,
    /// Binary bytes the writer task has written out
    flushed: Arc<AtomicU64>,
}

impl WsTransport {
    /// Connect to `url` (ws:// or wss://)
    pub async fn connect(
        url: &str,
        queue_depth: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (stream, response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                reason: format!("timed out after {:?}", timeout),
            })?
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        debug!("WebSocket connected to {} (status {})", url, response.status());
        Ok(Self::from_stream(stream, queue_depth))
    }

    /// Wrap an already established WebSocket stream
    pub fn from_stream<S>(stream: WebSocketStream<S>, queue_depth: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(queue_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let flushed = Arc::new(AtomicU64::new(0));

        let writer_closed = closed.clone();
        let writer_flushed = flushed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            let payload = match &message {
                                Message::Binary(data) => data.len() as u64,
                                _ => 0,
                            };
                            if let Err(e) = sink.send(message).await {
                                debug!("WebSocket writer stopped: {}", e);
                                break;
                            }
                            writer_flushed.fetch_add(payload, Ordering::Relaxed);
                        }
                        None => break,
                    },
                    _ = writer_closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    message = source.next() => message,
                };

                let event = match message {
                    Some(Ok(Message::Text(text))) => Inbound::Frame(Frame::Text(text)),
                    Some(Ok(Message::Binary(data))) => Inbound::Frame(Frame::Binary(Bytes::from(data))),
                    Some(Ok(Message::Close(_))) | None => Inbound::Closed(CloseReason::Remote),
                    Some(Ok(_)) => continue, // ping/pong are handled by tungstenite
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {}", e);
                        Inbound::Closed(CloseReason::Lost(e.to_string()))
                    }
                };

                let finished = matches!(event, Inbound::Closed(_));
                if inbound_tx.send(event).is_err() || finished {
                    break;
                }
            }
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            closed,
            close_reason: None,
            flushed,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed(CloseReason::Local));
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            // tungstenite frames own their payload
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed(CloseReason::Lost("writer stopped".to_string())))
    }

    async fn recv(&mut self) -> Inbound {
        if let Some(reason) = &self.close_reason {
            return Inbound::Closed(reason.clone());
        }

        let event = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Inbound::Closed(CloseReason::Local),
            event = self.inbound.recv() => event.unwrap_or(Inbound::Closed(CloseReason::Remote)),
        };

        if let Inbound::Closed(reason) = &event {
            self.close_reason = Some(reason.clone());
        }
        event
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn flushed_bytes(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Echo server that closes after echoing `count` messages
    async fn spawn_echo_server(count: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for _ in 0..count {
                match ws.next().await {
                    Some(Ok(msg)) if msg.is_text() || msg.is_binary() => ws.send(msg).await.unwrap(),
                    _ => return,
                }
            }
            let _ = ws.close(None).await;
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_websocket_round_trip_and_remote_close() {
        let url = spawn_echo_server(2).await;
        let mut transport = WsTransport::connect(&url, 4, Duration::from_secs(5)).await.unwrap();

        transport.send(Frame::Text("hello".into())).await.unwrap();
        transport
            .send(Frame::Binary(Bytes::from_static(&[1, 2, 3])))
            .await
            .unwrap();

        assert_eq!(transport.recv().await, Inbound::Frame(Frame::Text("hello".into())));
        assert_eq!(
            transport.recv().await,
            Inbound::Frame(Frame::Binary(Bytes::from_static(&[1, 2, 3])))
        );
        // Only binary payload is counted
        assert_eq!(transport.flushed_bytes(), 3);
        assert_eq!(transport.recv().await, Inbound::Closed(CloseReason::Remote));
        // Closure is sticky
        assert_eq!(transport.recv().await, Inbound::Closed(CloseReason::Remote));
    }

    #[tokio::test]
    async fn test_local_close_resolves_recv() {
        let url = spawn_echo_server(1).await;
        let mut transport = WsTransport::connect(&url, 4, Duration::from_secs(5)).await.unwrap();

        transport.close();
        assert_eq!(transport.recv().await, Inbound::Closed(CloseReason::Local));
        assert!(transport.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsTransport::connect(&format!("ws://{}", addr), 4, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
