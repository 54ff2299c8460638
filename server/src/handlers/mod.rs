//! Per-connection message handling
//!
//! Each WebSocket connection gets a writer task fed by a bounded queue and a
//! [`ConnectionHandler`] driven by the reader loop. Download streams run in
//! their own task so the reader keeps seeing `ping` and `stop` while chunks
//! go out.

pub mod echo;
pub mod throughput;

pub use echo::handle_ping;
pub use throughput::{DownloadHandle, UploadTally, spawn_download};

use crate::config::LimitsConfig;
use crate::session::ConnectionRegistry;
use futures::{SinkExt, StreamExt};
use protocol::{ControlMessage, ProtocolError, error_codes, payload::PayloadPool};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("connection writer is gone")]
    Disconnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State shared by all connections
pub struct ServerContext {
    pub limits: LimitsConfig,
    pub log_echo_requests: bool,
    pub pool: PayloadPool,
    pub registry: Arc<ConnectionRegistry>,
}

impl ServerContext {
    /// Build the context, generating a payload pool big enough for the
    /// largest allowed chunk
    pub fn new(limits: LimitsConfig, log_echo_requests: bool, registry: Arc<ConnectionRegistry>) -> Self {
        let pool = PayloadPool::new(limits.max_chunk_size);
        Self {
            limits,
            log_echo_requests,
            pool,
            registry,
        }
    }
}

/// Handles the messages of one connection
pub struct ConnectionHandler {
    connection_id: u64,
    outbound: mpsc::Sender<Message>,
    ctx: Arc<ServerContext>,
    download: Option<DownloadHandle>,
    upload: Option<UploadTally>,
}

impl ConnectionHandler {
    pub fn new(connection_id: u64, outbound: mpsc::Sender<Message>, ctx: Arc<ServerContext>) -> Self {
        Self {
            connection_id,
            outbound,
            ctx,
            download: None,
            upload: None,
        }
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), HandlerError> {
        let json = message.to_json()?;
        self.outbound
            .send(Message::Text(json))
            .await
            .map_err(|_| HandlerError::Disconnected)
    }

    async fn reject(&self, code: u16, message: String) -> Result<(), HandlerError> {
        debug!("Connection {}: rejecting request ({}): {}", self.connection_id, code, message);
        self.send_control(&ControlMessage::error(code, message)).await
    }

    /// Handle one inbound frame
    pub async fn handle(&mut self, message: Message) -> Result<(), HandlerError> {
        match message {
            Message::Text(text) => match ControlMessage::parse(&text) {
                Ok(control) => self.handle_control(control).await,
                Err(e) => self.reject(error_codes::BAD_REQUEST, e.to_string()).await,
            },
            Message::Binary(data) => {
                match self.upload.as_mut() {
                    Some(tally) => {
                        if let Some(progress) = tally.record(data.len()) {
                            self.send_control(&progress).await?;
                        }
                    }
                    None => debug!(
                        "Connection {}: dropping {} bytes outside an upload",
                        self.connection_id,
                        data.len()
                    ),
                }
                Ok(())
            }
            // Ping/pong/close frames are handled by the WebSocket layer
            _ => Ok(()),
        }
    }

    async fn handle_control(&mut self, message: ControlMessage) -> Result<(), HandlerError> {
        match message {
            ControlMessage::Ping { seq, send_time } => {
                let pong = handle_ping(self.connection_id, seq, send_time, self.ctx.log_echo_requests);
                self.send_control(&pong).await
            }
            ControlMessage::StartDownload { chunk_size, duration_ms } => {
                self.start_download(chunk_size, duration_ms).await
            }
            ControlMessage::StartUpload { duration_ms } => self.start_upload(duration_ms).await,
            ControlMessage::Stop => self.stop().await,
            other => {
                let err = ProtocolError::Unexpected {
                    received: other.kind(),
                    context: "serving a client",
                };
                self.reject(error_codes::BAD_REQUEST, err.to_string()).await
            }
        }
    }

    fn check_duration(&self, duration_ms: u64) -> Result<Duration, (u16, String)> {
        if duration_ms == 0 {
            return Err((error_codes::BAD_REQUEST, "duration must be greater than zero".to_string()));
        }
        if duration_ms > self.ctx.limits.max_duration_ms {
            return Err((
                error_codes::LIMIT_EXCEEDED,
                format!("duration {} ms exceeds limit of {} ms", duration_ms, self.ctx.limits.max_duration_ms),
            ));
        }
        Ok(Duration::from_millis(duration_ms))
    }

    /// Collect a download stream that ran to its deadline on its own
    async fn reap_download(&mut self) {
        if self.download.as_ref().is_some_and(DownloadHandle::is_finished) {
            if let Some(handle) = self.download.take() {
                let sent = handle.stop().await;
                self.ctx.registry.record_transfer(self.connection_id, 0, sent).await;
            }
        }
    }

    fn stream_active(&self) -> bool {
        self.download.is_some() || self.upload.is_some()
    }

    async fn start_download(&mut self, chunk_size: u64, duration_ms: u64) -> Result<(), HandlerError> {
        self.reap_download().await;
        if self.stream_active() {
            return self.reject(error_codes::BUSY, "a stream is already active".to_string()).await;
        }

        let limit = self.ctx.limits.max_chunk_size.min(self.ctx.pool.capacity());
        if chunk_size == 0 {
            return self.reject(error_codes::BAD_REQUEST, "chunk size must be greater than zero".to_string()).await;
        }
        let chunk = match usize::try_from(chunk_size).ok().filter(|size| *size <= limit) {
            Some(size) => self.ctx.pool.chunk(size),
            None => None,
        };
        let Some(chunk) = chunk else {
            return self
                .reject(
                    error_codes::LIMIT_EXCEEDED,
                    format!("chunk size {} exceeds limit of {} bytes", chunk_size, limit),
                )
                .await;
        };
        let duration = match self.check_duration(duration_ms) {
            Ok(duration) => duration,
            Err((code, message)) => return self.reject(code, message).await,
        };

        info!(
            "Connection {}: download of {} byte chunks for {} ms",
            self.connection_id, chunk_size, duration_ms
        );
        self.download = Some(spawn_download(
            self.outbound.clone(),
            chunk,
            duration,
            self.ctx.limits.progress_interval(),
        ));
        Ok(())
    }

    async fn start_upload(&mut self, duration_ms: u64) -> Result<(), HandlerError> {
        self.reap_download().await;
        if self.stream_active() {
            return self.reject(error_codes::BUSY, "a stream is already active".to_string()).await;
        }
        let duration = match self.check_duration(duration_ms) {
            Ok(duration) => duration,
            Err((code, message)) => return self.reject(code, message).await,
        };

        info!("Connection {}: upload for {} ms", self.connection_id, duration_ms);
        self.upload = Some(UploadTally::new(duration, self.ctx.limits.progress_interval()));
        Ok(())
    }

    /// When the active upload runs out, if there is one
    pub fn upload_deadline(&self) -> Option<Instant> {
        self.upload.as_ref().map(UploadTally::deadline)
    }

    /// End an upload whose client never sent `stop`
    pub async fn expire_upload(&mut self) -> Result<(), HandlerError> {
        if self.upload.is_some() {
            warn!("Connection {}: upload ran past its duration without stop", self.connection_id);
        }
        self.finish_upload().await
    }

    async fn finish_upload(&mut self) -> Result<(), HandlerError> {
        let Some(tally) = self.upload.take() else {
            return Ok(());
        };
        let received = tally.bytes_received();
        self.ctx.registry.record_transfer(self.connection_id, received, 0).await;
        info!("Connection {}: upload done, {} bytes", self.connection_id, received);
        self.send_control(&tally.complete()).await
    }

    async fn stop(&mut self) -> Result<(), HandlerError> {
        if let Some(handle) = self.download.take() {
            // The streamer sends download-complete itself
            let sent = handle.stop().await;
            self.ctx.registry.record_transfer(self.connection_id, 0, sent).await;
            return Ok(());
        }
        if self.upload.is_some() {
            return self.finish_upload().await;
        }
        debug!("Connection {}: stop with no active stream", self.connection_id);
        Ok(())
    }

    /// End any active stream when the connection goes away
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.download.take() {
            let sent = handle.stop().await;
            self.ctx.registry.record_transfer(self.connection_id, 0, sent).await;
        }
        if let Some(tally) = self.upload.take() {
            self.ctx
                .registry
                .record_transfer(self.connection_id, tally.bytes_received(), 0)
                .await;
        }
    }
}

/// Serve one accepted WebSocket connection until it closes
pub async fn serve_connection<S>(ws: WebSocketStream<S>, connection_id: u64, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(ctx.limits.send_queue_depth.max(1));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!("Connection {}: writer stopped: {}", connection_id, e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let mut handler = ConnectionHandler::new(connection_id, outbound_tx, ctx.clone());
    loop {
        let upload_deadline = handler.upload_deadline();
        let message = tokio::select! {
            message = source.next() => message,
            _ = sleep_until(upload_deadline.unwrap_or_else(Instant::now)), if upload_deadline.is_some() => {
                if let Err(e) = handler.expire_upload().await {
                    debug!("Connection {}: {}", connection_id, e);
                    break;
                }
                continue;
            }
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if let Err(e) = handler.handle(message).await {
                    debug!("Connection {}: {}", connection_id, e);
                    break;
                }
            }
            Err(e) => {
                warn!("Connection {}: read error: {}", connection_id, e);
                break;
            }
        }
    }

    handler.shutdown().await;
    // Dropping the last sender ends the writer
    drop(handler);
    let _ = writer.await;

    if let Some(info) = ctx.registry.unregister(connection_id).await {
        let connected_for = chrono::Utc::now() - info.connected_at;
        info!(
            "Connection {} from {} closed after {}s (sent {} bytes, received {} bytes)",
            connection_id,
            info.client_addr,
            connected_for.num_seconds(),
            info.bytes_sent,
            info.bytes_received
        );
    }
}
