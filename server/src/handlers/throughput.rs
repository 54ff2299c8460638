//! Throughput handlers (download streaming and upload accounting)

use bytes::Bytes;
use protocol::ControlMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn control_frame(message: &ControlMessage) -> Option<Message> {
    match message.to_json() {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!("Failed to encode {}: {}", message.kind(), e);
            None
        }
    }
}

/// A running download stream
pub struct DownloadHandle {
    cancel: CancellationToken,
    task: JoinHandle<u64>,
}

impl DownloadHandle {
    /// Stop the stream and wait for it to send `download-complete`.
    /// Returns the bytes it sent.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        self.task.await.unwrap_or(0)
    }

    /// True once the stream has ended on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start streaming `chunk` into `outbound` for `duration`
///
/// `outbound` is bounded, so a client that reads slowly slows the streamer
/// down instead of growing a buffer. The stream ends on the deadline or on
/// cancellation, and always finishes with `download-complete`.
pub fn spawn_download(
    outbound: mpsc::Sender<Message>,
    chunk: Bytes,
    duration: Duration,
    progress_interval: Duration,
) -> DownloadHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(stream_download(
        outbound,
        chunk,
        duration,
        progress_interval,
        cancel.clone(),
    ));
    DownloadHandle { cancel, task }
}

async fn stream_download(
    outbound: mpsc::Sender<Message>,
    chunk: Bytes,
    duration: Duration,
    progress_interval: Duration,
    cancel: CancellationToken,
) -> u64 {
    let start = Instant::now();
    let deadline = start + duration;
    let mut next_progress = start + progress_interval;
    let mut bytes_sent: u64 = 0;

    info!("Download stream: {} byte chunks for {:?}", chunk.len(), duration);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline) => break,
            // tungstenite frames own their payload, so each send copies the chunk
            sent = outbound.send(Message::Binary(chunk.to_vec())) => {
                if sent.is_err() {
                    debug!("Client writer gone after {} bytes", bytes_sent);
                    return bytes_sent;
                }
                bytes_sent += chunk.len() as u64;
            }
        }

        if Instant::now() >= next_progress {
            next_progress = Instant::now() + progress_interval;
            let progress = ControlMessage::DownloadProgress {
                bytes_sent,
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            if let Some(frame) = control_frame(&progress) {
                if outbound.send(frame).await.is_err() {
                    return bytes_sent;
                }
            }
        }
    }

    let complete = ControlMessage::DownloadComplete {
        bytes_sent,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    if let Some(frame) = control_frame(&complete) {
        let _ = outbound.send(frame).await;
    }
    info!("Download stream done: {} bytes", bytes_sent);
    bytes_sent
}

/// How long past its requested duration an upload may run before the
/// server ends it without a `stop`
pub const UPLOAD_GRACE: Duration = Duration::from_millis(1000);

/// Byte counter for an upload stream
#[derive(Debug)]
pub struct UploadTally {
    start: Instant,
    deadline: Instant,
    bytes_received: u64,
    progress_interval: Duration,
    next_progress: Instant,
}

impl UploadTally {
    pub fn new(duration: Duration, progress_interval: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            deadline: start + duration + UPLOAD_GRACE,
            bytes_received: 0,
            progress_interval,
            next_progress: start + progress_interval,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// When the server stops waiting for the client's `stop`
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Count a received chunk; returns `upload-progress` once per interval
    pub fn record(&mut self, len: usize) -> Option<ControlMessage> {
        self.bytes_received += len as u64;
        let now = Instant::now();
        if now < self.next_progress {
            return None;
        }
        self.next_progress = now + self.progress_interval;
        Some(ControlMessage::UploadProgress {
            bytes_received: self.bytes_received,
            elapsed_ms: self.elapsed_ms(),
        })
    }

    /// Final `upload-complete` message
    pub fn complete(&self) -> ControlMessage {
        ControlMessage::UploadComplete {
            bytes_received: self.bytes_received,
            elapsed_ms: self.elapsed_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn parse(message: Message) -> Option<ControlMessage> {
        match message {
            Message::Text(text) => ControlMessage::parse(&text).ok(),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_tally_reports_each_interval() {
        let mut tally = UploadTally::new(Duration::from_secs(5), Duration::from_millis(100));

        assert_eq!(tally.record(1000), None);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(tally.record(1000), None);
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            tally.record(1000),
            Some(ControlMessage::UploadProgress {
                bytes_received: 3000,
                elapsed_ms: 110..=111
            })
        ));
        // Next report waits a full interval
        sleep(Duration::from_millis(50)).await;
        assert_eq!(tally.record(500), None);
        assert_eq!(tally.bytes_received(), 3500);

        assert!(matches!(
            tally.complete(),
            ControlMessage::UploadComplete {
                bytes_received: 3500,
                elapsed_ms: 160..=161
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_tally_deadline_allows_grace() {
        let before = Instant::now();
        let tally = UploadTally::new(Duration::from_millis(200), Duration::from_millis(100));
        assert_eq!(tally.deadline() - before, Duration::from_millis(200) + UPLOAD_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_honours_duration() {
        let (tx, mut rx) = mpsc::channel(4);
        let chunk = Bytes::from(vec![0u8; 1024]);
        let handle = spawn_download(tx, chunk, Duration::from_millis(300), Duration::from_millis(100));

        let mut binary = 0u64;
        let mut complete = None;
        // Slow client: one frame every 10 ms
        while let Some(message) = rx.recv().await {
            match message {
                Message::Binary(data) => binary += data.len() as u64,
                other => {
                    if let Some(ControlMessage::DownloadComplete { bytes_sent, elapsed_ms }) = parse(other) {
                        complete = Some((bytes_sent, elapsed_ms));
                    }
                }
            }
            sleep(Duration::from_millis(10)).await;
        }

        let (bytes_sent, elapsed_ms) = complete.unwrap();
        assert_eq!(bytes_sent, binary);
        assert!((300..=320).contains(&elapsed_ms), "elapsed {}", elapsed_ms);
        // Throttled by the reader, not by the chunk supply
        assert!(binary <= 40 * 1024);
        assert_eq!(handle.stop().await, bytes_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_stops_on_request() {
        let (tx, mut rx) = mpsc::channel(4);
        let chunk = Bytes::from(vec![0u8; 1024]);
        let handle = spawn_download(tx, chunk, Duration::from_secs(30), Duration::from_millis(100));

        let reader = tokio::spawn(async move {
            let mut messages = Vec::new();
            while let Some(message) = rx.recv().await {
                messages.push(message);
                sleep(Duration::from_millis(5)).await;
            }
            messages
        });

        sleep(Duration::from_millis(200)).await;
        let sent = handle.stop().await;
        let messages = reader.await.unwrap();

        assert!(sent > 0);
        let last = messages.into_iter().last().and_then(parse);
        assert!(matches!(last, Some(ControlMessage::DownloadComplete { bytes_sent, .. }) if bytes_sent == sent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_emits_progress() {
        let (tx, mut rx) = mpsc::channel(4);
        let chunk = Bytes::from(vec![0u8; 1024]);
        let _handle = spawn_download(tx, chunk, Duration::from_millis(350), Duration::from_millis(100));

        let mut progress = 0;
        while let Some(message) = rx.recv().await {
            if let Some(ControlMessage::DownloadProgress { .. }) = parse(message) {
                progress += 1;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(progress, 3);
    }
}
