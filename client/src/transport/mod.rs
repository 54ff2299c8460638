//! Transport adapter
//!
//! A [`Transport`] is one bidirectional, message-framed connection. It is the
//! only I/O primitive a measurement session uses. Reconnection is left to the
//! caller: a lost connection surfaces as [`Inbound::Closed`] and nothing here
//! retries.

mod memory;
mod websocket;

pub use memory::{MemoryTransport, memory_pair};
pub use websocket::WsTransport;

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{ControlMessage, ProtocolError};
use thiserror::Error;

/// One message with its frame boundary preserved
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON control message
    Text(String),
    /// Raw chunk payload
    Binary(Bytes),
}

impl Frame {
    /// Encode a control message as a text frame
    pub fn control(message: &ControlMessage) -> Result<Self, ProtocolError> {
        Ok(Self::Text(message.to_json()?))
    }

    /// Size of the payload in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a connection stopped delivering messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side
    Local,
    /// The peer closed the connection cleanly
    Remote,
    /// The connection broke
    Lost(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::Lost(reason) => write!(f, "connection lost: {}", reason),
        }
    }
}

/// Result of waiting for the next inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Connection {0}")]
    Closed(CloseReason),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Failed to encode control message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Message-capable connection used by a measurement session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for transmission
    ///
    /// Returns once the frame is queued. Waits only while the outbound queue
    /// is full, which is how bulk senders get backpressure.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound message in arrival order
    ///
    /// After the connection ends every call returns [`Inbound::Closed`].
    async fn recv(&mut self) -> Inbound;

    /// Terminate the connection
    fn close(&self);

    /// Binary payload bytes that have left this side of the connection
    ///
    /// Frames still waiting in the outbound queue are not counted.
    fn flushed_bytes(&self) -> u64;

    /// Encode and queue a control message
    async fn send_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        self.send(Frame::control(message)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_is_text() {
        let frame = Frame::control(&ControlMessage::Stop).unwrap();
        assert_eq!(frame, Frame::Text(r#"{"type":"stop"}"#.to_string()));
        assert_eq!(frame.len(), 15);
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Remote.to_string(), "closed by peer");
        assert_eq!(
            TransportError::Closed(CloseReason::Lost("reset".into())).to_string(),
            "Connection connection lost: reset"
        );
    }
}
