//! Netgauge control messages
//!
//! Every control message is a JSON object tagged by `type`, with camelCase
//! fields. The set of tags is closed: anything else is rejected with
//! [`ProtocolError::UnknownType`] instead of being ignored.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Control messages exchanged over text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Latency probe (client -> server)
    Ping {
        /// Sequence number, monotonically increasing per prober
        seq: u64,
        /// Client send time in milliseconds on the client's session clock
        send_time: f64,
    },

    /// Latency response (server -> client), fields echoed from the ping
    Pong { seq: u64, send_time: f64 },

    /// Begin streaming binary chunks (client -> server)
    StartDownload { chunk_size: u64, duration_ms: u64 },

    /// Periodic download status (server -> client), informational only
    DownloadProgress { bytes_sent: u64, elapsed_ms: u64 },

    /// Download stream finished (server -> client)
    DownloadComplete { bytes_sent: u64, elapsed_ms: u64 },

    /// Announce an upload stream (client -> server)
    StartUpload { duration_ms: u64 },

    /// Periodic server-side upload confirmation (server -> client)
    UploadProgress { bytes_received: u64, elapsed_ms: u64 },

    /// Upload stream finished (server -> client)
    UploadComplete { bytes_received: u64, elapsed_ms: u64 },

    /// End whichever stream is active (client -> server)
    Stop,

    /// Phase-level failure notice (server -> client)
    Error { message: String, code: u16 },
}

impl ControlMessage {
    /// Wire tags accepted by [`ControlMessage::parse`]
    pub const KNOWN_TYPES: [&'static str; 10] = [
        "ping",
        "pong",
        "start-download",
        "download-progress",
        "download-complete",
        "start-upload",
        "upload-progress",
        "upload-complete",
        "stop",
        "error",
    ];

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::StartDownload { .. } => "start-download",
            Self::DownloadProgress { .. } => "download-progress",
            Self::DownloadComplete { .. } => "download-complete",
            Self::StartUpload { .. } => "start-upload",
            Self::UploadProgress { .. } => "upload-progress",
            Self::UploadComplete { .. } => "upload-complete",
            Self::Stop => "stop",
            Self::Error { .. } => "error",
        }
    }

    /// Parse a text frame into a control message
    ///
    /// Distinguishes an unrecognized tag from a recognized tag with bad fields.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match value.get("type").and_then(serde_json::Value::as_str) {
            None => return Err(ProtocolError::MissingType),
            Some(tag) if !Self::KNOWN_TYPES.contains(&tag) => {
                return Err(ProtocolError::UnknownType(tag.to_string()));
            }
            Some(_) => {}
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to the JSON text carried in a text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Build an `error` message
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
        }
    }
}
