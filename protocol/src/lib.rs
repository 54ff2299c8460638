//! Netgauge Protocol Library
//!
//! Shared protocol definitions for netgauge client-server communication.
//! Control messages travel as JSON in WebSocket text frames; chunk payloads
//! travel as raw binary frames with no header.

pub mod constants;
pub mod error;
pub mod messages;
pub mod payload;

pub use constants::*;
pub use error::ProtocolError;
pub use messages::ControlMessage;
