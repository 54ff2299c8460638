//! Protocol error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Control message is missing a \"type\" tag")]
    MissingType,

    #[error("Unknown control message type: {0}")]
    UnknownType(String),

    #[error("Malformed control message: {0}")]
    Malformed(String),

    #[error("Unexpected {received} message while {context}")]
    Unexpected {
        received: &'static str,
        context: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}
