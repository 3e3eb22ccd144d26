//! Error types for the relay
//!
//! Uses thiserror for ergonomic error definitions. Protocol violations by a
//! client never surface here: the dispatcher answers them with a REFUSE
//! envelope and carries on.

use thiserror::Error;

use crate::message::MessageType;
use crate::types::{ClientId, ConversationId};

/// Relay-level errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed or answered with the wrong type during the handshake
    #[error("Handshake failed: expected network_connect, got {0}")]
    HandshakeFailed(String),

    /// Peer did not answer the handshake in time
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Connection already carries a client id
    #[error("Connection already bound to client {0}")]
    AlreadyBound(ClientId),

    /// Client id already present in the registry
    #[error("Duplicate client id: {0}")]
    DuplicateClient(ClientId),

    /// Conversation id already present in the registry
    #[error("Duplicate conversation id: {0}")]
    DuplicateConversation(ConversationId),

    /// Every id up to `i32::MAX` has been handed out
    #[error("Id space exhausted")]
    IdsExhausted,

    /// Listen port argument could not be parsed
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Operation attempted on a closed connection
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RelayError {
    /// Build a handshake failure from whatever arrived instead of the ACK
    pub fn unexpected_reply(kind: Option<MessageType>) -> Self {
        match kind {
            Some(kind) => RelayError::HandshakeFailed(kind.to_string()),
            None => RelayError::HandshakeFailed("end of stream".to_string()),
        }
    }
}
