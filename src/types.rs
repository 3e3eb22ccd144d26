//! Basic type definitions for the relay
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: server-assigned client identifier
//! - `ConversationId`: server-assigned conversation identifier
//! - `IdGenerator`: the single counter both are drawn from

use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::RelayError;

/// Unique client identifier (newtype pattern)
///
/// Zero is reserved for the server itself and never handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i32);

impl ClientId {
    /// The server's own identity on the wire
    pub const SERVER: ClientId = ClientId(0);

    /// Check whether this is the reserved server identity
    pub fn is_server(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique conversation identifier (newtype pattern)
///
/// Zero means "not applicable" and marks server-directed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i32);

impl ConversationId {
    /// No conversation
    pub const NONE: ConversationId = ConversationId(0);

    /// Check whether this id refers to no conversation
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source shared by clients and conversations
///
/// Starts at 1 and never hands out the same value twice within one server
/// run, so a client and a conversation never share an id either. Once
/// `i32::MAX` has been issued every further draw fails instead of wrapping.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    #[cfg(test)]
    fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first),
        }
    }

    fn next_raw(&self) -> Result<i32, RelayError> {
        // i32::MIN marks the space as used up; i32::MAX itself is still issued
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == i32::MIN {
                    None
                } else {
                    Some(n.checked_add(1).unwrap_or(i32::MIN))
                }
            })
            .map_err(|_| {
                error!("Id space exhausted; refusing to reuse ids");
                RelayError::IdsExhausted
            })
    }

    /// Draw a fresh client id
    pub fn next_client_id(&self) -> Result<ClientId, RelayError> {
        self.next_raw().map(ClientId)
    }

    /// Draw a fresh conversation id
    pub fn next_conversation_id(&self) -> Result<ConversationId, RelayError> {
        self.next_raw().map(ConversationId)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
