//! Message protocol definitions
//!
//! Every exchange between client and server is a single four-field
//! [`Envelope`], carried as one JSON text frame.

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, ConversationId};

/// Fixed message bodies used by the handshake, refusals and notices
pub mod body {
    pub const CONNECTION_START_ACK: &str = "Connection request received";
    pub const CONNECTION_FINAL_ACK: &str = "Connection accepted";
    pub const DISCONNECT_INTENT: &str = "Goodbye";
    pub const DISCONNECT_UNEXPECTED: &str = "Disconnected";
    pub const UNHANDLED_MSG: &str = "Not configured to process that message type";
    pub const INVALID_SOURCE_ID: &str = "Invalid source ID";
    pub const INVALID_CONVERSATION: &str = "Invalid conversation";
    pub const INVITE_TO_JOIN_CONVERSATION: &str = "Invitation to join conversation";
    pub const REQUEST_TO_JOIN_CONVERSATION: &str = "Request to join conversation";
    pub const UNNAMED: &str = "Unnamed";
}

/// Envelope type tag
///
/// Serialized as snake_case. Tags this build does not know decode to
/// [`MessageType::Unknown`] rather than rejecting the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Chat line for a conversation
    ChatMessage,
    /// Emote line for a conversation
    ChatEmote,
    /// Request a new conversation
    ConversationNew,
    /// Invite another client into a conversation
    ConversationInvite,
    /// Join a conversation, or announce a member joined
    ConversationJoin,
    /// Leave a conversation, or announce a member left
    ConversationLeave,
    /// Display name of a client or conversation
    NameUpdate,
    Acknowledge,
    /// Request refused, body carries the reason
    Refuse,
    /// Handshake step
    NetworkConnect,
    /// Client signing off
    NetworkDisconnect,
    Debug,
    /// Anything else
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ChatMessage => "chat_message",
            MessageType::ChatEmote => "chat_emote",
            MessageType::ConversationNew => "conversation_new",
            MessageType::ConversationInvite => "conversation_invite",
            MessageType::ConversationJoin => "conversation_join",
            MessageType::ConversationLeave => "conversation_leave",
            MessageType::NameUpdate => "name_update",
            MessageType::Acknowledge => "acknowledge",
            MessageType::Refuse => "refuse",
            MessageType::NetworkConnect => "network_connect",
            MessageType::NetworkDisconnect => "network_disconnect",
            MessageType::Debug => "debug",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only unit ever placed on the wire
///
/// Immutable once built: fields are private and exposed through accessors.
/// `client_id` names the subject of the message, which is not always the
/// sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    conversation_id: ConversationId,
    #[serde(default)]
    client_id: ClientId,
    #[serde(default)]
    body: String,
}

impl Envelope {
    pub fn new(
        kind: MessageType,
        conversation_id: ConversationId,
        client_id: ClientId,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            conversation_id,
            client_id,
            body: body.into(),
        }
    }

    /// Server-originated REFUSE addressed to `client_id`
    pub fn refuse(client_id: ClientId, reason: &str) -> Self {
        Self::new(MessageType::Refuse, ConversationId::NONE, client_id, reason)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Encode as a JSON frame payload
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from a JSON frame payload
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {},{} | {}",
            self.kind, self.conversation_id, self.client_id, self.body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_deserialize() {
        let json = r#"{"type": "chat_message", "conversation_id": 4, "client_id": 2, "body": "hi"}"#;
        let envelope = Envelope::from_json(json).unwrap();
        assert_eq!(envelope.kind(), MessageType::ChatMessage);
        assert_eq!(envelope.conversation_id(), ConversationId(4));
        assert_eq!(envelope.client_id(), ClientId(2));
        assert_eq!(envelope.body(), "hi");
    }

    #[test]
    fn test_envelope_serialize() {
        let envelope = Envelope::new(
            MessageType::NetworkConnect,
            ConversationId::NONE,
            ClientId(9),
            body::CONNECTION_START_ACK,
        );
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"type\":\"network_connect\""));
        assert!(json.contains("\"conversation_id\":0"));
        assert!(json.contains("\"client_id\":9"));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let json = r#"{"type": "typing_started", "conversation_id": 0, "client_id": 1}"#;
        let envelope = Envelope::from_json(json).unwrap();
        assert_eq!(envelope.kind(), MessageType::Unknown);
        assert_eq!(envelope.body(), "");
    }

    #[test]
    fn test_missing_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"client_id": 1}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn test_display_matches_wire_names() {
        let envelope = Envelope::refuse(ClientId(3), body::INVALID_CONVERSATION);
        assert_eq!(envelope.to_string(), "refuse: 0,3 | Invalid conversation");
    }
}
