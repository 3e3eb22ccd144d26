//! Client side of the relay
//!
//! Front ends talk to the server through a [`RelayClient`]: it performs the
//! client half of the handshake, keeps a per-session map of display names,
//! and hands every incoming envelope to an [`EventHandler`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_NICKNAME, DEFAULT_SERVER_ADDRESS, DEFAULT_SERVER_PORT};
use crate::connection::Connection;
use crate::error::RelayError;
use crate::message::{body, Envelope, MessageType};
use crate::types::{ClientId, ConversationId};

/// What the session should do after a handler has seen an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing further
    Done,
    /// Answer the server with a REFUSE carrying this reason
    Refuse(String),
}

/// Per-type callbacks for incoming envelopes
///
/// Every typed method defaults to [`EventHandler::on_unhandled`], which by
/// default asks the server to be told the type is not handled.
#[allow(unused_variables)]
pub trait EventHandler: Send + 'static {
    fn on_chat_message(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_chat_emote(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_conversation_invite(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_conversation_join(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_conversation_leave(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_name_update(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_acknowledge(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    /// Refusals are never answered with another refusal
    fn on_refuse(&mut self, envelope: &Envelope) -> Reply {
        Reply::Done
    }

    fn on_network_connect(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_network_disconnect(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_debug(&mut self, envelope: &Envelope) -> Reply {
        self.on_unhandled(envelope)
    }

    fn on_unhandled(&mut self, envelope: &Envelope) -> Reply {
        Reply::Refuse(body::UNHANDLED_MSG.to_string())
    }

    /// The server stream ended
    fn on_server_disconnect(&mut self) {}
}

/// Display names learned during one session, keyed by raw id
type NameMap = DashMap<i32, String>;

/// A connected session with a relay server
pub struct RelayClient {
    client_id: ClientId,
    connection: Arc<Connection>,
    names: Arc<NameMap>,
    listener: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to `address:port` and register `nickname`
    ///
    /// `None`, a zero port or a blank nickname fall back to the defaults.
    pub async fn connect<H>(
        address: Option<&str>,
        port: u16,
        nickname: Option<&str>,
        handler: H,
    ) -> Result<Self, RelayError>
    where
        H: EventHandler,
    {
        let address = address.unwrap_or(DEFAULT_SERVER_ADDRESS);
        let port = if port == 0 { DEFAULT_SERVER_PORT } else { port };
        let nickname = nickname
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_NICKNAME);

        let url = format!("ws://{}:{}", address, port);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let connection = Arc::new(Connection::new(ws_stream, url));

        // Greeting carries our id
        let greeting = connection.receive().await;
        let client_id = match greeting {
            Some(greeting) if greeting.kind() == MessageType::NetworkConnect => greeting.client_id(),
            other => {
                connection.finish().await;
                return Err(RelayError::unexpected_reply(other.map(|e| e.kind())));
            }
        };
        connection.bind(client_id)?;

        let ack = Envelope::new(
            MessageType::NetworkConnect,
            ConversationId::NONE,
            client_id,
            nickname,
        );
        if !connection.send(&ack).await {
            return Err(RelayError::ConnectionClosed);
        }

        // Anything that beats the final ACK is replayed to the handler after it
        let mut early = Vec::new();
        loop {
            match connection.receive().await {
                Some(envelope) if envelope.kind() == MessageType::NetworkConnect => break,
                Some(envelope) => early.push(envelope),
                None => return Err(RelayError::unexpected_reply(None)),
            }
        }
        info!("Connected to {} as client {}", connection.peer(), client_id);

        let names = Arc::new(NameMap::new());
        names.insert(client_id.0, nickname.to_string());

        let listener = tokio::spawn(listen(
            Arc::clone(&connection),
            Arc::clone(&names),
            handler,
            early,
        ));

        Ok(Self {
            client_id,
            connection,
            names,
            listener,
        })
    }

    /// Id the server assigned to this session
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Toggle info-level TX/RX echo for this session
    pub fn set_print_messages(&self, enabled: bool) {
        self.connection.set_print_messages(enabled);
    }

    /// Name last reported for a client or conversation id
    pub fn display_name(&self, id: i32) -> String {
        self.names
            .get(&id)
            .map(|name| name.value().clone())
            .unwrap_or_else(|| body::UNNAMED.to_string())
    }

    /// Sign off gracefully and close the connection
    pub async fn disconnect(self) {
        self.send(
            MessageType::NetworkDisconnect,
            ConversationId::NONE,
            body::DISCONNECT_INTENT,
        )
        .await;
        self.connection.finish().await;
        let _ = self.listener.await;
    }

    pub async fn send_chat(&self, conversation_id: ConversationId, text: &str) -> bool {
        self.send(MessageType::ChatMessage, conversation_id, text).await
    }

    pub async fn send_emote(&self, conversation_id: ConversationId, text: &str) -> bool {
        self.send(MessageType::ChatEmote, conversation_id, text).await
    }

    pub async fn send_conversation_new(&self, requested_name: &str) -> bool {
        self.send(MessageType::ConversationNew, ConversationId::NONE, requested_name)
            .await
    }

    /// Invite `target`; the envelope's client id names the invitee
    pub async fn send_conversation_invite(
        &self,
        conversation_id: ConversationId,
        target: ClientId,
    ) -> bool {
        let invite = Envelope::new(
            MessageType::ConversationInvite,
            conversation_id,
            target,
            body::INVITE_TO_JOIN_CONVERSATION,
        );
        self.connection.send(&invite).await
    }

    pub async fn send_conversation_join(&self, conversation_id: ConversationId) -> bool {
        self.send(
            MessageType::ConversationJoin,
            conversation_id,
            body::REQUEST_TO_JOIN_CONVERSATION,
        )
        .await
    }

    pub async fn send_conversation_leave(&self, conversation_id: ConversationId) -> bool {
        self.send(
            MessageType::ConversationLeave,
            conversation_id,
            body::DISCONNECT_INTENT,
        )
        .await
    }

    pub async fn send_name_update(&self, conversation_id: ConversationId, name: &str) -> bool {
        self.send(MessageType::NameUpdate, conversation_id, name).await
    }

    pub async fn send_acknowledge(&self, conversation_id: ConversationId, text: &str) -> bool {
        self.send(MessageType::Acknowledge, conversation_id, text).await
    }

    pub async fn send_refuse(&self, conversation_id: ConversationId, reason: &str) -> bool {
        warn!("Refusing a message: {}", reason);
        self.send(MessageType::Refuse, conversation_id, reason).await
    }

    pub async fn send_debug(&self, conversation_id: ConversationId, text: &str) -> bool {
        self.send(MessageType::Debug, conversation_id, text).await
    }

    async fn send(&self, kind: MessageType, conversation_id: ConversationId, text: &str) -> bool {
        let envelope = Envelope::new(kind, conversation_id, self.client_id, text);
        self.connection.send(&envelope).await
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("client_id", &self.client_id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

async fn listen<H: EventHandler>(
    connection: Arc<Connection>,
    names: Arc<NameMap>,
    mut handler: H,
    early: Vec<Envelope>,
) {
    for envelope in early {
        route(&connection, &names, &mut handler, envelope).await;
    }
    while let Some(envelope) = connection.receive().await {
        route(&connection, &names, &mut handler, envelope).await;
    }
    debug!("Server stream ended for client {}", connection.client_id());
    handler.on_server_disconnect();
}

async fn route<H: EventHandler>(
    connection: &Connection,
    names: &NameMap,
    handler: &mut H,
    envelope: Envelope,
) {
    remember_names(names, &envelope);

    let reply = match envelope.kind() {
        MessageType::ChatMessage => handler.on_chat_message(&envelope),
        MessageType::ChatEmote => handler.on_chat_emote(&envelope),
        MessageType::ConversationInvite => handler.on_conversation_invite(&envelope),
        MessageType::ConversationJoin => handler.on_conversation_join(&envelope),
        MessageType::ConversationLeave => handler.on_conversation_leave(&envelope),
        MessageType::NameUpdate => handler.on_name_update(&envelope),
        MessageType::Acknowledge => handler.on_acknowledge(&envelope),
        MessageType::Refuse => handler.on_refuse(&envelope),
        MessageType::NetworkConnect => handler.on_network_connect(&envelope),
        MessageType::NetworkDisconnect => handler.on_network_disconnect(&envelope),
        MessageType::Debug => handler.on_debug(&envelope),
        MessageType::ConversationNew | MessageType::Unknown => handler.on_unhandled(&envelope),
    };

    if let Reply::Refuse(reason) = reply {
        let refusal = Envelope::new(
            MessageType::Refuse,
            envelope.conversation_id(),
            connection.client_id(),
            reason,
        );
        connection.send(&refusal).await;
    }
}

/// Keep the name map current from envelopes that carry names
fn remember_names(names: &NameMap, envelope: &Envelope) {
    let name = envelope.body().to_string();
    match envelope.kind() {
        MessageType::ConversationInvite => {
            names.insert(envelope.conversation_id().0, name);
        }
        MessageType::ConversationJoin | MessageType::NetworkConnect => {
            names.insert(envelope.client_id().0, name);
        }
        MessageType::NameUpdate => {
            if !envelope.conversation_id().is_none() {
                names.insert(envelope.conversation_id().0, name);
            } else if !envelope.client_id().is_server() {
                names.insert(envelope.client_id().0, name);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::pair;

    #[derive(Default)]
    struct Silent;

    impl EventHandler for Silent {}

    struct ChatOnly {
        seen: Vec<String>,
    }

    impl EventHandler for ChatOnly {
        fn on_chat_message(&mut self, envelope: &Envelope) -> Reply {
            self.seen.push(envelope.body().to_string());
            Reply::Done
        }
    }

    #[test]
    fn test_default_handler_refuses() {
        let mut handler = Silent;
        let envelope = Envelope::new(MessageType::ChatEmote, ConversationId(2), ClientId(1), "waves");
        assert_eq!(
            handler.on_chat_emote(&envelope),
            Reply::Refuse(body::UNHANDLED_MSG.to_string())
        );
        assert_eq!(handler.on_refuse(&envelope), Reply::Done);
    }

    #[test]
    fn test_remember_names() {
        let names = NameMap::new();
        remember_names(
            &names,
            &Envelope::new(MessageType::NameUpdate, ConversationId(5), ClientId(1), "Lobby"),
        );
        remember_names(
            &names,
            &Envelope::new(MessageType::NameUpdate, ConversationId::NONE, ClientId(3), "Carol"),
        );
        remember_names(
            &names,
            &Envelope::new(MessageType::ConversationJoin, ConversationId(5), ClientId(4), "Dan"),
        );
        remember_names(
            &names,
            &Envelope::new(MessageType::ChatMessage, ConversationId(5), ClientId(4), "hi"),
        );

        assert_eq!(names.get(&5).unwrap().value(), "Lobby");
        assert_eq!(names.get(&3).unwrap().value(), "Carol");
        assert_eq!(names.get(&4).unwrap().value(), "Dan");
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_route_sends_refusal_for_unhandled() {
        let (local, server) = pair().await;
        local.bind(ClientId(8)).unwrap();
        let names = NameMap::new();
        let mut handler = ChatOnly { seen: Vec::new() };

        let chat = Envelope::new(MessageType::ChatMessage, ConversationId(2), ClientId(1), "hello");
        route(&local, &names, &mut handler, chat).await;
        assert_eq!(handler.seen, vec!["hello".to_string()]);

        let emote = Envelope::new(MessageType::ChatEmote, ConversationId(2), ClientId(1), "waves");
        route(&local, &names, &mut handler, emote).await;

        let refusal = server.receive().await.unwrap();
        assert_eq!(refusal.kind(), MessageType::Refuse);
        assert_eq!(refusal.conversation_id(), ConversationId(2));
        assert_eq!(refusal.client_id(), ClientId(8));
        assert_eq!(refusal.body(), body::UNHANDLED_MSG);
    }
}
