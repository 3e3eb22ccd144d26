//! ChatServer context and message dispatcher
//!
//! `ChatServer` owns both registries, the id generator and the config. One
//! instance is shared by every connection task; independent instances do not
//! see each other, which keeps tests deterministic.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::client::{ClientRecord, ClientRegistry};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::conversation::{Conversation, ConversationRegistry};
use crate::error::RelayError;
use crate::handler::handle_connection;
use crate::message::{body, Envelope, MessageType};
use crate::types::{ClientId, ConversationId, IdGenerator};

/// The relay's shared state
#[derive(Debug)]
pub struct ChatServer {
    config: ServerConfig,
    ids: IdGenerator,
    clients: ClientRegistry,
    conversations: ConversationRegistry,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            ids: IdGenerator::new(),
            clients: ClientRegistry::new(),
            conversations: ConversationRegistry::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn conversations(&self) -> &ConversationRegistry {
        &self.conversations
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop
    ///
    /// Each inbound socket gets its own task for the handshake and the
    /// receive loop that follows, so a slow handshake never stalls others.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Now listening for connections at {}", addr),
            Err(e) => warn!("Listening on unknown address: {}", e),
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, server).await {
                            warn!("Connection from {} abandoned: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Register a client that completed the handshake
    pub fn add_client(
        &self,
        id: ClientId,
        connection: Arc<Connection>,
        nickname: &str,
    ) -> Result<Arc<ClientRecord>, RelayError> {
        let nickname = if nickname.trim().is_empty() {
            self.config.default_nickname.as_str()
        } else {
            nickname
        };
        self.clients
            .insert(ClientRecord::new(id, connection, nickname))
    }

    /// Remove a client, close its connection and pull it out of every
    /// conversation it belongs to
    ///
    /// Safe to call more than once.
    pub async fn remove_client(&self, id: ClientId, reason: &str) {
        let Some(record) = self.clients.remove(id) else {
            return;
        };
        info!("DC - client {} ({})", id, record.nickname());

        for conversation in self.conversations.snapshot() {
            conversation.remove_member_with(id, reason).await;
        }

        debug!(
            "Total clients: {}, Total conversations: {}",
            self.clients.len(),
            self.conversations.len()
        );
    }

    /// NAME_UPDATE for a client (conversation id 0) or a conversation
    ///
    /// Unknown entities are reported as "Unnamed".
    pub fn name_update(&self, conversation_id: ConversationId, client_id: ClientId) -> Envelope {
        let name = if conversation_id.is_none() {
            self.clients.get(client_id).map(|client| client.nickname().to_string())
        } else {
            self.conversations
                .get(conversation_id)
                .map(|conversation| conversation.name().to_string())
        };
        Envelope::new(
            MessageType::NameUpdate,
            conversation_id,
            client_id,
            name.unwrap_or_else(|| body::UNNAMED.to_string()),
        )
    }

    /// Route one received envelope
    pub async fn dispatch(&self, connection: &Connection, envelope: Envelope) {
        match envelope.kind() {
            MessageType::ChatMessage | MessageType::ChatEmote => {
                self.handle_chat(connection, envelope).await;
            }
            MessageType::ConversationNew => {
                self.handle_conversation_new(connection, envelope).await;
            }
            MessageType::ConversationInvite => {
                self.handle_conversation_invite(connection, envelope).await;
            }
            MessageType::ConversationJoin => {
                self.handle_conversation_join(connection, envelope).await;
            }
            MessageType::ConversationLeave => {
                self.handle_conversation_leave(connection, envelope).await;
            }
            MessageType::NameUpdate | MessageType::Acknowledge | MessageType::Refuse => {
                debug!("Received {} from client {}", envelope, connection.client_id());
            }
            MessageType::NetworkDisconnect => {
                self.handle_network_disconnect(connection, envelope).await;
            }
            MessageType::Debug => {
                warn!("DEBUG from client {}: {}", connection.client_id(), envelope);
            }
            MessageType::NetworkConnect | MessageType::Unknown => {
                self.reply_unhandled(connection, &envelope).await;
            }
        }
    }

    /// CHAT_MESSAGE / CHAT_EMOTE: relay unchanged to every member
    async fn handle_chat(&self, connection: &Connection, envelope: Envelope) {
        if self.validate_client(connection, &envelope).await.is_none() {
            return;
        }
        let Some(conversation) = self.validate_conversation(connection, &envelope).await else {
            return;
        };
        conversation.broadcast(&envelope).await;
    }

    /// CONVERSATION_NEW: create, describe, then add the requester
    async fn handle_conversation_new(&self, connection: &Connection, envelope: Envelope) {
        let Some(client) = self.validate_client(connection, &envelope).await else {
            return;
        };

        let id = match self.ids.next_conversation_id() {
            Ok(id) => id,
            Err(e) => {
                error!("Could not create conversation for client {}: {}", client.id(), e);
                return;
            }
        };
        let name = if envelope.body().trim().is_empty() {
            self.config.default_conversation_name.clone()
        } else {
            envelope.body().to_string()
        };

        let conversation = match self.conversations.create(id, name) {
            Ok(conversation) => conversation,
            Err(e) => {
                error!("Could not create conversation for client {}: {}", client.id(), e);
                return;
            }
        };
        info!(
            "Client {} created conversation {} '{}'",
            client.id(),
            id,
            conversation.name()
        );

        connection
            .send(&conversation.name_update(ClientId::SERVER))
            .await;

        if !conversation.add_member(client).await {
            self.conversations.remove(id).await;
        }
    }

    /// CONVERSATION_INVITE: forward to the target named by `client_id`
    ///
    /// The inviter is the connection's bound client. An unknown target gets
    /// no reply.
    async fn handle_conversation_invite(&self, connection: &Connection, envelope: Envelope) {
        let source = connection.client_id();
        let Some(inviter) = self.clients.get(source) else {
            connection
                .send(&Envelope::refuse(source, body::INVALID_SOURCE_ID))
                .await;
            return;
        };
        let Some(conversation) = self.validate_conversation(connection, &envelope).await else {
            return;
        };

        let Some(target) = self.clients.get(envelope.client_id()) else {
            debug!(
                "Client {} invited unknown client {} to conversation {}",
                inviter.id(),
                envelope.client_id(),
                conversation.id()
            );
            return;
        };

        let invitation = Envelope::new(
            MessageType::ConversationInvite,
            conversation.id(),
            inviter.id(),
            conversation.name(),
        );
        let target_connection = target.connection();
        target_connection
            .send(&self.name_update(ConversationId::NONE, inviter.id()))
            .await;
        target_connection.send(&invitation).await;
        info!(
            "Client {} invited client {} to conversation {}",
            inviter.id(),
            target.id(),
            conversation.id()
        );
    }

    /// CONVERSATION_JOIN: describe the conversation and its members, then add
    async fn handle_conversation_join(&self, connection: &Connection, envelope: Envelope) {
        let Some(client) = self.validate_client(connection, &envelope).await else {
            return;
        };
        let Some(conversation) = self.validate_conversation(connection, &envelope).await else {
            return;
        };

        connection.send(&conversation.name_update(client.id())).await;
        for member in conversation.members().await {
            let update = Envelope::new(
                MessageType::NameUpdate,
                ConversationId::NONE,
                member.id(),
                member.nickname(),
            );
            connection.send(&update).await;
        }

        if conversation.add_member(Arc::clone(&client)).await {
            info!("Client {} joined conversation {}", client.id(), conversation.id());
        } else if !conversation.contains(client.id()).await {
            // Torn down between lookup and join
            connection
                .send(&Envelope::refuse(client.id(), body::INVALID_CONVERSATION))
                .await;
        }
    }

    /// CONVERSATION_LEAVE
    async fn handle_conversation_leave(&self, connection: &Connection, envelope: Envelope) {
        let Some(client) = self.validate_client(connection, &envelope).await else {
            return;
        };
        let Some(conversation) = self.validate_conversation(connection, &envelope).await else {
            return;
        };

        if conversation.remove_member(client.id()).await {
            info!("Client {} left conversation {}", client.id(), conversation.id());
        }
    }

    /// NETWORK_DISCONNECT
    async fn handle_network_disconnect(&self, connection: &Connection, envelope: Envelope) {
        let Some(client) = self.validate_client(connection, &envelope).await else {
            return;
        };
        self.remove_client(client.id(), body::DISCONNECT_INTENT).await;
    }

    async fn reply_unhandled(&self, connection: &Connection, envelope: &Envelope) {
        warn!("Could not handle message: {}", envelope);
        connection
            .send(&Envelope::refuse(connection.client_id(), body::UNHANDLED_MSG))
            .await;
    }

    /// Check that the envelope speaks for the connection it arrived on
    ///
    /// Sends REFUSE/INVALID_SOURCE_ID and returns `None` otherwise.
    async fn validate_client(
        &self,
        connection: &Connection,
        envelope: &Envelope,
    ) -> Option<Arc<ClientRecord>> {
        let source = connection.client_id();
        let record = if source == envelope.client_id() {
            self.clients.get(source)
        } else {
            None
        };

        if record.is_none() {
            warn!(
                "Client {} sent {} with mismatched source id {}",
                source,
                envelope.kind(),
                envelope.client_id()
            );
            connection
                .send(&Envelope::refuse(source, body::INVALID_SOURCE_ID))
                .await;
        }
        record
    }

    /// Resolve the envelope's conversation
    ///
    /// Sends REFUSE/INVALID_CONVERSATION and returns `None` if it is unknown.
    async fn validate_conversation(
        &self,
        connection: &Connection,
        envelope: &Envelope,
    ) -> Option<Arc<Conversation>> {
        let conversation = self.conversations.get(envelope.conversation_id());
        if conversation.is_none() {
            debug!(
                "Client {} referenced unknown conversation {}",
                connection.client_id(),
                envelope.conversation_id()
            );
            connection
                .send(&Envelope::refuse(connection.client_id(), body::INVALID_CONVERSATION))
                .await;
        }
        conversation
    }
}
