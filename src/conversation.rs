//! Conversations and the conversation registry
//!
//! A conversation is a named member set. Membership changes and broadcasts
//! on one conversation are serialized by its own lock; different
//! conversations never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::ClientRecord;
use crate::error::RelayError;
use crate::message::{body, Envelope, MessageType};
use crate::types::{ClientId, ConversationId};

type ConversationMap = DashMap<ConversationId, Arc<Conversation>>;

#[derive(Default)]
struct Membership {
    members: HashMap<ClientId, Arc<ClientRecord>>,
    /// Set once the conversation has left the registry; no member may be
    /// added afterwards.
    torn_down: bool,
}

/// Named group of clients that receive each other's broadcasts
pub struct Conversation {
    id: ConversationId,
    name: String,
    membership: Mutex<Membership>,
    registry: Weak<ConversationMap>,
}

impl Conversation {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// NAME_UPDATE describing this conversation, addressed to `client_id`
    pub fn name_update(&self, client_id: ClientId) -> Envelope {
        Envelope::new(MessageType::NameUpdate, self.id, client_id, self.name())
    }

    /// Add a member and announce it to everyone, newcomer included
    ///
    /// Returns false if the client was already a member or the conversation
    /// has been torn down.
    pub async fn add_member(&self, client: Arc<ClientRecord>) -> bool {
        let mut membership = self.membership.lock().await;
        if membership.torn_down {
            debug!("Refusing join of {} to removed conversation {}", client.id(), self.id);
            return false;
        }
        if membership.members.contains_key(&client.id()) {
            return false;
        }

        let announcement = Envelope::new(
            MessageType::ConversationJoin,
            self.id,
            client.id(),
            client.nickname(),
        );
        membership.members.insert(client.id(), client);
        self.deliver(&mut membership, &announcement).await;
        true
    }

    /// Voluntary leave
    pub async fn remove_member(&self, client_id: ClientId) -> bool {
        self.remove_member_with(client_id, body::DISCONNECT_INTENT).await
    }

    /// Remove a member, telling the rest why
    ///
    /// The last member leaving tears the conversation down instead of
    /// announcing. Returns false if the client was not a member.
    pub async fn remove_member_with(&self, client_id: ClientId, reason: &str) -> bool {
        let mut membership = self.membership.lock().await;
        if membership.members.remove(&client_id).is_none() {
            return false;
        }

        if membership.members.is_empty() {
            self.tear_down(&mut membership);
        } else {
            let notice = Envelope::new(MessageType::ConversationLeave, self.id, client_id, reason);
            self.deliver(&mut membership, &notice).await;
        }
        true
    }

    /// Send an envelope to every current member
    ///
    /// The envelope must carry this conversation's id; anything else is a
    /// caller bug and is rejected.
    pub async fn broadcast(&self, envelope: &Envelope) -> bool {
        if envelope.conversation_id() != self.id {
            error!(
                "Attempted to broadcast {} to conversation {} using the wrong conversation id",
                envelope, self.id
            );
            return false;
        }

        let mut membership = self.membership.lock().await;
        self.deliver(&mut membership, envelope).await;
        true
    }

    pub async fn contains(&self, client_id: ClientId) -> bool {
        self.membership.lock().await.members.contains_key(&client_id)
    }

    pub async fn member_count(&self) -> usize {
        self.membership.lock().await.members.len()
    }

    /// Snapshot of the current members, ordered by id
    pub async fn members(&self) -> Vec<Arc<ClientRecord>> {
        let membership = self.membership.lock().await;
        let mut members: Vec<_> = membership.members.values().cloned().collect();
        members.sort_by_key(|member| member.id());
        members
    }

    /// Sends to every member, then drops the ones whose connection failed.
    ///
    /// Cleanup happens after the iteration; each dropped member is announced
    /// to whoever is left, which can uncover further dead members.
    async fn deliver(&self, membership: &mut Membership, envelope: &Envelope) {
        let mut dead = Vec::new();
        for (id, member) in &membership.members {
            if !member.connection().send(envelope).await {
                dead.push(*id);
            }
        }

        let mut removed_any = false;
        while let Some(id) = dead.pop() {
            if membership.members.remove(&id).is_none() {
                continue;
            }
            removed_any = true;
            info!("Dropped disconnected client {} from conversation {}", id, self.id);

            let notice = Envelope::new(
                MessageType::ConversationLeave,
                self.id,
                id,
                body::DISCONNECT_UNEXPECTED,
            );
            for (other, member) in &membership.members {
                if !member.connection().send(&notice).await && !dead.contains(other) {
                    dead.push(*other);
                }
            }
        }

        if removed_any && membership.members.is_empty() {
            self.tear_down(membership);
        }
    }

    fn tear_down(&self, membership: &mut Membership) {
        membership.torn_down = true;
        if let Some(conversations) = self.registry.upgrade() {
            conversations.remove(&self.id);
        }
        info!("Conversation {} removed (empty)", self.id);
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registry of live conversations, keyed by id
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: Arc<ConversationMap>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an empty conversation
    ///
    /// The caller is expected to add the first member right away.
    pub fn create(
        &self,
        id: ConversationId,
        name: impl Into<String>,
    ) -> Result<Arc<Conversation>, RelayError> {
        match self.conversations.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Attempted to add a non-unique conversation id {} to the registry", id);
                Err(RelayError::DuplicateConversation(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let conversation = Arc::new(Conversation {
                    id,
                    name: name.into(),
                    membership: Mutex::new(Membership::default()),
                    registry: Arc::downgrade(&self.conversations),
                });
                slot.insert(Arc::clone(&conversation));
                Ok(conversation)
            }
        }
    }

    pub fn get(&self, id: ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a conversation regardless of its members
    ///
    /// Anyone still holding it can no longer add members.
    pub async fn remove(&self, id: ConversationId) -> Option<Arc<Conversation>> {
        let conversation = self.get(id)?;
        let mut membership = conversation.membership.lock().await;
        membership.torn_down = true;
        let removed = self.conversations.remove(&id).map(|(_, c)| c);
        drop(membership);
        removed
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.conversations.contains_key(&id)
    }

    /// Snapshot of every live conversation
    pub fn snapshot(&self) -> Vec<Arc<Conversation>> {
        self.conversations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::pair;
    use crate::connection::Connection;

    struct Member {
        record: Arc<ClientRecord>,
        remote: Connection,
    }

    async fn member(id: i32, nickname: &str) -> Member {
        let (server, remote) = pair().await;
        Member {
            record: Arc::new(ClientRecord::new(ClientId(id), Arc::new(server), nickname)),
            remote,
        }
    }

    #[tokio::test]
    async fn test_add_member_announces_to_everyone() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        let bob = member(2, "Bob").await;

        assert!(lobby.add_member(Arc::clone(&alice.record)).await);
        let own = alice.remote.receive().await.unwrap();
        assert_eq!(own.kind(), MessageType::ConversationJoin);
        assert_eq!(own.client_id(), ClientId(1));
        assert_eq!(own.body(), "Alice");

        assert!(lobby.add_member(Arc::clone(&bob.record)).await);
        for remote in [&alice.remote, &bob.remote] {
            let joined = remote.receive().await.unwrap();
            assert_eq!(joined.kind(), MessageType::ConversationJoin);
            assert_eq!(joined.conversation_id(), ConversationId(10));
            assert_eq!(joined.client_id(), ClientId(2));
        }
        assert_eq!(lobby.member_count().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_member_rejected() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;

        assert!(lobby.add_member(Arc::clone(&alice.record)).await);
        assert!(!lobby.add_member(Arc::clone(&alice.record)).await);
        assert_eq!(lobby.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_member_notifies_remaining() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        let bob = member(2, "Bob").await;
        lobby.add_member(Arc::clone(&alice.record)).await;
        lobby.add_member(Arc::clone(&bob.record)).await;
        // Drain join announcements: alice saw two, bob one
        alice.remote.receive().await.unwrap();
        alice.remote.receive().await.unwrap();
        bob.remote.receive().await.unwrap();

        assert!(lobby.remove_member(ClientId(2)).await);
        let notice = alice.remote.receive().await.unwrap();
        assert_eq!(notice.kind(), MessageType::ConversationLeave);
        assert_eq!(notice.client_id(), ClientId(2));
        assert!(registry.contains(ConversationId(10)));

        // Already gone
        assert!(!lobby.remove_member(ClientId(2)).await);
    }

    #[tokio::test]
    async fn test_last_member_tears_down() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        lobby.add_member(Arc::clone(&alice.record)).await;

        assert!(lobby.remove_member(ClientId(1)).await);
        assert!(!registry.contains(ConversationId(10)));
        assert!(registry.is_empty());

        // A removed conversation cannot be revived
        assert!(!lobby.add_member(Arc::clone(&alice.record)).await);
    }

    #[tokio::test]
    async fn test_broadcast_rejects_foreign_id() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let stray = Envelope::new(MessageType::ChatMessage, ConversationId(11), ClientId(1), "hi");
        assert!(!lobby.broadcast(&stray).await);
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_members() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        let bob = member(2, "Bob").await;
        lobby.add_member(Arc::clone(&alice.record)).await;
        lobby.add_member(Arc::clone(&bob.record)).await;
        alice.remote.receive().await.unwrap();
        alice.remote.receive().await.unwrap();

        bob.record.connection().close();

        let chat = Envelope::new(MessageType::ChatMessage, ConversationId(10), ClientId(1), "hello");
        assert!(lobby.broadcast(&chat).await);

        assert_eq!(alice.remote.receive().await.unwrap(), chat);
        let notice = alice.remote.receive().await.unwrap();
        assert_eq!(notice.kind(), MessageType::ConversationLeave);
        assert_eq!(notice.client_id(), ClientId(2));
        assert_eq!(notice.body(), body::DISCONNECT_UNEXPECTED);
        assert!(!lobby.contains(ClientId(2)).await);
        assert!(registry.contains(ConversationId(10)));
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_hold_broadcast() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        // Bob's remote end never reads
        let (bob_side, _bob_remote) = pair().await;
        let bob_side = bob_side.with_send_timeout(Some(std::time::Duration::from_millis(100)));
        let bob = Arc::new(ClientRecord::new(ClientId(2), Arc::new(bob_side), "Bob"));

        lobby.add_member(Arc::clone(&alice.record)).await;
        lobby.add_member(Arc::clone(&bob)).await;
        alice.remote.receive().await.unwrap();
        alice.remote.receive().await.unwrap();

        let reader = tokio::spawn(async move {
            let chat = alice.remote.receive().await;
            let notice = alice.remote.receive().await;
            (chat, notice)
        });

        let bulky = Envelope::new(
            MessageType::ChatMessage,
            ConversationId(10),
            ClientId(1),
            "x".repeat(200 * 1024),
        );
        tokio::time::timeout(std::time::Duration::from_secs(5), lobby.broadcast(&bulky))
            .await
            .unwrap();

        let (chat, notice) = reader.await.unwrap();
        assert_eq!(chat.unwrap(), bulky);
        let notice = notice.unwrap();
        assert_eq!(notice.kind(), MessageType::ConversationLeave);
        assert_eq!(notice.client_id(), ClientId(2));
        assert_eq!(notice.body(), body::DISCONNECT_UNEXPECTED);
        assert!(bob.connection().is_closed());
        assert_eq!(lobby.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_all_dead_tears_down() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(10), "Lobby").unwrap();
        let alice = member(1, "Alice").await;
        lobby.add_member(Arc::clone(&alice.record)).await;

        alice.record.connection().close();
        let chat = Envelope::new(MessageType::ChatMessage, ConversationId(10), ClientId(1), "anyone?");
        assert!(lobby.broadcast(&chat).await);

        assert_eq!(lobby.member_count().await, 0);
        assert!(!registry.contains(ConversationId(10)));
    }

    #[tokio::test]
    async fn test_duplicate_conversation_rejected() {
        let registry = ConversationRegistry::new();
        registry.create(ConversationId(3), "One").unwrap();
        let err = registry.create(ConversationId(3), "Two").unwrap_err();
        assert!(matches!(err, RelayError::DuplicateConversation(ConversationId(3))));
        assert_eq!(registry.get(ConversationId(3)).unwrap().name(), "One");
    }

    #[tokio::test]
    async fn test_registry_remove_blocks_joins() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(3), "Lobby").unwrap();
        let alice = member(1, "Alice").await;

        assert!(registry.remove(ConversationId(3)).await.is_some());
        assert!(registry.remove(ConversationId(3)).await.is_none());
        assert!(!lobby.add_member(alice.record).await);
    }

    #[tokio::test]
    async fn test_name_update() {
        let registry = ConversationRegistry::new();
        let lobby = registry.create(ConversationId(3), "Den").unwrap();

        let update = lobby.name_update(ClientId(7));
        assert_eq!(update.kind(), MessageType::NameUpdate);
        assert_eq!(update.conversation_id(), ConversationId(3));
        assert_eq!(update.client_id(), ClientId(7));
        assert_eq!(update.body(), "Den");
    }
}
