//! Client records and the client registry
//!
//! A [`ClientRecord`] binds a server-assigned id to the connection it owns
//! and a display nickname. The [`ClientRegistry`] is safe to use from every
//! connection task at once.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::RelayError;
use crate::types::ClientId;

/// Connected client information
#[derive(Debug)]
pub struct ClientRecord {
    id: ClientId,
    connection: Arc<Connection>,
    nickname: String,
}

impl ClientRecord {
    pub fn new(id: ClientId, connection: Arc<Connection>, nickname: impl Into<String>) -> Self {
        Self {
            id,
            connection,
            nickname: nickname.into(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Display-only; nothing routes on it
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
}

/// Registry of every registered client, keyed by id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record
    ///
    /// Rejects an id that is already present; the existing record is left
    /// untouched.
    pub fn insert(&self, record: ClientRecord) -> Result<Arc<ClientRecord>, RelayError> {
        let id = record.id();
        match self.clients.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Attempted to add a non-unique client id {} to the registry", id);
                Err(RelayError::DuplicateClient(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let record = Arc::new(record);
                slot.insert(Arc::clone(&record));
                debug!("Registered client {}", id);
                Ok(record)
            }
        }
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a record and force-close its connection
    ///
    /// Returns the removed record, or `None` if it was already gone.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        let (_, record) = self.clients.remove(&id)?;
        record.connection().close();
        debug!("Unregistered client {}", id);
        Some(record)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
