//! Multi-client Chat Relay Library
//!
//! Clients connect to a central server, create or join named conversations,
//! and exchange envelopes that are routed only to conversation members.
//!
//! # Features
//! - Three-message connection handshake assigning server-side client ids
//! - Conversation creation, invitation, joining and leaving
//! - Chat and emote broadcast to conversation members
//! - Source-id and conversation validation with REFUSE replies
//! - Lazy cleanup of members whose connection has failed
//! - Client-side session with per-type event callbacks
//!
//! # Architecture
//! Task-per-connection on tokio:
//! - `ChatServer` owns the client and conversation registries and the id
//!   generator; one instance is shared by every connection task
//! - Each accepted socket runs the handshake in `handler`, then a receive
//!   loop that feeds `ChatServer::dispatch`
//! - Each `Conversation` serializes its own membership changes and
//!   broadcasts; separate conversations proceed in parallel
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use chat_relay::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Arc::new(ChatServer::new(ServerConfig::default()));
//!     server.start().await.unwrap();
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod conversation;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::{ClientRecord, ClientRegistry};
pub use config::ServerConfig;
pub use connection::Connection;
pub use connector::{EventHandler, RelayClient, Reply};
pub use conversation::{Conversation, ConversationRegistry};
pub use error::RelayError;
pub use handler::handle_connection;
pub use message::{Envelope, MessageType};
pub use server::ChatServer;
pub use types::{ClientId, ConversationId, IdGenerator};
