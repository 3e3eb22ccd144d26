//! Connection acceptor and per-connection listener
//!
//! Handles individual client connections: WebSocket upgrade, the
//! three-message handshake, registration, and the receive loop that feeds
//! the dispatcher until the connection closes.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::RelayError;
use crate::message::{body, Envelope, MessageType};
use crate::server::ChatServer;
use crate::types::{ClientId, ConversationId};

/// Handle a new TCP connection
///
/// Runs the handshake and, on success, spawns the listener for the new
/// client. Any deviation from the handshake closes the connection without
/// registering anything.
pub async fn handle_connection(
    stream: TcpStream,
    server: Arc<ChatServer>,
) -> Result<ClientId, RelayError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let connection = Arc::new(
        Connection::new(ws_stream, peer_addr).with_send_timeout(server.config().send_timeout),
    );
    connection.set_print_messages(server.config().print_messages);

    match handshake(&connection, &server).await {
        Ok(client_id) => Ok(client_id),
        Err(e) => {
            connection.finish().await;
            Err(e)
        }
    }
}

async fn handshake(connection: &Arc<Connection>, server: &Arc<ChatServer>) -> Result<ClientId, RelayError> {
    // Assign id and greet
    let client_id = server.ids().next_client_id()?;
    info!("NC - client {} from {}", client_id, connection.peer());
    let greeting = Envelope::new(
        MessageType::NetworkConnect,
        ConversationId::NONE,
        client_id,
        body::CONNECTION_START_ACK,
    );
    if !connection.send(&greeting).await {
        return Err(RelayError::ConnectionClosed);
    }

    // Await the client's ACK carrying its nickname
    let reply = match server.config().handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, connection.receive())
            .await
            .map_err(|_| RelayError::HandshakeTimeout)?,
        None => connection.receive().await,
    };
    let ack = match reply {
        Some(ack) if ack.kind() == MessageType::NetworkConnect => ack,
        other => {
            warn!("Invalid or no response from client {}", client_id);
            return Err(RelayError::unexpected_reply(other.map(|e| e.kind())));
        }
    };

    // Register
    connection.bind(client_id)?;
    let client = server.add_client(client_id, Arc::clone(connection), ack.body())?;
    info!("Client {} registered as '{}'", client_id, client.nickname());

    // Start listener
    {
        let connection = Arc::clone(connection);
        let server = Arc::clone(server);
        tokio::spawn(listen(connection, server));
    }

    // Final ACK
    let accepted = Envelope::new(
        MessageType::NetworkConnect,
        ConversationId::NONE,
        client_id,
        body::CONNECTION_FINAL_ACK,
    );
    connection.send(&accepted).await;

    Ok(client_id)
}

/// Receive loop for one registered connection
///
/// Exits once `receive` reports the connection closed, then removes the
/// client so a dropped socket cleans up the same way a sign-off does.
pub async fn listen(connection: Arc<Connection>, server: Arc<ChatServer>) {
    let client_id = connection.client_id();
    debug!("Listening to client {}", client_id);

    while let Some(envelope) = connection.receive().await {
        server.dispatch(&connection, envelope).await;
    }

    server
        .remove_client(client_id, body::DISCONNECT_UNEXPECTED)
        .await;
    connection.finish().await;
    info!("Client {} disconnected", client_id);
}
