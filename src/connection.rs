//! Connection wrapper
//!
//! One per socket. Wraps both halves of a WebSocket stream so callers only
//! ever see whole [`Envelope`]s. Transport failures are absorbed here and
//! surface only as the connection becoming closed.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn, Level};

use crate::error::RelayError;
use crate::message::Envelope;
use crate::types::ClientId;

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// A live, bidirectional, ordered envelope stream
pub struct Connection {
    peer: String,
    client_id: OnceLock<ClientId>,
    sink: Mutex<FrameSink>,
    source: Mutex<FrameSource>,
    closed: watch::Sender<bool>,
    print_messages: AtomicBool,
    send_timeout: Option<Duration>,
}

impl Connection {
    /// Wrap an established WebSocket stream
    pub fn new<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let sink: FrameSink = Box::pin(sink);
        let source: FrameSource = Box::pin(source);
        let (closed, _) = watch::channel(false);
        Self {
            peer: peer.into(),
            client_id: OnceLock::new(),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed,
            print_messages: AtomicBool::new(true),
            send_timeout: None,
        }
    }

    /// Bound every write; a peer that stops reading is closed once a send
    /// stalls past `limit`
    pub fn with_send_timeout(mut self, limit: Option<Duration>) -> Self {
        self.send_timeout = limit;
        self
    }

    /// Remote address, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bind the client id this connection speaks for
    ///
    /// A connection is bound at most once for its lifetime.
    pub fn bind(&self, client_id: ClientId) -> Result<(), RelayError> {
        self.client_id
            .set(client_id)
            .map_err(|_| RelayError::AlreadyBound(self.client_id()))
    }

    /// Bound client id, or the server id (0) while unbound
    pub fn client_id(&self) -> ClientId {
        self.client_id.get().copied().unwrap_or(ClientId::SERVER)
    }

    /// Toggle info-level TX/RX echo
    pub fn set_print_messages(&self, enabled: bool) {
        self.print_messages.store(enabled, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Mark the connection closed and wake any pending `receive`
    ///
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Connection {} (client {}) closed", self.peer, self.client_id());
        }
    }

    /// Send one envelope
    ///
    /// Returns false without touching the transport if already closed. A
    /// write failure, or a write outlasting the send timeout, closes the
    /// connection and also returns false.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        if self.is_closed() {
            return false;
        }

        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {}: {}", envelope, e);
                return false;
            }
        };

        let write = async {
            let mut sink = self.sink.lock().await;
            if self.is_closed() {
                return None;
            }
            Some(sink.send(Message::Text(json.into())).await)
        };
        let outcome = match self.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Write to {} stalled for {:?}; closing", self.peer, limit);
                    self.close();
                    return false;
                }
            },
            None => write.await,
        };

        match outcome {
            Some(Ok(())) => {
                self.echo("TX", envelope);
                true
            }
            Some(Err(e)) => {
                debug!("Write to {} failed: {}", self.peer, e);
                self.close();
                false
            }
            None => false,
        }
    }

    /// Wait for the next envelope
    ///
    /// Returns `None` once the connection is closed, the peer ends the
    /// stream, or a read fails. Frames that are not envelopes are skipped.
    pub async fn receive(&self) -> Option<Envelope> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }

        let mut source = self.source.lock().await;
        loop {
            let frame = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return None,
                frame = source.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        self.echo("RX", &envelope);
                        return Some(envelope);
                    }
                    Err(e) => {
                        warn!("Invalid envelope from {}: {}", self.peer, e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Peer {} ended the stream", self.peer);
                    drop(source);
                    self.close();
                    return None;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite; binary is not part of the protocol
                }
                Some(Err(e)) => {
                    debug!("Read from {} failed: {}", self.peer, e);
                    drop(source);
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Best-effort close frame once nothing else will be sent
    pub async fn finish(&self) {
        self.close();
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        };
        match self.send_timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, shutdown).await;
            }
            None => shutdown.await,
        }
    }

    /// Level TX/RX lines are logged at
    fn echo_level(&self) -> Level {
        if self.print_messages.load(Ordering::Relaxed) {
            Level::INFO
        } else {
            Level::TRACE
        }
    }

    fn echo(&self, direction: &str, envelope: &Envelope) {
        if self.echo_level() == Level::INFO {
            info!("{} - {}", direction, envelope);
        } else {
            trace!("{} - {}", direction, envelope);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("client_id", &self.client_id.get())
            .field("closed", &self.is_closed())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    /// Two connected ends over an in-memory pipe: (server side, client side)
    pub async fn pair() -> (Connection, Connection) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (
            Connection::new(server, "server-side"),
            Connection::new(client, "client-side"),
        )
    }
}
