//! WebSocket client for the room server.
//!
//! Provides:
//! - Connection lifecycle as an explicit state machine
//!   (Disconnected → Connecting → Connected → Disconnected)
//! - Automatic `join-room` on every (re)connect
//! - Fixed-delay reconnect after the connection drops
//!
//! The application sends [`ClientMessage`]s through [`RoomClient::send`]
//! and consumes [`ClientEvent`]s from the receiver returned by
//! [`RoomClient::take_event_rx`].

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state machine moved.
    StateChanged(ConnectionState),
    /// A message from the server.
    Message(ServerMessage),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port` of the room server
    pub server_url: String,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    /// Wait between a lost connection and the next attempt
    pub reconnect_delay: Duration,
    /// Capacity of the event and outgoing queues
    pub queue_capacity: usize,
    /// Retry after a lost connection
    pub reconnect: bool,
}

impl ClientConfig {
    /// Config with a generated user id and the default 3 s reconnect delay.
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_id: Uuid::new_v4().simple().to_string()[..9].to_string(),
            username: username.into(),
            reconnect_delay: Duration::from_millis(3000),
            queue_capacity: 256,
            reconnect: true,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Shared between the handle and the supervisor task.
struct Shared {
    state: RwLock<ConnectionState>,
    /// Sender into the live connection's writer; `None` while disconnected.
    outgoing_tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == next {
                return;
            }
            *state = next;
        }
        log::debug!("Client state -> {next:?}");
        let _ = self.event_tx.send(ClientEvent::StateChanged(next)).await;
    }
}

/// The room client.
pub struct RoomClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl RoomClient {
    /// Create a new client. Nothing connects until [`start`](Self::start).
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing_tx: RwLock::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. No-op if already started.
    pub fn start(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        let supervisor = Supervisor {
            config: self.config.clone(),
            shared: self.shared.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
    }

    /// Send a message on the live connection.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] while not connected;
    /// nothing is queued for later.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .shared
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Replace the content of a file.
    pub async fn send_code_change(&self, file_id: u64, code: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CodeChange {
            file_id,
            code: code.into(),
            user_id: Some(self.config.user_id.clone()),
        })
        .await
    }

    /// Post to the room chat.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SendChatMessage { text: text.into() }).await
    }

    /// Leave the room, keeping the connection open.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LeaveRoom {
            user_id: Some(self.config.user_id.clone()),
        })
        .await
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Background task owning the connect / pump / wait cycle.
struct Supervisor {
    config: ClientConfig,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.shared.set_state(ConnectionState::Connecting).await;
            let stopped = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
                Ok((ws_stream, _)) => self.session(ws_stream).await,
                Err(e) => {
                    log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                    false
                }
            };
            *self.shared.outgoing_tx.write().await = None;
            self.shared.set_state(ConnectionState::Disconnected).await;

            if stopped || !self.config.reconnect {
                break;
            }
            log::info!("Reconnecting in {}ms", self.config.reconnect_delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
    }

    /// Pump one connection. Returns `true` if it ended because of shutdown.
    async fn session<S>(&mut self, ws_stream: tokio_tungstenite::WebSocketStream<S>) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = match self.config.join_message().encode() {
            Ok(join) => join,
            Err(e) => {
                log::error!("Failed to encode join-room: {e}");
                return false;
            }
        };
        if let Err(e) = ws_writer.send(Message::text(join)).await {
            log::warn!("Failed to send join-room: {e}");
            return false;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.config.queue_capacity.max(1));
        *self.shared.outgoing_tx.write().await = Some(out_tx);
        self.shared.set_state(ConnectionState::Connected).await;
        log::info!("Joined room {} as {}", self.config.room_id, self.config.user_id);

        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                            Ok(server_msg) => {
                                let _ = self.shared.event_tx.send(ClientEvent::Message(server_msg)).await;
                            }
                            Err(e) => log::warn!("Failed to decode server message: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if ws_writer.send(Message::Pong(data)).await.is_err() {
                                return false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return false,
                        Some(Err(e)) => {
                            log::warn!("Connection error: {e}");
                            return false;
                        }
                        _ => {}
                    }
                }

                outgoing = out_rx.recv() => {
                    let Some(text) = outgoing else { return false };
                    if let Err(e) = ws_writer.send(Message::text(text)).await {
                        log::warn!("Failed to send: {e}");
                        return false;
                    }
                }

                _ = self.shutdown.changed() => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    return true;
                }
            }
        }
    }
}
