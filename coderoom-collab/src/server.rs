//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── RoomStore ── Room ABC123 (Mutex)
//!             ├── connection ──┤                   │
//! Client B ──┘    tasks        └── Coordinator ────┤
//!                   ▲                              ▼
//!                   │                        BroadcastHub
//!                   │                              │
//!                   └──────── PeerLink queues ◄────┘
//! ```
//!
//! Each connection runs one task that multiplexes its sources with
//! `tokio::select!`: frames from the socket, frames queued for it by
//! broadcasts, the heartbeat timer and the overflow signal of its queue.
//! A peer whose queue overflowed is closed with code 1013 (try again
//! later) rather than left running with missing updates. When the socket
//! goes away the task performs the implicit leave.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastHub, Frame, PeerLink};
use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CoordinatorSettings, Participant};
use crate::persistence::SnapshotWriter;
use crate::protocol::ClientMessage;
use crate::store::RoomStore;
use crate::vcs::{CommitIdentity, GitCli, VcsRemote};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long a lagging peer gets to accept the close frame.
const SLOW_PEER_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    malformed_messages: AtomicU64,
}

/// The room server.
pub struct CollabServer {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a server that publishes commits with the `git` CLI.
    pub fn new(config: ServerConfig) -> Self {
        let identity = match (&config.commit_author_name, &config.commit_author_email) {
            (Some(name), Some(email)) => Some(CommitIdentity {
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        };
        let git = GitCli::new()
            .with_host(config.github_host.clone())
            .with_identity(identity);
        Self::with_vcs(config, Arc::new(git))
    }

    /// Create a server with a custom VCS backend.
    pub fn with_vcs(config: ServerConfig, vcs: Arc<dyn VcsRemote>) -> Self {
        let settings = CoordinatorSettings {
            commit_timeout: config.commit_timeout(),
            default_token: config.github_token.clone(),
        };
        let coordinator = Coordinator::new(
            Arc::new(RoomStore::new()),
            Arc::new(BroadcastHub::new()),
            SnapshotWriter::new(config.sessions_root.clone()),
            vcs,
            settings,
        );
        Self {
            config,
            coordinator: Arc::new(coordinator),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Room server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let sweeper = self.config.room_ttl().map(|ttl| {
            let store = self.coordinator.store().clone();
            tokio::spawn(sweep_idle_rooms(store, ttl))
        });

        let result = self.accept_loop(listener).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (link, outbound) = PeerLink::channel(config.outbound_capacity);
        let mut participant = Participant::new(link);

        let result = Self::pump(
            ws_stream,
            addr,
            &coordinator,
            &stats,
            &mut participant,
            outbound,
            config.heartbeat_interval(),
        )
        .await;

        // Implicit leave, whatever ended the connection.
        coordinator.leave(&mut participant).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        coordinator: &Coordinator,
        stats: &AtomicServerStats,
        participant: &mut Participant,
        mut outbound: mpsc::Receiver<Frame>,
        heartbeat: Option<Duration>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let link = participant.link().clone();
        let mut heartbeat = heartbeat.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            match ClientMessage::decode(text.as_str()) {
                                Ok(client_msg) => {
                                    log::trace!("{} from {addr}", client_msg.kind());
                                    coordinator.dispatch(participant, client_msg).await;
                                }
                                Err(e) => {
                                    stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Ignoring {}-byte binary frame from {addr}", data.len());
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frames queued by broadcasts and direct replies
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(timer) => timer.tick().await,
                        // No heartbeat configured: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }

                _ = link.overflowed() => {
                    log::warn!("Disconnecting {addr}: outbound queue overflowed");
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Again,
                        reason: Utf8Bytes::from_static("outbound queue overflowed"),
                    }));
                    if tokio::time::timeout(SLOW_PEER_CLOSE_GRACE, ws_sender.send(close))
                        .await
                        .is_err()
                    {
                        log::debug!("Close frame to {addr} not accepted in time");
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
            active_rooms: self.coordinator.store().room_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

async fn sweep_idle_rooms(store: Arc<RoomStore>, ttl: Duration) {
    let period = (ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut timer = tokio::time::interval(period);
    loop {
        timer.tick().await;
        let evicted = store.evict_idle(ttl).await;
        if !evicted.is_empty() {
            log::debug!("Idle sweep evicted {} rooms", evicted.len());
        }
    }
}
