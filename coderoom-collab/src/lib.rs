//! # coderoom-collab - Room coordination for collaborative code editing
//!
//! Participants join named rooms over WebSocket. Each room holds the
//! authoritative copy of its files, a chat transcript, live cursors and an
//! optional link to a remote git repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RoomClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │     JSON frames     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ Coordinator  │
//!                                     └──┬────────┬──┘
//!                                        │        │
//!                              ┌─────────┴──┐  ┌──┴───────────┐
//!                              │ RoomStore  │  │ BroadcastHub │
//!                              │ Room/Mutex │  │ (fan-out)    │
//!                              └─────┬──────┘  └──────────────┘
//!                                    │ github-commit
//!                              ┌─────┴──────────┐
//!                              │ SnapshotWriter │ → VcsRemote (git)
//!                              └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON message envelopes
//! - [`broadcast`]: Per-connection queues and room fan-out
//! - [`room`] / [`store`]: Room state and the room registry
//! - [`presence`]: Transient cursor positions
//! - [`coordinator`]: Handlers for every client message
//! - [`persistence`]: On-disk snapshots of room files
//! - [`vcs`]: Commit and push through `git`
//! - [`server`] / [`client`]: WebSocket endpoints
//! - [`config`]: Server configuration

pub mod protocol;
pub mod broadcast;
pub mod presence;
pub mod room;
pub mod store;
pub mod persistence;
pub mod vcs;
pub mod coordinator;
pub mod config;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ChatMessage, ClientMessage, File, FileId, ProtocolError, ServerMessage, UserSummary};
pub use broadcast::{BroadcastHub, BroadcastStats, PeerLink, Recipients};
pub use presence::{CursorRelay, CursorState};
pub use room::{Room, UserSession, VcsConfig};
pub use store::{RoomHandle, RoomStore};
pub use persistence::{PersistError, SnapshotWriter};
pub use vcs::{CommitIdentity, CommitOutcome, GitCli, VcsError, VcsRemote};
pub use coordinator::{Coordinator, CoordinatorSettings, Participant};
pub use config::{ConfigError, ServerConfig};
pub use server::{CollabServer, ServerStats};
pub use client::{ClientConfig, ClientEvent, ConnectionState, RoomClient};
