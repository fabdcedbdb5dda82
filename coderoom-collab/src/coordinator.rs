//! Message handlers: the per-room operations behind every client message.
//!
//! ```text
//! ClientMessage ──► Coordinator::dispatch
//!                        │
//!                        ├── join / leave ─────────────┐
//!                        ├── apply_edit / create_file  │  room.lock()
//!                        ├── switch_active_file        ├─ mutate + broadcast
//!                        ├── update_cursor             │  in one critical
//!                        ├── post_message              │  section
//!                        ├── connect_vcs ──────────────┘
//!                        │
//!                        └── commit ──► CommitJob (detached task)
//!                                          │ room.lock_commits()
//!                                          ├── snapshot files
//!                                          ├── VcsRemote::commit_and_push
//!                                          └── commit-success (room)
//!                                              commit-error (requester)
//! ```
//!
//! Operations take the normalized room key. Identity always comes from the
//! connection's [`Participant`] binding, never from payload fields.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastHub, ConnectionId, PeerLink, Recipients};
use crate::persistence::SnapshotWriter;
use crate::presence::CursorState;
use crate::protocol::{ChatMessage, ClientMessage, File, FileId, ServerMessage, UserSummary};
use crate::room::{UserSession, VcsConfig};
use crate::store::{RoomHandle, RoomStore};
use crate::vcs::{CommitOutcome, VcsError, VcsRemote};

/// Identity a connection acquired through `join-room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_key: String,
    pub user_id: String,
    pub display_name: String,
}

/// Connection-scoped state owned by the gateway task.
#[derive(Debug)]
pub struct Participant {
    link: PeerLink,
    binding: Option<Binding>,
}

impl Participant {
    pub fn new(link: PeerLink) -> Self {
        Self { link, binding: None }
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }
}

/// Tunables for the handlers.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Upper bound for one commit + push.
    pub commit_timeout: Duration,
    /// Used when `github-connect` carries no token.
    pub default_token: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(120),
            default_token: None,
        }
    }
}

/// Applies client operations to rooms and fans out the results.
pub struct Coordinator {
    store: Arc<RoomStore>,
    hub: Arc<BroadcastHub>,
    snapshots: Arc<SnapshotWriter>,
    vcs: Arc<dyn VcsRemote>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        store: Arc<RoomStore>,
        hub: Arc<BroadcastHub>,
        snapshots: SnapshotWriter,
        vcs: Arc<dyn VcsRemote>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            hub,
            snapshots: Arc::new(snapshots),
            vcs,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Route one decoded message from `participant`.
    ///
    /// Returns the commit task when the message started one.
    pub async fn dispatch(
        &self,
        participant: &mut Participant,
        msg: ClientMessage,
    ) -> Option<JoinHandle<()>> {
        let msg = match msg {
            ClientMessage::JoinRoom { room_id, user_id, username } => {
                self.join(participant, &room_id, user_id, username).await;
                return None;
            }
            ClientMessage::LeaveRoom { .. } => {
                self.leave(participant).await;
                return None;
            }
            other => other,
        };

        let Some(binding) = participant.binding.clone() else {
            log::debug!("Ignoring {} from {} before join-room", msg.kind(), participant.link.id());
            return None;
        };
        let room = binding.room_key.as_str();
        let user = binding.user_id.as_str();

        match msg {
            ClientMessage::CodeChange { file_id, code, .. } => {
                self.apply_edit(room, file_id, code, user).await;
            }
            ClientMessage::CursorPosition { file_id, pos, .. } => {
                self.update_cursor(room, user, &binding.display_name, file_id, pos).await;
            }
            ClientMessage::FileSwitch { file_id, .. } => {
                self.switch_active_file(room, file_id, user).await;
            }
            ClientMessage::FileCreate { file_name } => {
                self.create_file(room, &file_name).await;
            }
            ClientMessage::SendChatMessage { text } => {
                self.post_message(room, user, &binding.display_name, &text).await;
            }
            ClientMessage::GithubConnect { token, repo_full_name, branch } => {
                self.connect_vcs(room, token, &repo_full_name, branch.as_deref()).await;
            }
            ClientMessage::GithubCommit { commit_message } => {
                return self.commit(room, &participant.link, commit_message).await;
            }
            ClientMessage::JoinRoom { .. } | ClientMessage::LeaveRoom { .. } => {}
        }
        None
    }

    // ── Session lifecycle ───────────────────────────────────────

    /// Bind `participant` to a room, creating it on first use.
    ///
    /// The joiner gets a private `room-state`; everyone else `user-joined`.
    pub async fn join(
        &self,
        participant: &mut Participant,
        room_id: &str,
        user_id: String,
        display_name: String,
    ) {
        let Some(key) = RoomStore::normalize_key(room_id) else {
            log::warn!("join-room with empty room id from {}", participant.link.id());
            return;
        };
        if user_id.trim().is_empty() {
            log::warn!("join-room with empty user id from {}", participant.link.id());
            return;
        }
        if participant.binding.is_some() {
            self.leave(participant).await;
        }

        loop {
            let (handle, _) = self.store.get_or_create(&key).await;
            let mut room = handle.lock().await;
            if room.is_evicted() {
                // Lost a race with the idle sweeper; take a fresh room.
                continue;
            }

            let session = UserSession::new(user_id.clone(), display_name.clone(), participant.link.clone());
            if let Some(previous) = room.insert_user(session) {
                if previous.link.id() != participant.link.id() {
                    log::info!("User {user_id} re-bound from {} in room {key}", previous.link.id());
                }
            }

            self.hub.send_direct(&participant.link, &room.state_message());
            let joined = ServerMessage::UserJoined {
                user: UserSummary {
                    id: user_id.clone(),
                    name: display_name.clone(),
                },
            };
            room.broadcast(&self.hub, &joined, Recipients::AllExcept(&user_id));
            log::info!("User {display_name} ({user_id}) joined room {key} [{} users]", room.user_count());
            break;
        }

        participant.binding = Some(Binding {
            room_key: key,
            user_id,
            display_name,
        });
    }

    /// Unbind `participant` (explicit leave or connection loss).
    pub async fn leave(&self, participant: &mut Participant) {
        let Some(binding) = participant.binding.take() else {
            return;
        };
        self.leave_room(&binding.room_key, &binding.user_id, Some(participant.link.id()))
            .await;
    }

    /// Remove a user from a room and tell the others. No-op if either is gone.
    ///
    /// With `connection` set, only a session bound to that connection is removed.
    pub async fn leave_room(
        &self,
        room_id: &str,
        user_id: &str,
        connection: Option<ConnectionId>,
    ) -> bool {
        let Some(handle) = self.store.get(room_id).await else {
            return false;
        };
        let mut room = handle.lock().await;
        let Some(session) = room.remove_user(user_id, connection) else {
            return false;
        };

        let left = ServerMessage::UserLeft {
            user_id: user_id.to_string(),
        };
        room.broadcast(&self.hub, &left, Recipients::AllExcept(user_id));
        log::info!(
            "User {} ({user_id}) left room {room_id} [{} users]",
            session.display_name,
            room.user_count()
        );
        true
    }

    // ── Files ───────────────────────────────────────────────────

    /// Replace a file's content and relay it to everyone but the author.
    ///
    /// Last write wins. Returns `false` if the room or file is unknown; an
    /// edit for an unknown file is still relayed.
    pub async fn apply_edit(
        &self,
        room_id: &str,
        file_id: FileId,
        new_content: String,
        author_id: &str,
    ) -> bool {
        let Some(handle) = self.store.get(room_id).await else {
            return false;
        };
        let mut room = handle.lock().await;
        let applied = room.apply_edit(file_id, new_content.clone());
        if applied {
            log::trace!("File {file_id} updated by {author_id} in room {room_id}");
        } else {
            log::debug!("code-change for unknown file {file_id} in room {room_id}");
        }

        let update = ServerMessage::CodeUpdate {
            file_id,
            code: new_content,
            user_id: author_id.to_string(),
        };
        room.broadcast(&self.hub, &update, Recipients::AllExcept(author_id));
        applied
    }

    /// Append an empty file and announce it to everyone, creator included.
    pub async fn create_file(&self, room_id: &str, name: &str) -> Option<File> {
        let name = name.trim();
        if name.is_empty() {
            log::warn!("file-create with empty name in room {room_id}");
            return None;
        }
        let handle = self.store.get(room_id).await?;
        let mut room = handle.lock().await;
        if room.files().iter().any(|f| f.name == name) {
            log::warn!("Room {room_id} now has more than one file named {name:?}");
        }

        let file = room.push_file(self.store.next_file_id(), name).clone();
        room.broadcast(&self.hub, &ServerMessage::FileCreated { file: file.clone() }, Recipients::All);
        log::info!("File {name:?} ({}) created in room {room_id}", file.id);
        Some(file)
    }

    /// Relay a focus change. The stored `active` flags are not touched.
    pub async fn switch_active_file(&self, room_id: &str, file_id: FileId, user_id: &str) {
        let Some(handle) = self.store.get(room_id).await else {
            return;
        };
        let room = handle.lock().await;
        let switched = ServerMessage::FileSwitched {
            file_id,
            user_id: user_id.to_string(),
        };
        room.broadcast(&self.hub, &switched, Recipients::AllExcept(user_id));
    }

    // ── Presence / chat ─────────────────────────────────────────

    /// Replace the user's transient cursor and relay it to the others.
    pub async fn update_cursor(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        file_id: Option<FileId>,
        position: serde_json::Value,
    ) {
        let Some(handle) = self.store.get(room_id).await else {
            return;
        };
        let mut room = handle.lock().await;
        let update = room
            .cursors_mut()
            .update(CursorState::new(user_id, username, file_id, position));
        room.broadcast(&self.hub, &update, Recipients::AllExcept(user_id));
    }

    /// Append to the chat log and broadcast to everyone, sender included.
    pub async fn post_message(
        &self,
        room_id: &str,
        author_id: &str,
        author_name: &str,
        text: &str,
    ) -> Option<ChatMessage> {
        let handle = self.store.get(room_id).await?;
        let mut room = handle.lock().await;
        let message = room
            .push_chat(self.store.next_chat_id(), author_id, author_name, text)
            .clone();
        room.broadcast(
            &self.hub,
            &ServerMessage::NewChatMessage { message: message.clone() },
            Recipients::All,
        );
        log::debug!("Chat message from {author_name} in room {room_id}");
        Some(message)
    }

    // ── VCS ─────────────────────────────────────────────────────

    /// Store the room's repository link and announce it.
    pub async fn connect_vcs(
        &self,
        room_id: &str,
        token: Option<String>,
        repo_full_name: &str,
        branch: Option<&str>,
    ) -> bool {
        let token = token
            .filter(|t| !t.is_empty())
            .or_else(|| self.settings.default_token.clone());
        let Some(config) = VcsConfig::from_repo_full_name(repo_full_name, branch, token) else {
            log::warn!("github-connect with invalid repository {repo_full_name:?} in room {room_id}");
            return false;
        };
        let Some(handle) = self.store.get(room_id).await else {
            return false;
        };

        let mut room = handle.lock().await;
        let connected = ServerMessage::GithubConnected {
            repo_full_name: config.repo_full_name(),
            branch: config.branch.clone(),
        };
        log::info!("Room {room_id} linked to {}@{}", config.repo_full_name(), config.branch);
        room.set_vcs(config);
        room.broadcast(&self.hub, &connected, Recipients::All);
        true
    }

    /// Start a commit of the room's files.
    ///
    /// Without a repository link the requester gets `commit-error` and
    /// nothing is started. Otherwise the work runs detached; commits of the
    /// same room run one at a time.
    pub async fn commit(
        &self,
        room_id: &str,
        requester: &PeerLink,
        message: String,
    ) -> Option<JoinHandle<()>> {
        let handle = self.store.get(room_id).await;
        let configured = match &handle {
            Some(handle) => handle.lock().await.vcs().is_some(),
            None => false,
        };
        let Some(handle) = handle.filter(|_| configured) else {
            self.reply_commit_error(requester, &VcsError::NotConfigured);
            return None;
        };

        let job = CommitJob {
            room: handle,
            requester: requester.clone(),
            message,
            hub: self.hub.clone(),
            snapshots: self.snapshots.clone(),
            vcs: self.vcs.clone(),
            timeout: self.settings.commit_timeout,
        };
        Some(tokio::spawn(job.run()))
    }

    fn reply_commit_error(&self, requester: &PeerLink, error: &VcsError) {
        self.hub.send_direct(
            requester,
            &ServerMessage::CommitError {
                error: error.to_string(),
            },
        );
    }
}

/// One commit request, executed off the handler path.
struct CommitJob {
    room: Arc<RoomHandle>,
    requester: PeerLink,
    message: String,
    hub: Arc<BroadcastHub>,
    snapshots: Arc<SnapshotWriter>,
    vcs: Arc<dyn VcsRemote>,
    timeout: Duration,
}

impl CommitJob {
    async fn run(self) {
        let _exclusive = self.room.lock_commits().await;
        let key = self.room.key().to_string();

        match self.publish().await {
            Ok(outcome) => {
                log::info!("Room {key} committed {} by {}", outcome.short_hash, outcome.author_name);
                let success = ServerMessage::CommitSuccess {
                    commit_message: self.message.clone(),
                    commit_hash: outcome.short_hash,
                    author: outcome.author_name,
                };
                self.room.lock().await.broadcast(&self.hub, &success, Recipients::All);
            }
            Err(e) => {
                log::error!("Commit failed for room {key}: {e}");
                self.hub.send_direct(
                    &self.requester,
                    &ServerMessage::CommitError { error: e.to_string() },
                );
            }
        }
    }

    async fn publish(&self) -> Result<CommitOutcome, VcsError> {
        // Read state only once the previous commit has finished.
        let (files, config) = {
            let room = self.room.lock().await;
            (room.files().to_vec(), room.vcs().cloned())
        };
        let config = config.ok_or(VcsError::NotConfigured)?;

        let dir = self.snapshots.snapshot(self.room.key(), &files)?;
        match tokio::time::timeout(
            self.timeout,
            self.vcs.commit_and_push(&dir, &self.message, &config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(VcsError::Timeout(self.timeout)),
        }
    }
}
