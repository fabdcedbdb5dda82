//! Authoritative state of a single room.
//!
//! A [`Room`] is plain data; it is only ever touched through the mutex of
//! its [`RoomHandle`](crate::store::RoomHandle), so every method here runs
//! with exclusive access and may broadcast without further locking.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::broadcast::{BroadcastHub, ConnectionId, PeerLink, Recipients};
use crate::presence::CursorRelay;
use crate::protocol::{ChatMessage, File, FileId, ServerMessage, UserSummary};

/// Name of the file every new room starts with.
pub const DEFAULT_FILE_NAME: &str = "index.html";

/// Id of the seeded file. Ids of created files start above it.
pub const SEED_FILE_ID: FileId = 1;

/// Boilerplate content of the seeded file.
pub const DEFAULT_FILE_CONTENT: &str = "<!DOCTYPE html>\n<html>\n<head>\n  <title>Hello World</title>\n</head>\n<body>\n  <h1>Hello CodeBros!</h1>\n</body>\n</html>";

/// Branch used when `github-connect` names none.
pub const DEFAULT_BRANCH: &str = "main";

/// A participant bound to a room.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub id: String,
    pub display_name: String,
    pub link: PeerLink,
}

impl UserSession {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, link: PeerLink) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            link,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
        }
    }
}

/// Link between a room and a remote repository. In memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct VcsConfig {
    pub credential_token: Option<String>,
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl VcsConfig {
    /// Parse an `owner/repo` name. Returns `None` unless both parts are
    /// non-empty and free of further slashes.
    pub fn from_repo_full_name(
        repo_full_name: &str,
        branch: Option<&str>,
        credential_token: Option<String>,
    ) -> Option<Self> {
        let (owner, repo) = repo_full_name.trim().split_once('/')?;
        let (owner, repo) = (owner.trim(), repo.trim().trim_end_matches(".git"));
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        let branch = branch
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH);
        Some(Self {
            credential_token: credential_token.filter(|t| !t.is_empty()),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
    }

    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Debug for VcsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcsConfig")
            .field("credential_token", &self.credential_token.as_ref().map(|_| "***"))
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .finish()
    }
}

/// Authoritative room state.
#[derive(Debug)]
pub struct Room {
    key: String,
    users: HashMap<String, UserSession>,
    files: Vec<File>,
    chat: Vec<ChatMessage>,
    vcs: Option<VcsConfig>,
    cursors: CursorRelay,
    /// When the last user left; `None` while occupied.
    empty_since: Option<Instant>,
    /// Set once the store has dropped this room.
    evicted: bool,
}

impl Room {
    /// Create a room seeded with the default file.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            users: HashMap::new(),
            files: vec![File {
                id: SEED_FILE_ID,
                name: DEFAULT_FILE_NAME.to_string(),
                content: DEFAULT_FILE_CONTENT.to_string(),
                is_active: true,
            }],
            chat: Vec::new(),
            vcs: None,
            cursors: CursorRelay::new(),
            empty_since: Some(Instant::now()),
            evicted: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    // ── Users ───────────────────────────────────────────────────

    /// Bind a user, replacing any previous session with the same id.
    pub fn insert_user(&mut self, session: UserSession) -> Option<UserSession> {
        self.empty_since = None;
        self.users.insert(session.id.clone(), session)
    }

    /// Unbind a user and drop their cursor.
    ///
    /// With `connection` set, the session is only removed if it is still
    /// bound to that connection.
    pub fn remove_user(
        &mut self,
        user_id: &str,
        connection: Option<ConnectionId>,
    ) -> Option<UserSession> {
        let bound_here = match (self.users.get(user_id), connection) {
            (Some(session), Some(conn)) => session.link.id() == conn,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !bound_here {
            return None;
        }

        self.cursors.remove(user_id);
        let removed = self.users.remove(user_id);
        if self.users.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        removed
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user_summaries(&self) -> Vec<UserSummary> {
        self.users.values().map(UserSession::summary).collect()
    }

    // ── Files ───────────────────────────────────────────────────

    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn file(&self, file_id: FileId) -> Option<&File> {
        self.files.iter().find(|f| f.id == file_id)
    }

    /// Replace a file's content. Returns `false` for an unknown id.
    pub fn apply_edit(&mut self, file_id: FileId, content: String) -> bool {
        match self.files.iter_mut().find(|f| f.id == file_id) {
            Some(file) => {
                file.content = content;
                true
            }
            None => false,
        }
    }

    /// Append an empty, inactive file.
    pub fn push_file(&mut self, file_id: FileId, name: impl Into<String>) -> &File {
        self.files.push(File {
            id: file_id,
            name: name.into(),
            content: String::new(),
            is_active: false,
        });
        &self.files[self.files.len() - 1]
    }

    // ── Chat ────────────────────────────────────────────────────

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat
    }

    /// Append a chat message stamped no earlier than its predecessor.
    pub fn push_chat(
        &mut self,
        message_id: u64,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
        text: impl Into<String>,
    ) -> &ChatMessage {
        let floor = self.chat.last().map_or(0, |m| m.created_at);
        self.chat.push(ChatMessage {
            id: message_id,
            author_id: author_id.into(),
            author_name: author_name.into(),
            text: text.into(),
            created_at: unix_millis().max(floor),
        });
        &self.chat[self.chat.len() - 1]
    }

    // ── VCS / cursors ───────────────────────────────────────────

    pub fn vcs(&self) -> Option<&VcsConfig> {
        self.vcs.as_ref()
    }

    pub fn set_vcs(&mut self, config: VcsConfig) {
        self.vcs = Some(config);
    }

    pub fn cursors(&self) -> &CursorRelay {
        &self.cursors
    }

    pub fn cursors_mut(&mut self) -> &mut CursorRelay {
        &mut self.cursors
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// How long the room has had no users, if it is empty.
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.empty_since.map(|since| since.elapsed())
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    // ── Fan-out ─────────────────────────────────────────────────

    /// Private snapshot for a joining participant. Cursors are excluded.
    pub fn state_message(&self) -> ServerMessage {
        ServerMessage::RoomState {
            files: self.files.clone(),
            users: self.user_summaries(),
            messages: self.chat.clone(),
            github_connected: self.vcs.is_some(),
        }
    }

    /// Broadcast to this room's connections.
    pub fn broadcast(
        &self,
        hub: &BroadcastHub,
        msg: &ServerMessage,
        recipients: Recipients<'_>,
    ) -> usize {
        let peers = self
            .users
            .values()
            .map(|session| (session.id.as_str(), &session.link));
        hub.broadcast(&self.key, peers, msg, recipients)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
