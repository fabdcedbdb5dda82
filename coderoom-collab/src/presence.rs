//! Ephemeral caret presence.
//!
//! Cursor positions are relayed, never persisted: they live in the room's
//! [`CursorRelay`] only so the latest position per user can be replaced
//! in place and dropped when the user leaves. Room snapshots sent to
//! joiners never include them.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

use crate::protocol::{FileId, ServerMessage};

/// Latest caret position reported by one user.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub user_id: String,
    pub username: String,
    pub file_id: Option<FileId>,
    /// Editor-defined position object, relayed untouched.
    pub position: Value,
    pub updated_at: Instant,
}

impl CursorState {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        file_id: Option<FileId>,
        position: Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            file_id,
            position,
            updated_at: Instant::now(),
        }
    }

    /// The `cursor-update` relayed to peers.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::CursorUpdate {
            pos: self.position.clone(),
            file_id: self.file_id,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Per-room map of the latest cursor per user.
#[derive(Debug, Default)]
pub struct CursorRelay {
    cursors: HashMap<String, CursorState>,
}

impl CursorRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the user's cursor and return the message to relay.
    pub fn update(&mut self, state: CursorState) -> ServerMessage {
        let msg = state.to_message();
        self.cursors.insert(state.user_id.clone(), state);
        msg
    }

    /// Forget a user's cursor.
    pub fn remove(&mut self, user_id: &str) -> Option<CursorState> {
        self.cursors.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&CursorState> {
        self.cursors.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
