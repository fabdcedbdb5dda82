//! JSON envelope protocol for room coordination.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! { "type": "<kind>", ...camelCase payload fields }
//! ```
//!
//! Inbound frames are validated in two steps: first the `type`
//! discriminator must be present and known, then the payload is decoded
//! into the matching [`ClientMessage`] variant. Each step fails with its
//! own [`ProtocolError`] so the gateway can log exactly what was wrong.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a file inside a room.
pub type FileId = u64;

/// Public identity of a participant, as shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
}

/// A text file held by a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub name: String,
    /// Full authoritative text.
    pub content: String,
    /// Focus hint only, never updated by `file-switch`.
    #[serde(rename = "active")]
    pub is_active: bool,
}

/// One entry of a room's chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(rename = "username")]
    pub author_name: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub created_at: u64,
}

/// Messages sent by participants to the coordinator.
///
/// `userId` fields carried in payloads are informational; the gateway
/// attributes every message to the identity bound by `join-room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CodeChange {
        file_id: FileId,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CursorPosition {
        #[serde(default)]
        file_id: Option<FileId>,
        pos: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileSwitch {
        file_id: FileId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileCreate { file_name: String },
    #[serde(rename_all = "camelCase")]
    SendChatMessage { text: String },
    #[serde(rename_all = "camelCase")]
    GithubConnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        repo_full_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GithubCommit { commit_message: String },
}

impl ClientMessage {
    /// Every discriminator accepted from clients.
    pub const KINDS: [&'static str; 9] = [
        "join-room",
        "leave-room",
        "code-change",
        "cursor-position",
        "file-switch",
        "file-create",
        "send-chat-message",
        "github-connect",
        "github-commit",
    ];

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingDiscriminator),
        };
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Wire discriminator of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::CodeChange { .. } => "code-change",
            Self::CursorPosition { .. } => "cursor-position",
            Self::FileSwitch { .. } => "file-switch",
            Self::FileCreate { .. } => "file-create",
            Self::SendChatMessage { .. } => "send-chat-message",
            Self::GithubConnect { .. } => "github-connect",
            Self::GithubCommit { .. } => "github-commit",
        }
    }
}

/// Messages sent by the coordinator to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Private snapshot for a participant that just joined.
    #[serde(rename_all = "camelCase")]
    RoomState {
        files: Vec<File>,
        users: Vec<UserSummary>,
        messages: Vec<ChatMessage>,
        github_connected: bool,
    },
    UserJoined { user: UserSummary },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    #[serde(rename_all = "camelCase")]
    CodeUpdate {
        file_id: FileId,
        code: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        pos: Value,
        file_id: Option<FileId>,
        user_id: String,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    FileSwitched { file_id: FileId, user_id: String },
    FileCreated { file: File },
    NewChatMessage { message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    GithubConnected {
        repo_full_name: String,
        branch: String,
    },
    #[serde(rename_all = "camelCase")]
    CommitSuccess {
        commit_message: String,
        commit_hash: String,
        author: String,
    },
    CommitError { error: String },
}

impl ServerMessage {
    /// Decode a text frame (client side).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Wire discriminator of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomState { .. } => "room-state",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::CodeUpdate { .. } => "code-update",
            Self::CursorUpdate { .. } => "cursor-update",
            Self::FileSwitched { .. } => "file-switched",
            Self::FileCreated { .. } => "file-created",
            Self::NewChatMessage { .. } => "new-chat-message",
            Self::GithubConnected { .. } => "github-connected",
            Self::CommitSuccess { .. } => "commit-success",
            Self::CommitError { .. } => "commit-error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Envelope has no \"type\" discriminator")]
    MissingDiscriminator,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
