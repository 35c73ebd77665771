//! # Voice Sessions
//!
//! A `Session` ties one WebSocket connection to the user, chat and mode named in
//! its handshake. It lives exactly as long as the connection and is never
//! persisted here; the chat store only ever sees it by reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How the assistant should treat a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Smart,
    #[default]
    Voice,
    Pdf,
    Web,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Smart => "smart",
            ChatMode::Voice => "voice",
            ChatMode::Pdf => "pdf",
            ChatMode::Web => "web",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// First text message on a voice connection.
///
/// ```json
/// {"user_id": "42", "mode": "voice"}
/// ```
/// `mode` may be omitted and defaults to `voice`; any other value than
/// `smart`, `voice`, `pdf` or `web` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Handshake {
    pub user_id: String,
    #[serde(default)]
    pub mode: ChatMode,
}

#[derive(Debug)]
pub enum HandshakeError {
    Malformed(serde_json::Error),
    MissingUserId,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Malformed(err) => write!(f, "Malformed handshake: {}", err),
            HandshakeError::MissingUserId => write!(f, "Handshake is missing user_id"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl Handshake {
    pub fn parse(text: &str) -> Result<Self, HandshakeError> {
        let handshake: Handshake = serde_json::from_str(text).map_err(HandshakeError::Malformed)?;
        if handshake.user_id.trim().is_empty() {
            return Err(HandshakeError::MissingUserId);
        }
        Ok(handshake)
    }
}

/// One live voice conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub mode: ChatMode,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(handshake: Handshake, chat_id: String) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id: handshake.user_id,
            chat_id,
            mode: handshake.mode,
            started_at: Utc::now(),
        }
    }
}
