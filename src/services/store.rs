//! In-memory chat history.
//!
//! Keeps a chat's messages and spoken transcripts while its connection is open
//! and drops them when the connection ends, so memory follows the number of
//! live sessions. It stands in for a database-backed store behind the same
//! `ChatStore` trait.

use super::{ChatStore, PersistenceError};
use crate::session::{ChatMode, Role, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub user_id: String,
    pub mode: ChatMode,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
    /// One entry per spoken utterance, user and assistant alike
    pub transcripts: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    chats: RwLock<HashMap<String, StoredChat>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chats_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredChat>> {
        self.chats.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(
        &self,
        session: &Session,
        entry: StoredMessage,
        list: impl FnOnce(&mut StoredChat) -> &mut Vec<StoredMessage>,
    ) -> Result<(), PersistenceError> {
        let mut chats = self.chats_mut();
        let chat = chats
            .get_mut(&session.chat_id)
            .ok_or_else(|| PersistenceError(format!("unknown chat {}", session.chat_id)))?;
        list(chat).push(entry);
        Ok(())
    }

    #[cfg(test)]
    pub fn chat(&self, chat_id: &str) -> Option<StoredChat> {
        self.chats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat_id)
            .cloned()
    }

    #[cfg(test)]
    pub fn chat_count(&self) -> usize {
        self.chats.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn open_chat(&self, user_id: &str, mode: ChatMode) -> Result<String, PersistenceError> {
        let chat_id = Uuid::new_v4().to_string();
        let chat = StoredChat {
            user_id: user_id.to_string(),
            mode,
            created_at: Utc::now(),
            messages: Vec::new(),
            transcripts: Vec::new(),
        };

        self.chats_mut().insert(chat_id.clone(), chat);

        debug!(%chat_id, user_id, %mode, "Chat opened");
        Ok(chat_id)
    }

    async fn persist_turn(
        &self,
        session: &Session,
        role: Role,
        text: &str,
    ) -> Result<(), PersistenceError> {
        let entry = StoredMessage {
            role,
            text: text.to_string(),
        };
        self.append(session, entry, |chat| &mut chat.messages)
    }

    async fn record_transcript(
        &self,
        session: &Session,
        role: Role,
        text: &str,
    ) -> Result<(), PersistenceError> {
        let entry = StoredMessage {
            role,
            text: text.to_string(),
        };
        self.append(session, entry, |chat| &mut chat.transcripts)
    }

    /// Evict the chat. Closing an unknown chat (e.g. a locally generated id) is a no-op.
    async fn close_chat(&self, session: &Session) -> Result<(), PersistenceError> {
        if let Some(chat) = self.chats_mut().remove(&session.chat_id) {
            debug!(
                chat_id = %session.chat_id,
                user_id = %chat.user_id,
                mode = %chat.mode,
                messages = chat.messages.len(),
                transcripts = chat.transcripts.len(),
                open_s = (Utc::now() - chat.created_at).num_seconds(),
                "Chat closed"
            );
        }
        Ok(())
    }
}
