use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::protocol::{ChatMessage, Conversation, MessagePatch};

/// Title the backend reports until it has summarized a conversation
pub const PLACEHOLDER_TITLE: &str = "New Conversation";

struct ConversationLog {
    title: String,
    updated_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

impl ConversationLog {
    fn new() -> Self {
        Self {
            title: PLACEHOLDER_TITLE.to_string(),
            updated_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn has_in_flight(&self) -> bool {
        self.messages.iter().any(|m| m.is_in_flight())
    }

    fn snapshot(&self, id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: self.title.clone(),
            updated_at: self.updated_at,
            messages: self.messages.clone(),
        }
    }
}

/// Authoritative per-conversation message logs.
///
/// All mutation goes through these methods; callers only ever receive
/// clones. Each conversation is keyed independently so concurrent streams
/// on different conversations never touch each other's log.
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, ConversationLog>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConversationLog>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends to the end of the conversation, creating it on first use.
    ///
    /// An in-flight assistant placeholder is rejected while another assistant
    /// message in the same conversation has not reached a terminal state.
    pub fn append(&self, conversation_id: &str, message: ChatMessage) -> Result<(), StoreError> {
        let mut conversations = self.lock();
        let log = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationLog::new);

        if message.is_in_flight() && log.has_in_flight() {
            return Err(StoreError::AssistantInFlight {
                conversation_id: conversation_id.to_string(),
            });
        }

        log.messages.push(message);
        log.touch();
        Ok(())
    }

    /// Appends only if no message with the same id exists. Returns whether
    /// the message was added.
    pub fn append_unique(&self, conversation_id: &str, message: ChatMessage) -> bool {
        let mut conversations = self.lock();
        let log = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationLog::new);

        if log.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        if message.is_in_flight() && log.has_in_flight() {
            return false;
        }

        log.messages.push(message);
        log.touch();
        true
    }

    /// Merges `patch` into the last message. No-op on an empty conversation.
    pub fn patch_last(&self, conversation_id: &str, patch: &MessagePatch) -> bool {
        let mut conversations = self.lock();
        let Some(log) = conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(last) = log.messages.last_mut() else {
            return false;
        };

        patch.apply_to(last);
        log.touch();
        true
    }

    /// Like [`patch_last`](Self::patch_last) but only while the last message
    /// is still `message_id`. A stream uses this so that a user deleting its
    /// placeholder never redirects the remaining deltas onto another message.
    pub fn patch_last_matching(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: &MessagePatch,
    ) -> bool {
        let mut conversations = self.lock();
        let Some(log) = conversations.get_mut(conversation_id) else {
            return false;
        };
        match log.messages.last_mut() {
            Some(last) if last.id == message_id => {
                patch.apply_to(last);
                log.touch();
                true
            }
            _ => false,
        }
    }

    /// Removes exactly one message
    pub fn delete(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut conversations = self.lock();
        let Some(log) = conversations.get_mut(conversation_id) else {
            return false;
        };
        let before = log.messages.len();
        log.messages.retain(|m| m.id != message_id);
        let removed = log.messages.len() != before;
        if removed {
            log.touch();
        }
        removed
    }

    pub fn clear(&self, conversation_id: &str) {
        self.lock().remove(conversation_id);
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn clear_all_except(&self, conversation_id: &str) {
        self.lock().retain(|id, _| id == conversation_id);
    }

    /// Replaces the whole log, e.g. when a conversation is opened from
    /// history. Applying the same replacement twice is a no-op.
    ///
    /// An assistant message still in flight survives as the new tail so its
    /// stream keeps patching it and the conversation stays locked.
    pub fn replace(
        &self,
        conversation_id: &str,
        title: Option<String>,
        mut messages: Vec<ChatMessage>,
    ) {
        let mut conversations = self.lock();
        let log = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationLog::new);
        if let Some(title) = title {
            log.title = title;
        }

        if let Some(live) = log.messages.iter().rev().find(|m| m.is_in_flight()).cloned() {
            messages.retain(|m| m.id != live.id && !m.is_in_flight());
            tracing::debug!(%conversation_id, message_id = %live.id, "kept in-flight message across replace");
            messages.push(live);
        }
        log.messages = messages;
        log.touch();
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) -> bool {
        let mut conversations = self.lock();
        match conversations.get_mut(conversation_id) {
            Some(log) => {
                log.title = title.to_string();
                log.touch();
                true
            }
            None => false,
        }
    }

    pub fn has_in_flight(&self, conversation_id: &str) -> bool {
        self.lock()
            .get(conversation_id)
            .map(|log| log.has_in_flight())
            .unwrap_or(false)
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.lock().contains_key(conversation_id)
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock()
            .get(conversation_id)
            .map(|log| log.snapshot(conversation_id))
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .get(conversation_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn last_message(&self, conversation_id: &str) -> Option<ChatMessage> {
        self.lock()
            .get(conversation_id)
            .and_then(|log| log.messages.last().cloned())
    }

    pub fn title(&self, conversation_id: &str) -> Option<String> {
        self.lock().get(conversation_id).map(|log| log.title.clone())
    }

    /// Conversation ids, most recently updated first
    pub fn ids(&self) -> Vec<String> {
        let conversations = self.lock();
        let mut ids: Vec<_> = conversations
            .iter()
            .map(|(id, log)| (id.clone(), log.updated_at))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        ids.into_iter().map(|(id, _)| id).collect()
    }
}
