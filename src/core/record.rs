//! Conversation Record
//!
//! In-memory and persisted shape of one chat history. History logs are
//! append-only: there is no API to edit or remove an existing entry.

use super::types::{ConversationId, SessionId, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User interaction event attached to a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Model and settings used for a conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub model: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub session_id: SessionId,
    #[serde(default)]
    turns: Vec<Turn>,
    #[serde(default)]
    events: Vec<ConversationEvent>,
    #[serde(default)]
    model_usage: Vec<ModelUsage>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Set when the record changed since it was last persisted
    #[serde(skip)]
    pub dirty: bool,
}

impl ConversationRecord {
    pub fn new(id: ConversationId, session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            turns: Vec::new(),
            events: Vec::new(),
            model_usage: Vec::new(),
            created_at: now,
            last_accessed: now,
            dirty: false,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn events(&self) -> &[ConversationEvent] {
        &self.events
    }

    pub fn model_usage(&self) -> &[ModelUsage] {
        &self.model_usage
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.mark_dirty();
    }

    pub fn push_event(&mut self, kind: impl Into<String>, data: Value) {
        self.events.push(ConversationEvent {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            kind: kind.into(),
            data,
        });
        self.mark_dirty();
    }

    pub fn push_model_usage(&mut self, model: impl Into<String>, settings: Value) {
        self.model_usage.push(ModelUsage {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            model: model.into(),
            settings,
        });
        self.mark_dirty();
    }

    /// Most recent `limit` turns in chronological order, or all of them
    pub fn tail(&self, limit: Option<usize>) -> &[Turn] {
        match limit {
            Some(n) if n < self.turns.len() => &self.turns[self.turns.len() - n..],
            _ => &self.turns,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Put a persisted copy of this conversation in front of everything
    /// recorded here since. The persisted creation time wins.
    pub fn prepend_persisted(&mut self, mut earlier: ConversationRecord) {
        earlier.turns.append(&mut self.turns);
        earlier.events.append(&mut self.events);
        earlier.model_usage.append(&mut self.model_usage);

        self.turns = earlier.turns;
        self.events = earlier.events;
        self.model_usage = earlier.model_usage;
        self.created_at = self.created_at.min(earlier.created_at);
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.touch();
    }
}
