use super::types::{ConversationId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Session -> conversation membership
///
/// Tracks every conversation created under a session, whether or not it is
/// currently resident in the cache. A conversation belongs to exactly one
/// session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<SessionId, BTreeSet<ConversationId>>")]
#[serde(into = "BTreeMap<SessionId, BTreeSet<ConversationId>>")]
pub struct SessionIndex {
    by_session: BTreeMap<SessionId, BTreeSet<ConversationId>>,
    owner: HashMap<ConversationId, SessionId>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the conversation was already registered. A
    /// conversation keeps its first session.
    pub fn insert(&mut self, session: SessionId, conversation: ConversationId) -> bool {
        if self.owner.contains_key(&conversation) {
            return false;
        }
        self.by_session
            .entry(session.clone())
            .or_default()
            .insert(conversation.clone());
        self.owner.insert(conversation, session);
        true
    }

    pub fn remove(&mut self, conversation: &ConversationId) -> Option<SessionId> {
        let session = self.owner.remove(conversation)?;
        if let Some(members) = self.by_session.get_mut(&session) {
            members.remove(conversation);
            if members.is_empty() {
                self.by_session.remove(&session);
            }
        }
        Some(session)
    }

    pub fn list(&self, session: &SessionId) -> BTreeSet<ConversationId> {
        self.by_session.get(session).cloned().unwrap_or_default()
    }

    pub fn session_of(&self, conversation: &ConversationId) -> Option<&SessionId> {
        self.owner.get(conversation)
    }

    pub fn contains(&self, conversation: &ConversationId) -> bool {
        self.owner.contains_key(conversation)
    }

    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.owner.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.by_session.keys()
    }
}

impl From<BTreeMap<SessionId, BTreeSet<ConversationId>>> for SessionIndex {
    fn from(map: BTreeMap<SessionId, BTreeSet<ConversationId>>) -> Self {
        let mut index = SessionIndex::new();
        for (session, members) in map {
            for conversation in members {
                index.insert(session.clone(), conversation);
            }
        }
        index
    }
}

impl From<SessionIndex> for BTreeMap<SessionId, BTreeSet<ConversationId>> {
    fn from(index: SessionIndex) -> Self {
        index.by_session
    }
}
