//! LRU Conversation Manager
//!
//! Information Hiding:
//! - Recency order, residency and eviction hidden behind get/append/read/delete
//! - Durable store reached only through the `ConversationStore` trait
//! - Callers never see whether a conversation came from memory or disk
//!
//! Locking:
//! - One structural lock guards the resident set, recency order, the session
//!   index and counters. It is held only for in-memory work.
//! - Each resident conversation has its own lock; appends to different
//!   conversations never contend on it.
//! - Order is structural -> record. A record lock never takes the structural
//!   lock, and no lock is held across an `.await`.
//! - Async gates serialize store traffic per id: one load-or-delete gate,
//!   and one write gate per resident record.

use crate::config::CacheConfig;
use crate::core::{
    ConversationError, ConversationId, ConversationRecord, ConversationResult, SessionId,
    SessionIndex, StoreError, Turn,
};
use crate::storage::ConversationStore;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A resident conversation plus eviction bookkeeping
struct LiveConversation {
    record: ConversationRecord,
    /// Bumped on every mutation so a finished write can tell whether it
    /// captured the latest state
    version: u64,
    /// Consecutive failed writes
    persist_failures: u32,
    /// No longer in the resident set; holders must re-acquire before mutating
    detached: bool,
    /// Deleted while a write may still be in flight
    deleted: bool,
    /// Started empty because the store could not be read. The stored copy
    /// is merged back in before anything is written over it.
    shadowed: bool,
    /// Held for the whole of a write, so writes of one record land in the
    /// order their snapshots were taken
    write_gate: Arc<AsyncMutex<()>>,
}

impl LiveConversation {
    fn new(record: ConversationRecord, shadowed: bool) -> Self {
        Self {
            record,
            version: 0,
            persist_failures: 0,
            detached: false,
            deleted: false,
            shadowed,
            write_gate: Arc::new(AsyncMutex::new(())),
        }
    }
}

type Handle = Arc<Mutex<LiveConversation>>;

/// Held by the single caller allowed to load a given id from the store
type LoadGate = Arc<AsyncMutex<()>>;

struct Slot {
    handle: Handle,
    /// Logical clock value of the last access
    touched: u64,
}

struct CacheState {
    /// Unbounded: capacity is enforced by `enforce_capacity`, which must be
    /// able to keep records whose write failed
    live: LruCache<ConversationId, Slot>,
    sessions: SessionIndex,
    /// Victims currently being written by some caller
    evicting: HashSet<ConversationId>,
    /// One in-flight store load per id; a second concurrent load could
    /// insert data older than what the first caller appended and evicted
    loading: HashMap<ConversationId, LoadGate>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn gate(&mut self, id: &ConversationId) -> LoadGate {
        Arc::clone(
            self.loading
                .entry(id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// A gate is stale once its holder finished and removed it
    fn is_current_gate(&self, id: &ConversationId, gate: &LoadGate) -> bool {
        self.loading
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, gate))
    }

    fn release_gate(&mut self, id: &ConversationId, gate: &LoadGate) {
        if self.is_current_gate(id, gate) {
            self.loading.remove(id);
        }
    }

    /// Look up a resident conversation and mark it most recently used
    fn touch(&mut self, id: &ConversationId) -> Option<Handle> {
        self.clock += 1;
        let clock = self.clock;
        let slot = self.live.get_mut(id)?;
        slot.touched = clock;
        Some(Arc::clone(&slot.handle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    /// Create an empty conversation when none exists anywhere
    Create,
    /// Report absence to the caller
    Existing,
}

/// Where a newly resident record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Stored,
    Created,
    /// Store read failed; started empty
    Shadowed,
}

enum WriteBack {
    /// Nothing to write: already clean, or no longer resident
    Skipped { detached: bool },
    Saved { deleted: bool },
    Failed { attempts: u32, error: StoreError },
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub live: usize,
    pub capacity: usize,
    pub dirty: usize,
    pub evicting: usize,
    pub sessions: usize,
    pub conversations: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded in-memory store of conversations backed by a durable store.
///
/// Construct one per process and share it (`Arc<ConversationManager>`)
/// between request handlers.
pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ConversationManager {
    /// Create a manager, seeding session membership from the store
    pub async fn open(
        store: Arc<dyn ConversationStore>,
        config: CacheConfig,
    ) -> ConversationResult<Self> {
        let sessions = store.session_index().await?;

        tracing::info!(
            capacity = config.capacity,
            strict = config.strict,
            known_conversations = sessions.conversation_count(),
            "Conversation manager ready"
        );

        Ok(Self {
            store,
            state: Mutex::new(CacheState {
                live: LruCache::unbounded(),
                sessions,
                evicting: HashSet::new(),
                loading: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the conversation, loading or creating it as needed.
    /// A missing id starts a new conversation with a generated id.
    pub async fn get_or_create(
        &self,
        id: Option<ConversationId>,
        session: Option<SessionId>,
    ) -> ConversationResult<ConversationRecord> {
        let id = id.unwrap_or_else(ConversationId::generate);
        let handle = self
            .acquire(&id, session.as_ref(), Presence::Create)
            .await?
            .ok_or_else(|| ConversationError::NotFound(id.clone()))?;

        let record = {
            let mut live = handle.lock();
            live.record.touch();
            live.record.clone()
        };

        self.enforce_capacity().await?;
        Ok(record)
    }

    /// Append a turn, creating the conversation in the global session if
    /// needed (strict mode: `NotFound` instead).
    ///
    /// If this call also had to evict a record whose writes keep failing,
    /// `StorageUnavailable` is returned after the turn has been applied.
    pub async fn append_turn(&self, id: &ConversationId, turn: Turn) -> ConversationResult<()> {
        self.append_turn_in_session(id, None, turn).await
    }

    /// Like `append_turn`; `session` is only used if the conversation is new
    pub async fn append_turn_in_session(
        &self,
        id: &ConversationId,
        session: Option<&SessionId>,
        turn: Turn,
    ) -> ConversationResult<()> {
        self.mutate(id, session, |record| record.push_turn(turn.clone()))
            .await
    }

    /// Attach a user interaction event to the conversation
    pub async fn record_event(
        &self,
        id: &ConversationId,
        kind: &str,
        data: Value,
    ) -> ConversationResult<()> {
        self.mutate(id, None, |record| record.push_event(kind, data.clone()))
            .await
    }

    /// Attach the model and settings used for a response
    pub async fn record_metadata(
        &self,
        id: &ConversationId,
        model: &str,
        settings: Value,
    ) -> ConversationResult<()> {
        self.mutate(id, None, |record| {
            record.push_model_usage(model, settings.clone())
        })
        .await
    }

    /// Most recent `limit` turns (all when `None`), oldest first.
    /// Unknown conversations read as empty and are not created.
    pub async fn read_history(
        &self,
        id: &ConversationId,
        limit: Option<usize>,
    ) -> ConversationResult<Vec<Turn>> {
        let Some(handle) = self.acquire(id, None, Presence::Existing).await? else {
            if self.config.strict {
                return Err(ConversationError::NotFound(id.clone()));
            }
            return Ok(Vec::new());
        };

        let turns = {
            let mut live = handle.lock();
            live.record.touch();
            live.record.tail(limit).to_vec()
        };

        self.enforce_capacity().await?;
        Ok(turns)
    }

    /// Remove a conversation from memory, the store and its session.
    /// Deleting an unknown conversation is not an error.
    pub async fn delete_conversation(&self, id: &ConversationId) -> ConversationResult<()> {
        id.validate()?;

        // Holding the load gate keeps an in-flight load from putting the
        // record back after it is removed below
        let (gate, _permit) = self.enter_gate(id).await;

        let known = {
            let mut state = self.state.lock();
            let removed = state.live.pop(id);
            if let Some(slot) = &removed {
                let mut live = slot.handle.lock();
                live.detached = true;
                live.deleted = true;
            }
            let session = state.sessions.remove(id);
            removed.is_some() || session.is_some()
        };

        let result = self.store.delete(id).await;
        self.state.lock().release_gate(id, &gate);
        result?;

        tracing::info!(conversation_id = %id, known, "Deleted conversation");
        Ok(())
    }

    /// Conversations created under a session, resident or not
    pub fn list_conversations(&self, session: &SessionId) -> BTreeSet<ConversationId> {
        self.state.lock().sessions.list(session)
    }

    /// Whether the conversation is currently held in memory
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.state.lock().live.contains(id)
    }

    /// Persist every dirty resident conversation without evicting it.
    /// Returns the number of records written.
    pub async fn flush(&self) -> ConversationResult<usize> {
        let pending: Vec<(ConversationId, Handle)> = {
            let state = self.state.lock();
            state
                .live
                .iter()
                .filter(|(_, slot)| slot.handle.lock().record.dirty)
                .map(|(id, slot)| (id.clone(), Arc::clone(&slot.handle)))
                .collect()
        };

        let outcomes = join_all(pending.iter().map(|(_, handle)| self.write_back(handle))).await;

        let mut persisted = 0;
        let mut failed = 0;
        let mut purge = Vec::new();

        for ((id, _), outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                WriteBack::Saved { deleted } => {
                    persisted += 1;
                    if deleted {
                        purge.push(id);
                    }
                }
                WriteBack::Skipped { .. } => {}
                WriteBack::Failed { attempts, error } => {
                    failed += 1;
                    tracing::warn!(conversation_id = %id, attempts, error = %error, "Failed to flush conversation");
                }
            }
        }

        for id in purge {
            self.purge_deleted(&id).await;
        }

        tracing::info!(persisted, failed, "Flushed dirty conversations");

        if failed > 0 {
            Err(ConversationError::FlushIncomplete { failed })
        } else {
            Ok(persisted)
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let dirty = state
            .live
            .iter()
            .filter(|(_, slot)| slot.handle.lock().record.dirty)
            .count();

        CacheStats {
            live: state.live.len(),
            capacity: self.config.capacity,
            dirty,
            evicting: state.evicting.len(),
            sessions: state.sessions.session_count(),
            conversations: state.sessions.conversation_count(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Apply `f` to the live record, then enforce capacity
    async fn mutate<F>(
        &self,
        id: &ConversationId,
        session: Option<&SessionId>,
        f: F,
    ) -> ConversationResult<()>
    where
        F: Fn(&mut ConversationRecord),
    {
        let presence = if self.config.strict {
            Presence::Existing
        } else {
            Presence::Create
        };

        loop {
            let handle = self
                .acquire(id, session, presence)
                .await?
                .ok_or_else(|| ConversationError::NotFound(id.clone()))?;

            {
                let mut live = handle.lock();
                // Evicted or deleted between acquire and lock; go again
                if live.detached {
                    tracing::debug!(conversation_id = %id, "Conversation left the cache before mutation; retrying");
                    continue;
                }
                f(&mut live.record);
                live.version += 1;
            }

            return self.enforce_capacity().await;
        }
    }

    /// Find the resident record or bring it in from the store.
    ///
    /// Does not enforce capacity; callers do that once their own work on the
    /// record is done so the fresh record is not the one evicted.
    async fn acquire(
        &self,
        id: &ConversationId,
        session: Option<&SessionId>,
        presence: Presence,
    ) -> ConversationResult<Option<Handle>> {
        id.validate()?;
        if let Some(session) = session {
            session.validate()?;
        }

        let (gate, _permit) = match self.enter_load(id).await {
            Ok(gate) => gate,
            Err(handle) => return Ok(Some(handle)),
        };

        let (mut record, origin) = match self.store.load(id).await {
            Ok(record) => {
                tracing::debug!(conversation_id = %id, turns = record.len(), "Rehydrated conversation");
                (record, Origin::Stored)
            }
            Err(StoreError::NotFound(_)) => {
                let indexed = self.state.lock().sessions.contains(id);
                if indexed {
                    tracing::warn!(
                        conversation_id = %id,
                        "Conversation is indexed but was never stored; starting it empty"
                    );
                } else if presence == Presence::Existing {
                    self.state.lock().release_gate(id, &gate);
                    return Ok(None);
                }
                (ConversationRecord::new(id.clone(), SessionId::global()), Origin::Created)
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(
                    conversation_id = %id,
                    error = %e,
                    "Could not read conversation from store; continuing with empty history"
                );
                (ConversationRecord::new(id.clone(), SessionId::global()), Origin::Shadowed)
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %id,
                    error = %e,
                    "Stored conversation is unusable; continuing with empty history"
                );
                (ConversationRecord::new(id.clone(), SessionId::global()), Origin::Created)
            }
        };
        let fresh = origin != Origin::Stored;

        let (handle, registered) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.release_gate(id, &gate);

            if fresh {
                record.session_id = state
                    .sessions
                    .session_of(id)
                    .cloned()
                    .or_else(|| session.cloned())
                    .unwrap_or_default();
                // Never stored: evicting it must write it out
                record.dirty = true;
            }
            record.touch();

            let registered = record.session_id.clone();
            state.sessions.insert(registered.clone(), id.clone());

            let handle = Arc::new(Mutex::new(LiveConversation::new(
                record,
                origin == Origin::Shadowed,
            )));
            state.clock += 1;
            let touched = state.clock;
            state.live.push(
                id.clone(),
                Slot {
                    handle: Arc::clone(&handle),
                    touched,
                },
            );
            (handle, registered)
        };

        if fresh {
            if origin == Origin::Created {
                tracing::info!(conversation_id = %id, session_id = %registered, "Created conversation");
            }
            if let Err(e) = self.store.register(&registered, id).await {
                tracing::warn!(
                    conversation_id = %id,
                    session_id = %registered,
                    error = %e,
                    "Failed to persist session membership"
                );
            }
        }

        Ok(Some(handle))
    }

    /// Resolve a hit, or become the only caller loading `id`.
    ///
    /// `Err` carries the resident handle; `Ok` carries the gate and its
    /// permit, which the caller must release once the record is resident
    /// (or known to be absent).
    async fn enter_load(
        &self,
        id: &ConversationId,
    ) -> Result<(LoadGate, OwnedMutexGuard<()>), Handle> {
        let mut counted = false;

        loop {
            let gate = {
                let mut state = self.state.lock();
                if let Some(handle) = state.touch(id) {
                    state.hits += 1;
                    tracing::debug!(conversation_id = %id, "Cache hit");
                    return Err(handle);
                }
                if !counted {
                    state.misses += 1;
                    counted = true;
                }
                state.gate(id)
            };

            let permit = Arc::clone(&gate).lock_owned().await;

            let mut state = self.state.lock();
            if let Some(handle) = state.touch(id) {
                return Err(handle);
            }
            if state.is_current_gate(id, &gate) {
                return Ok((gate, permit));
            }
        }
    }

    /// Become the only caller loading or deleting `id`, resident or not
    async fn enter_gate(&self, id: &ConversationId) -> (LoadGate, OwnedMutexGuard<()>) {
        loop {
            let gate = self.state.lock().gate(id);
            let permit = Arc::clone(&gate).lock_owned().await;
            if self.state.lock().is_current_gate(id, &gate) {
                return (gate, permit);
            }
        }
    }

    /// Evict least recently used records until the resident set fits.
    ///
    /// Dirty victims are written through `write_back` with no structural lock
    /// held; a victim leaves the cache only once its write succeeded and it
    /// was neither used nor changed in the meantime. Victims whose write
    /// fails stay resident and are retried by later calls.
    async fn enforce_capacity(&self) -> ConversationResult<()> {
        let mut skipped: HashSet<ConversationId> = HashSet::new();
        let mut exhausted: Option<ConversationError> = None;

        loop {
            let (id, handle, touched) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;

                if state.live.len() <= self.config.capacity {
                    break;
                }

                let candidate = state
                    .live
                    .iter()
                    .rev()
                    .find(|(id, _)| !state.evicting.contains(*id) && !skipped.contains(*id))
                    .map(|(id, slot)| (id.clone(), Arc::clone(&slot.handle), slot.touched));

                let Some((id, handle, touched)) = candidate else {
                    if !skipped.is_empty() {
                        tracing::warn!(
                            live = state.live.len(),
                            capacity = self.config.capacity,
                            unpersisted = skipped.len(),
                            "Cache over capacity; unpersisted conversations kept in memory"
                        );
                    }
                    break;
                };

                // A clean record has no write in flight: writes only start
                // for dirty records and clear the flag when they finish
                let mut live = handle.lock();
                if !live.record.dirty {
                    live.detached = true;
                    drop(live);
                    state.live.pop(&id);
                    state.evictions += 1;
                    tracing::debug!(conversation_id = %id, "Evicted clean conversation");
                    continue;
                }
                drop(live);

                state.evicting.insert(id.clone());
                (id, handle, touched)
            };

            let outcome = self.write_back(&handle).await;
            let mut purge = false;

            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                state.evicting.remove(&id);

                match outcome {
                    WriteBack::Saved { deleted: true } => purge = true,
                    WriteBack::Saved { deleted: false } | WriteBack::Skipped { detached: false } => {
                        let mut live = handle.lock();
                        let unchanged = !live.record.dirty
                            && state.live.peek(&id).is_some_and(|slot| {
                                Arc::ptr_eq(&slot.handle, &handle) && slot.touched == touched
                            });

                        if unchanged {
                            live.detached = true;
                            drop(live);
                            state.live.pop(&id);
                            state.evictions += 1;
                            tracing::debug!(conversation_id = %id, "Evicted conversation after persisting");
                        } else {
                            tracing::debug!(conversation_id = %id, "Conversation used during eviction; keeping it resident");
                        }
                    }
                    WriteBack::Skipped { detached: true } => {}
                    WriteBack::Failed { attempts, error } => {
                        tracing::warn!(
                            conversation_id = %id,
                            attempts,
                            error = %error,
                            "Failed to persist conversation on eviction; keeping it in memory"
                        );
                        skipped.insert(id.clone());

                        if attempts >= self.config.max_persist_failures && exhausted.is_none() {
                            exhausted = Some(ConversationError::StorageUnavailable {
                                id: id.clone(),
                                attempts,
                                source: error,
                            });
                        }
                    }
                }
            }

            if purge {
                self.purge_deleted(&id).await;
            }
        }

        match exhausted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write the record's current state to the store.
    ///
    /// Writes of one record are serialized by its write gate and each takes
    /// its snapshot only once it holds the gate, so an older snapshot can
    /// never land after a newer one.
    async fn write_back(&self, handle: &Handle) -> WriteBack {
        let gate = Arc::clone(&handle.lock().write_gate);
        let _permit = gate.lock().await;

        let (id, shadowed) = {
            let live = handle.lock();
            if live.detached {
                return WriteBack::Skipped { detached: true };
            }
            if !live.record.dirty {
                return WriteBack::Skipped { detached: false };
            }
            (live.record.id.clone(), live.shadowed)
        };

        if shadowed {
            if let Err(error) = self.merge_persisted(&id, handle).await {
                return Self::write_failed(handle, error);
            }
        }

        let (snapshot, version) = {
            let live = handle.lock();
            (live.record.clone(), live.version)
        };

        match self.store.save(&snapshot).await {
            Ok(()) => {
                let mut live = handle.lock();
                live.persist_failures = 0;
                if live.version == version {
                    live.record.dirty = false;
                }
                WriteBack::Saved {
                    deleted: live.deleted,
                }
            }
            Err(error) => Self::write_failed(handle, error),
        }
    }

    fn write_failed(handle: &Handle, error: StoreError) -> WriteBack {
        let mut live = handle.lock();
        live.persist_failures += 1;
        WriteBack::Failed {
            attempts: live.persist_failures,
            error,
        }
    }

    /// Put back the stored history a shadowed record could not read at load
    async fn merge_persisted(&self, id: &ConversationId, handle: &Handle) -> Result<(), StoreError> {
        match self.store.load(id).await {
            Ok(persisted) => {
                let mut live = handle.lock();
                live.record.prepend_persisted(persisted);
                live.version += 1;
                live.shadowed = false;
                tracing::info!(
                    conversation_id = %id,
                    turns = live.record.len(),
                    "Recovered stored history for conversation"
                );
                Ok(())
            }
            // Nothing readable to lose; corrupt bytes are already kept aside
            Err(StoreError::NotFound(_)) | Err(StoreError::Corrupt { .. }) => {
                handle.lock().shadowed = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// A write raced with a delete and may have resurrected the file
    async fn purge_deleted(&self, id: &ConversationId) {
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!(conversation_id = %id, error = %e, "Failed to remove deleted conversation from store");
        }
    }
}
