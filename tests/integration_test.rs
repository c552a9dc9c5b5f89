//! Integration tests for the conversation manager
//!
//! These drive the manager end to end against real stores, no network needed

use async_trait::async_trait;
use chatkeep::core::{SessionIndex, StoreResult};
use chatkeep::storage::{self, FileSystemStore, InMemoryStore};
use chatkeep::{
    CacheConfig, ConversationError, ConversationId, ConversationManager, ConversationRecord,
    ConversationStore, SessionId, StorageBackend, StorageConfig, StoreError, Turn,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

fn config(capacity: usize) -> CacheConfig {
    CacheConfig {
        capacity,
        strict: false,
        max_persist_failures: 3,
    }
}

async fn memory_manager(capacity: usize) -> (ConversationManager, InMemoryStore) {
    let store = InMemoryStore::new();
    let manager = ConversationManager::open(Arc::new(store.clone()), config(capacity))
        .await
        .unwrap();
    (manager, store)
}

fn strict_config(capacity: usize) -> CacheConfig {
    CacheConfig {
        strict: true,
        ..config(capacity)
    }
}

fn ids(names: &[&str]) -> BTreeSet<ConversationId> {
    names.iter().map(|n| ConversationId::new(*n)).collect()
}

/// Store wrapper that can be told to fail every save, or the next few loads
struct FlakyStore {
    inner: InMemoryStore,
    fail_saves: AtomicBool,
    fail_loads: AtomicUsize,
    saves: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_saves: AtomicBool::new(false),
            fail_loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord> {
        if self
            .fail_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        self.inner.load(id).await
    }

    async fn save(&self, record: &ConversationRecord) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(record).await
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()> {
        self.inner.register(session, id).await
    }

    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>> {
        self.inner.list_by_session(session).await
    }

    async fn session_index(&self) -> StoreResult<SessionIndex> {
        self.inner.session_index().await
    }
}

/// Store wrapper that stalls chosen loads and saves, so a test can act
/// while that store call is in flight
struct SlowStore {
    inner: InMemoryStore,
    /// Stall saves of this conversation while it holds this many turns
    slow_save: Option<(ConversationId, usize)>,
    slow_load: Option<ConversationId>,
    delay: Duration,
    /// Signalled when a stalled call starts
    stalled: Notify,
}

impl SlowStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            slow_save: None,
            slow_load: None,
            delay: Duration::from_millis(300),
            stalled: Notify::new(),
        }
    }

    fn stall_saves(mut self, id: &ConversationId, turns: usize) -> Self {
        self.slow_save = Some((id.clone(), turns));
        self
    }

    fn stall_loads(mut self, id: &ConversationId) -> Self {
        self.slow_load = Some(id.clone());
        self
    }
}

#[async_trait]
impl ConversationStore for SlowStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord> {
        if self.slow_load.as_ref() == Some(id) {
            self.stalled.notify_one();
            tokio::time::sleep(self.delay).await;
        }
        self.inner.load(id).await
    }

    async fn save(&self, record: &ConversationRecord) -> StoreResult<()> {
        if let Some((id, turns)) = &self.slow_save {
            if *id == record.id && *turns == record.len() {
                self.stalled.notify_one();
                tokio::time::sleep(self.delay).await;
            }
        }
        self.inner.save(record).await
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()> {
        self.inner.register(session, id).await
    }

    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>> {
        self.inner.list_by_session(session).await
    }

    async fn session_index(&self) -> StoreResult<SessionIndex> {
        self.inner.session_index().await
    }
}

fn texts(turns: &[Turn]) -> Vec<&str> {
    turns.iter().map(|t| t.content.as_str()).collect()
}

async fn seed(store: &InMemoryStore, id: &ConversationId, text: &str) {
    let mut record = ConversationRecord::new(id.clone(), SessionId::global());
    record.push_turn(Turn::user(text));
    store.register(&SessionId::global(), id).await.unwrap();
    store.save(&record).await.unwrap();
}

#[tokio::test]
async fn test_lru_eviction_with_capacity_two() {
    let (manager, _store) = memory_manager(2).await;
    let (a, b, c) = ("A".into(), "B".into(), "C".into());

    manager.append_turn(&a, Turn::user("a1")).await.unwrap();
    manager.append_turn(&b, Turn::user("b1")).await.unwrap();
    manager.append_turn(&c, Turn::user("c1")).await.unwrap();

    assert!(!manager.contains(&a));
    assert!(manager.contains(&b));
    assert!(manager.contains(&c));
    assert_eq!(manager.stats().live, 2);
    assert_eq!(
        manager.list_conversations(&SessionId::global()),
        ids(&["A", "B", "C"])
    );

    let record = manager.get_or_create(Some(a.clone()), None).await.unwrap();
    assert_eq!(record.len(), 1);
    assert_eq!(record.turns()[0].content, "a1");

    assert!(manager.contains(&a));
    assert!(!manager.contains(&b));
    assert!(manager.contains(&c));
    assert_eq!(manager.stats().evictions, 2);
}

#[tokio::test]
async fn test_history_survives_eviction_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemStore::new(temp_dir.path().to_path_buf()).await.unwrap();
    let manager = ConversationManager::open(Arc::new(store), config(1)).await.unwrap();
    let x = ConversationId::new("x");

    for i in 0..3 {
        manager
            .append_turn(&x, Turn::user(format!("question {}", i)))
            .await
            .unwrap();
        manager
            .append_turn(
                &x,
                Turn::assistant(format!("answer {}", i)).with_components(json!({"step": i})),
            )
            .await
            .unwrap();
    }
    let before = manager.read_history(&x, None).await.unwrap();

    manager
        .append_turn(&"y".into(), Turn::user("evict x"))
        .await
        .unwrap();
    assert!(!manager.contains(&x));

    let after = manager.read_history(&x, None).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after.len(), 6);
    assert_eq!(after.last().unwrap().content, "answer 2");
    assert_eq!(after.last().unwrap().components, Some(json!({"step": 2})));
}

#[tokio::test]
async fn test_appended_turn_is_last_after_reload() {
    let (manager, _store) = memory_manager(1).await;
    let c = ConversationId::new("c");

    manager.append_turn(&c, Turn::user("first")).await.unwrap();
    manager.append_turn(&"other".into(), Turn::user("o")).await.unwrap();
    manager.append_turn(&c, Turn::assistant("last")).await.unwrap();
    manager.append_turn(&"other".into(), Turn::user("o2")).await.unwrap();

    let history = manager.read_history(&c, None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().content, "last");
}

#[tokio::test]
async fn test_live_count_never_exceeds_capacity() {
    let (manager, _store) = memory_manager(3).await;

    for i in 0..40usize {
        let id = ConversationId::new(format!("conv-{}", (i * 7) % 11));
        if i % 3 == 0 {
            manager.get_or_create(Some(id), None).await.unwrap();
        } else {
            manager
                .append_turn(&id, Turn::user(format!("msg {}", i)))
                .await
                .unwrap();
        }
        assert!(manager.stats().live <= 3, "over capacity after call {}", i);
    }
}

#[tokio::test]
async fn test_read_history_limit_and_recency() {
    let (manager, _store) = memory_manager(2).await;
    let (a, b, c) = ("a".into(), "b".into(), "c".into());

    for i in 0..5 {
        manager
            .append_turn(&a, Turn::user(format!("m{}", i)))
            .await
            .unwrap();
    }
    manager.append_turn(&b, Turn::user("b")).await.unwrap();

    // Reading `a` makes `b` the least recently used
    let tail = manager.read_history(&a, Some(2)).await.unwrap();
    let texts: Vec<_> = tail.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(texts, vec!["m3", "m4"]);

    manager.append_turn(&c, Turn::user("c")).await.unwrap();
    assert!(manager.contains(&a));
    assert!(!manager.contains(&b));
}

#[tokio::test]
async fn test_read_history_of_unknown_conversation() {
    let (manager, _store) = memory_manager(2).await;
    let ghost = ConversationId::new("ghost");

    let history = manager.read_history(&ghost, None).await.unwrap();
    assert!(history.is_empty());
    assert!(!manager.contains(&ghost));
    assert!(manager.list_conversations(&SessionId::global()).is_empty());
}

#[tokio::test]
async fn test_delete_conversation() {
    let (manager, store) = memory_manager(2).await;
    let session = SessionId::new("s1");
    let a = ConversationId::new("a");

    manager
        .append_turn_in_session(&a, Some(&session), Turn::user("hello"))
        .await
        .unwrap();
    manager.flush().await.unwrap();
    assert!(store.exists(&a).await.unwrap());

    manager.delete_conversation(&a).await.unwrap();

    assert!(!manager.contains(&a));
    assert!(!store.exists(&a).await.unwrap());
    assert!(manager.list_conversations(&session).is_empty());
    assert!(store.list_by_session(&session).await.unwrap().is_empty());

    // Idempotent
    manager.delete_conversation(&a).await.unwrap();

    // A later reference starts from scratch
    assert!(manager.read_history(&a, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_evicted_conversation() {
    let (manager, store) = memory_manager(1).await;
    let a = ConversationId::new("a");

    manager.append_turn(&a, Turn::user("hello")).await.unwrap();
    manager.append_turn(&"b".into(), Turn::user("evicts a")).await.unwrap();
    assert!(store.exists(&a).await.unwrap());

    manager.delete_conversation(&a).await.unwrap();
    assert!(!store.exists(&a).await.unwrap());
    assert_eq!(
        manager.list_conversations(&SessionId::global()),
        ids(&["b"])
    );
}

#[tokio::test]
async fn test_strict_mode() {
    let store = InMemoryStore::new();
    let manager = ConversationManager::open(
        Arc::new(store),
        CacheConfig {
            capacity: 4,
            strict: true,
            max_persist_failures: 3,
        },
    )
    .await
    .unwrap();
    let id = ConversationId::new("strict");

    let err = manager.append_turn(&id, Turn::user("hi")).await.unwrap_err();
    assert!(matches!(err, ConversationError::NotFound(_)));
    let err = manager.read_history(&id, None).await.unwrap_err();
    assert!(matches!(err, ConversationError::NotFound(_)));

    manager.get_or_create(Some(id.clone()), None).await.unwrap();
    manager.append_turn(&id, Turn::user("hi")).await.unwrap();
    assert_eq!(manager.read_history(&id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_or_create_generates_id() {
    let (manager, _store) = memory_manager(2).await;
    let session = SessionId::new("browser-1");

    let record = manager
        .get_or_create(None, Some(session.clone()))
        .await
        .unwrap();

    assert!(record.id.validate().is_ok());
    assert!(record.is_empty());
    assert_eq!(record.session_id, session);
    assert!(manager.list_conversations(&session).contains(&record.id));
}

#[tokio::test]
async fn test_existing_conversation_keeps_its_session() {
    let (manager, _store) = memory_manager(2).await;
    let id = ConversationId::new("c");

    manager
        .append_turn_in_session(&id, Some(&"s1".into()), Turn::user("one"))
        .await
        .unwrap();
    manager
        .append_turn_in_session(&id, Some(&"s2".into()), Turn::user("two"))
        .await
        .unwrap();

    assert_eq!(manager.list_conversations(&"s1".into()), ids(&["c"]));
    assert!(manager.list_conversations(&"s2".into()).is_empty());
}

#[tokio::test]
async fn test_invalid_ids_rejected() {
    let (manager, _store) = memory_manager(2).await;

    let err = manager
        .append_turn(&"../../etc/passwd".into(), Turn::user("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::InvalidId(_)));

    let err = manager
        .get_or_create(Some("ok".into()), Some("bad session".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::InvalidId(_)));
}

#[tokio::test]
async fn test_events_and_metadata_are_persisted() {
    let (manager, _store) = memory_manager(1).await;
    let id = ConversationId::new("meta");

    manager.append_turn(&id, Turn::user("hello")).await.unwrap();
    manager
        .record_event(&id, "feedback", json!({"thumbs": "up"}))
        .await
        .unwrap();
    manager
        .record_metadata(&id, "claude-3-haiku", json!({"temperature": 0.3}))
        .await
        .unwrap();

    manager.append_turn(&"other".into(), Turn::user("evict")).await.unwrap();
    assert!(!manager.contains(&id));

    let record = manager.get_or_create(Some(id), None).await.unwrap();
    assert_eq!(record.events().len(), 1);
    assert_eq!(record.events()[0].kind, "feedback");
    assert_eq!(record.model_usage()[0].model, "claude-3-haiku");
    assert_eq!(record.model_usage()[0].settings, json!({"temperature": 0.3}));
}

#[tokio::test]
async fn test_flush_persists_without_evicting() {
    let (manager, store) = memory_manager(4).await;

    manager.append_turn(&"a".into(), Turn::user("1")).await.unwrap();
    manager.append_turn(&"b".into(), Turn::user("2")).await.unwrap();
    assert_eq!(manager.stats().dirty, 2);
    assert!(store.is_empty().await);

    assert_eq!(manager.flush().await.unwrap(), 2);

    let stats = manager.stats();
    assert_eq!(stats.dirty, 0);
    assert_eq!(stats.live, 2);
    assert_eq!(store.len().await, 2);

    // Nothing left to write
    assert_eq!(manager.flush().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_eviction_keeps_record_in_memory() {
    let store = Arc::new(FlakyStore::new());
    let manager = ConversationManager::open(
        store.clone(),
        CacheConfig {
            capacity: 1,
            strict: false,
            max_persist_failures: 2,
        },
    )
    .await
    .unwrap();
    let (a, b, c, d) = ("a".into(), "b".into(), "c".into(), "d".into());

    manager.append_turn(&a, Turn::user("a1")).await.unwrap();
    store.fail_saves.store(true, Ordering::SeqCst);

    // First failure is absorbed; capacity is exceeded instead of losing `a`
    manager.append_turn(&b, Turn::user("b1")).await.unwrap();
    assert!(manager.contains(&a));
    assert_eq!(manager.stats().live, 2);

    // Second failure for `a` reaches the threshold
    let err = manager.append_turn(&c, Turn::user("c1")).await.unwrap_err();
    match err {
        ConversationError::StorageUnavailable { id, attempts, source } => {
            assert_eq!(id, a);
            assert_eq!(attempts, 2);
            assert!(source.is_unavailable());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.stats().live, 3);

    // Storage recovers: the backlog drains on the next insertion
    store.fail_saves.store(false, Ordering::SeqCst);
    manager.append_turn(&d, Turn::user("d1")).await.unwrap();
    assert_eq!(manager.stats().live, 1);
    assert!(manager.contains(&d));

    for (id, text) in [(&a, "a1"), (&b, "b1"), (&c, "c1")] {
        let history = manager.read_history(id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, text);
    }
}

#[tokio::test]
async fn test_flush_reports_failures() {
    let store = Arc::new(FlakyStore::new());
    let manager = ConversationManager::open(store.clone(), config(4)).await.unwrap();

    manager.append_turn(&"a".into(), Turn::user("1")).await.unwrap();
    store.fail_saves.store(true, Ordering::SeqCst);

    let err = manager.flush().await.unwrap_err();
    assert!(matches!(err, ConversationError::FlushIncomplete { failed: 1 }));
    assert_eq!(manager.stats().dirty, 1);

    store.fail_saves.store(false, Ordering::SeqCst);
    assert_eq!(manager.flush().await.unwrap(), 1);
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_record_treated_as_empty() {
    let temp_dir = TempDir::new().unwrap();
    let conversations = temp_dir.path().join("conversations");
    std::fs::create_dir_all(&conversations).unwrap();
    std::fs::write(conversations.join("broken.json"), b"\x00\x01 not json").unwrap();

    let store = FileSystemStore::new(temp_dir.path().to_path_buf()).await.unwrap();
    let manager = ConversationManager::open(Arc::new(store), config(2)).await.unwrap();
    let id = ConversationId::new("broken");

    assert!(manager.read_history(&id, None).await.unwrap().is_empty());
    manager.append_turn(&id, Turn::user("fresh start")).await.unwrap();
    manager.flush().await.unwrap();

    let quarantined: Vec<_> = std::fs::read_dir(&conversations)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().contains("broken.json.corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(std::fs::read(&quarantined[0]).unwrap(), b"\x00\x01 not json");
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let storage_config = StorageConfig {
        backend: StorageBackend::Filesystem,
        path: temp_dir.path().to_path_buf(),
    };
    let session = SessionId::new("s1");

    {
        let store = storage::open(&storage_config).await.unwrap();
        let manager = ConversationManager::open(store, config(2)).await.unwrap();
        for name in ["a", "b"] {
            manager
                .append_turn_in_session(&name.into(), Some(&session), Turn::user(name))
                .await
                .unwrap();
        }
        manager.flush().await.unwrap();
    }

    let store = storage::open(&storage_config).await.unwrap();
    let manager = ConversationManager::open(store, config(2)).await.unwrap();

    assert_eq!(manager.list_conversations(&session), ids(&["a", "b"]));
    assert_eq!(manager.stats().live, 0);
    let history = manager.read_history(&"b".into(), None).await.unwrap();
    assert_eq!(history[0].content, "b");
}

#[tokio::test]
async fn test_sqlite_backend_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let store = storage::open(&StorageConfig {
        backend: StorageBackend::Sqlite,
        path: temp_dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    let manager = ConversationManager::open(store, config(2)).await.unwrap();
    let (a, b, c) = ("A".into(), "B".into(), "C".into());

    manager.append_turn(&a, Turn::user("a1")).await.unwrap();
    manager.append_turn(&b, Turn::user("b1")).await.unwrap();
    manager.append_turn(&c, Turn::user("c1")).await.unwrap();
    assert!(!manager.contains(&a));

    let record = manager.get_or_create(Some(a.clone()), None).await.unwrap();
    assert_eq!(record.turns()[0].content, "a1");
    assert!(!manager.contains(&b));
    assert_eq!(
        manager.list_conversations(&SessionId::global()),
        ids(&["A", "B", "C"])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_to_same_conversation() {
    let (manager, _store) = memory_manager(2).await;
    let manager = Arc::new(manager);
    let x = ConversationId::new("x");

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let x = x.clone();
            tokio::spawn(async move {
                manager
                    .append_turn(&x, Turn::user(format!("turn {}", i)))
                    .await
                    .unwrap();
                // Churn other conversations so `x` is evicted and reloaded
                manager
                    .append_turn(&format!("other-{}", i).into(), Turn::user("noise"))
                    .await
                    .unwrap();
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let history = manager.read_history(&x, None).await.unwrap();
    assert_eq!(history.len(), 50);

    let seen: BTreeSet<_> = history.iter().map(|t| t.content.clone()).collect();
    assert_eq!(seen.len(), 50);
    assert!(manager.stats().live <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_racing_appends_both_land() {
    let (manager, _store) = memory_manager(4).await;
    let manager = Arc::new(manager);
    let x = ConversationId::new("x");

    let (first, second) = tokio::join!(
        {
            let manager = Arc::clone(&manager);
            let x = x.clone();
            async move { manager.append_turn(&x, Turn::user("turn1")).await }
        },
        {
            let manager = Arc::clone(&manager);
            let x = x.clone();
            async move { manager.append_turn(&x, Turn::user("turn2")).await }
        }
    );
    first.unwrap();
    second.unwrap();

    let history = manager.read_history(&x, None).await.unwrap();
    let mut texts: Vec<_> = history.iter().map(|t| t.content.as_str()).collect();
    texts.sort();
    assert_eq!(texts, vec!["turn1", "turn2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_conversations_progress_independently() {
    let (manager, _store) = memory_manager(8).await;
    let manager = Arc::new(manager);

    let work = |name: &'static str| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let id = ConversationId::new(name);
            for i in 0..200 {
                manager
                    .append_turn(&id, Turn::user(format!("{} {}", name, i)))
                    .await
                    .unwrap();
            }
        })
    };

    let both = async {
        let (left, right) = tokio::join!(work("left"), work("right"));
        left.unwrap();
        right.unwrap();
    };
    tokio::time::timeout(Duration::from_secs(10), both)
        .await
        .expect("appends to different conversations stalled");

    assert_eq!(manager.read_history(&"left".into(), None).await.unwrap().len(), 200);
    assert_eq!(manager.read_history(&"right".into(), None).await.unwrap().len(), 200);
}

#[tokio::test]
async fn test_strict_created_conversation_survives_eviction() {
    let store = InMemoryStore::new();
    let manager = ConversationManager::open(Arc::new(store.clone()), strict_config(1))
        .await
        .unwrap();
    let (a, b) = (ConversationId::new("a"), ConversationId::new("b"));

    let created = manager.get_or_create(Some(a.clone()), None).await.unwrap();
    manager.get_or_create(Some(b), None).await.unwrap();
    assert!(!manager.contains(&a));
    assert!(store.exists(&a).await.unwrap());

    manager.append_turn(&a, Turn::user("hi")).await.unwrap();
    let record = manager.get_or_create(Some(a), None).await.unwrap();
    assert_eq!(texts(record.turns()), vec!["hi"]);
    assert_eq!(record.created_at, created.created_at);
}

#[tokio::test]
async fn test_indexed_conversation_missing_from_store_still_exists() {
    let store = InMemoryStore::new();
    let session = SessionId::new("s1");
    let ghost = ConversationId::new("ghost");
    store.register(&session, &ghost).await.unwrap();

    let manager = ConversationManager::open(Arc::new(store), strict_config(2))
        .await
        .unwrap();

    assert!(manager.read_history(&ghost, None).await.unwrap().is_empty());
    manager.append_turn(&ghost, Turn::user("hello")).await.unwrap();

    let record = manager.get_or_create(Some(ghost), None).await.unwrap();
    assert_eq!(record.session_id, session);
    assert_eq!(record.len(), 1);
}

#[tokio::test]
async fn test_unreadable_store_does_not_clobber_history() {
    let store = Arc::new(FlakyStore::new());
    let a = ConversationId::new("a");
    seed(&store.inner, &a, "old").await;
    let manager = ConversationManager::open(store.clone(), config(4)).await.unwrap();

    // Fails on the miss and again on the first write attempt
    store.fail_loads.store(2, Ordering::SeqCst);
    manager.append_turn(&a, Turn::user("new")).await.unwrap();
    assert_eq!(texts(&manager.read_history(&a, None).await.unwrap()), vec!["new"]);

    let err = manager.flush().await.unwrap_err();
    assert!(matches!(err, ConversationError::FlushIncomplete { failed: 1 }));
    let stored = store.inner.load(&a).await.unwrap();
    assert_eq!(texts(stored.turns()), vec!["old"]);

    assert_eq!(manager.flush().await.unwrap(), 1);
    let stored = store.inner.load(&a).await.unwrap();
    assert_eq!(texts(stored.turns()), vec!["old", "new"]);
    assert_eq!(
        texts(&manager.read_history(&a, None).await.unwrap()),
        vec!["old", "new"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_flushes_keep_newest_write() {
    let inner = InMemoryStore::new();
    let a = ConversationId::new("a");
    let store = Arc::new(SlowStore::new(inner.clone()).stall_saves(&a, 1));
    let manager = Arc::new(ConversationManager::open(store.clone(), config(1)).await.unwrap());

    manager.append_turn(&a, Turn::user("one")).await.unwrap();
    let slow_flush = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.flush().await }
    });
    store.stalled.notified().await;

    manager.append_turn(&a, Turn::user("two")).await.unwrap();
    manager.flush().await.unwrap();
    slow_flush.await.unwrap().unwrap();

    assert_eq!(inner.load(&a).await.unwrap().len(), 2);

    // Evicted as clean: the store must already hold both turns
    manager.append_turn(&"b".into(), Turn::user("evicts a")).await.unwrap();
    assert!(!manager.contains(&a));
    assert_eq!(
        texts(&manager.read_history(&a, None).await.unwrap()),
        vec!["one", "two"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_append_during_eviction_write_keeps_record() {
    let inner = InMemoryStore::new();
    let a = ConversationId::new("a");
    let b = ConversationId::new("b");
    let store = Arc::new(SlowStore::new(inner.clone()).stall_saves(&a, 1));
    let manager = Arc::new(ConversationManager::open(store.clone(), config(1)).await.unwrap());

    manager.append_turn(&a, Turn::user("one")).await.unwrap();
    let evicting = tokio::spawn({
        let manager = Arc::clone(&manager);
        let b = b.clone();
        async move { manager.append_turn(&b, Turn::user("b1")).await }
    });
    store.stalled.notified().await;

    manager.append_turn(&a, Turn::user("two")).await.unwrap();
    evicting.await.unwrap().unwrap();

    // `a` changed while its write was in flight, so `b` went instead
    assert!(manager.contains(&a));
    assert!(!manager.contains(&b));
    assert_eq!(manager.stats().live, 1);

    manager.flush().await.unwrap();
    assert_eq!(texts(inner.load(&a).await.unwrap().turns()), vec!["one", "two"]);
    assert_eq!(texts(&manager.read_history(&b, None).await.unwrap()), vec!["b1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_during_eviction_write_stays_deleted() {
    let inner = InMemoryStore::new();
    let a = ConversationId::new("a");
    let store = Arc::new(SlowStore::new(inner.clone()).stall_saves(&a, 1));
    let manager = Arc::new(ConversationManager::open(store.clone(), config(1)).await.unwrap());

    manager.append_turn(&a, Turn::user("one")).await.unwrap();
    let evicting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.append_turn(&"b".into(), Turn::user("b1")).await }
    });
    store.stalled.notified().await;

    manager.delete_conversation(&a).await.unwrap();
    evicting.await.unwrap().unwrap();

    // The late write must not resurrect it
    assert!(!manager.contains(&a));
    assert!(!inner.exists(&a).await.unwrap());
    assert_eq!(manager.list_conversations(&SessionId::global()), ids(&["b"]));
    assert_eq!(
        inner.list_by_session(&SessionId::global()).await.unwrap(),
        ids(&["b"])
    );
    assert!(manager.read_history(&a, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_waits_for_inflight_load() {
    let inner = InMemoryStore::new();
    let a = ConversationId::new("a");
    seed(&inner, &a, "old").await;
    let store = Arc::new(SlowStore::new(inner.clone()).stall_loads(&a));
    let manager = Arc::new(ConversationManager::open(store.clone(), config(4)).await.unwrap());

    let reader = tokio::spawn({
        let manager = Arc::clone(&manager);
        let a = a.clone();
        async move { manager.read_history(&a, None).await }
    });
    store.stalled.notified().await;

    manager.delete_conversation(&a).await.unwrap();

    // The read completed first and saw the old history
    let history = reader.await.unwrap().unwrap();
    assert_eq!(texts(&history), vec!["old"]);

    assert!(!manager.contains(&a));
    assert!(manager.list_conversations(&SessionId::global()).is_empty());
    assert!(!inner.exists(&a).await.unwrap());
}
