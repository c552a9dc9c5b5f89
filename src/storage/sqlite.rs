//! SQLite Conversation Storage
//!
//! Information Hiding:
//! - Schema and SQL hidden behind the store trait
//! - Blocking rusqlite calls run on the blocking pool, never on the runtime
//! - Undecodable rows are moved to a quarantine table instead of being lost

use super::ConversationStore;
use crate::core::{
    ConversationId, ConversationRecord, SessionId, SessionIndex, StoreError, StoreResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

const DB_FILE: &str = "conversations.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS session_members (
        conversation_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_session_members_session
        ON session_members(session_id);
    CREATE TABLE IF NOT EXISTS quarantine (
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        reason TEXT NOT NULL,
        quarantined_at TEXT NOT NULL
    );
";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) `conversations.sqlite` inside `dir`
    pub async fn open(dir: PathBuf) -> StoreResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let db_path = dir.join(DB_FILE);

        let conn = tokio::task::spawn_blocking(move || -> StoreResult<Connection> {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord> {
        id.validate()?;
        let id = id.clone();

        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM conversations WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(body) = body else {
                return Err(StoreError::NotFound(id));
            };

            match serde_json::from_str::<ConversationRecord>(&body) {
                Ok(record) => {
                    tracing::debug!(
                        "[SqliteStore] Loaded {} turns for conversation '{}'",
                        record.len(),
                        id
                    );
                    Ok(record)
                }
                Err(e) => {
                    let tx = conn.transaction()?;
                    tx.execute(
                        "INSERT INTO quarantine (id, body, reason, quarantined_at) VALUES (?1, ?2, ?3, ?4)",
                        params![id.as_str(), body, e.to_string(), chrono::Utc::now().to_rfc3339()],
                    )?;
                    tx.execute("DELETE FROM conversations WHERE id = ?1", params![id.as_str()])?;
                    tx.commit()?;
                    Err(StoreError::Corrupt {
                        id,
                        reason: format!("{} (row moved to quarantine)", e),
                    })
                }
            }
        })
        .await
    }

    async fn save(&self, record: &ConversationRecord) -> StoreResult<()> {
        record.id.validate()?;
        let body = serde_json::to_string(record)?;
        let id = record.id.clone();
        let session = record.session_id.clone();
        let turns = record.len();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, session_id, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    session_id = excluded.session_id,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![id.as_str(), session.as_str(), body, chrono::Utc::now().to_rfc3339()],
            )?;
            tracing::debug!("[SqliteStore] Saved {} turns for conversation '{}'", turns, id);
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        id.validate()?;
        let id = id.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id.as_str()])?;
            tx.execute(
                "DELETE FROM session_members WHERE conversation_id = ?1",
                params![id.as_str()],
            )?;
            tx.commit()?;
            tracing::debug!("[SqliteStore] Deleted conversation '{}'", id);
            Ok(())
        })
        .await
    }

    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()> {
        id.validate()?;
        let id = id.clone();
        let session = session.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO session_members (conversation_id, session_id) VALUES (?1, ?2)",
                params![id.as_str(), session.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>> {
        let session = session.clone();

        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT conversation_id FROM session_members WHERE session_id = ?1")?;
            let ids = stmt
                .query_map(params![session.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(ConversationId::from).collect())
        })
        .await
    }

    async fn session_index(&self) -> StoreResult<SessionIndex> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT session_id, conversation_id FROM session_members")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut index = SessionIndex::new();
            for (session, conversation) in rows {
                index.insert(session.into(), conversation.into());
            }
            Ok(index)
        })
        .await
    }

    async fn exists(&self, id: &ConversationId) -> StoreResult<bool> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}
