//! File System Conversation Storage
//!
//! Information Hiding:
//! - File paths and JSON serialization format hidden from users
//! - Directory structure management hidden behind interface
//! - Temp-file + rename keeps readers from ever seeing a partial write
//!
//! Layout:
//! - `{base_path}/conversations/{id}.json` one file per conversation
//! - `{base_path}/sessions.json` session membership index

use super::ConversationStore;
use crate::core::{
    ConversationId, ConversationRecord, SessionId, SessionIndex, StoreError, StoreResult,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const CONVERSATIONS_DIR: &str = "conversations";
const INDEX_FILE: &str = "sessions.json";

pub struct FileSystemStore {
    base_path: PathBuf,
    /// Serializes read-modify-write of the index file
    index: Mutex<SessionIndex>,
}

impl FileSystemStore {
    pub async fn new(base_path: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(base_path.join(CONVERSATIONS_DIR)).await?;

        let store = Self {
            base_path,
            index: Mutex::new(SessionIndex::new()),
        };

        let index = store.load_index().await?;
        *store.index.lock().await = index;

        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn conversation_path(&self, id: &ConversationId) -> PathBuf {
        self.base_path
            .join(CONVERSATIONS_DIR)
            .join(format!("{}.json", id))
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join(INDEX_FILE)
    }

    async fn load_index(&self) -> StoreResult<SessionIndex> {
        let path = self.index_path();

        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SessionIndex>(&bytes) {
                Ok(index) => {
                    tracing::debug!(
                        "[FileSystemStore] Loaded index with {} conversations in {} sessions",
                        index.conversation_count(),
                        index.session_count()
                    );
                    return Ok(index);
                }
                Err(e) => {
                    let kept = preserve_corrupt(&path, &bytes).await?;
                    tracing::warn!(
                        "[FileSystemStore] Session index unreadable ({}), moved to {:?}; rebuilding",
                        e,
                        kept
                    );
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("[FileSystemStore] No session index at {:?}; rebuilding", path);
            }
            Err(e) => return Err(e.into()),
        }

        let index = self.rebuild_index().await?;
        self.write_index(&index).await?;
        Ok(index)
    }

    /// Every record carries its session id, so membership can be recovered
    /// from the conversation files alone.
    async fn rebuild_index(&self) -> StoreResult<SessionIndex> {
        let mut index = SessionIndex::new();
        let mut entries = fs::read_dir(self.base_path.join(CONVERSATIONS_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<ConversationRecord>(&bytes) {
                Ok(record) => {
                    index.insert(record.session_id, record.id);
                }
                Err(e) => {
                    tracing::warn!("[FileSystemStore] Skipping unreadable record {:?}: {}", path, e);
                }
            }
        }

        tracing::info!(
            "[FileSystemStore] Rebuilt session index: {} conversations",
            index.conversation_count()
        );
        Ok(index)
    }

    async fn write_index(&self, index: &SessionIndex) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(), &json).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FileSystemStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord> {
        id.validate()?;
        let path = self.conversation_path(id);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("[FileSystemStore] Conversation '{}' does not exist", id);
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<ConversationRecord>(&bytes) {
            Ok(record) => {
                tracing::debug!(
                    "[FileSystemStore] Loaded {} turns for conversation '{}' from {:?}",
                    record.len(),
                    id,
                    path
                );
                Ok(record)
            }
            Err(e) => {
                let kept = preserve_corrupt(&path, &bytes).await?;
                Err(StoreError::Corrupt {
                    id: id.clone(),
                    reason: format!("{} (original kept at {:?})", e, kept),
                })
            }
        }
    }

    async fn save(&self, record: &ConversationRecord) -> StoreResult<()> {
        record.id.validate()?;
        let path = self.conversation_path(&record.id);
        let json = serde_json::to_vec_pretty(record)?;

        write_atomic(&path, &json).await?;

        tracing::debug!(
            "[FileSystemStore] Saved {} turns for conversation '{}' to {:?}",
            record.len(),
            record.id,
            path
        );
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        id.validate()?;
        let path = self.conversation_path(id);

        match fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("[FileSystemStore] Deleted conversation '{}' at {:?}", id, path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("[FileSystemStore] Conversation '{}' does not exist, nothing to delete", id)
            }
            Err(e) => return Err(e.into()),
        }

        let mut index = self.index.lock().await;
        if index.remove(id).is_some() {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()> {
        id.validate()?;
        let mut index = self.index.lock().await;
        if index.insert(session.clone(), id.clone()) {
            self.write_index(&index).await?;
            tracing::debug!("[FileSystemStore] Registered '{}' under session '{}'", id, session);
        }
        Ok(())
    }

    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>> {
        Ok(self.index.lock().await.list(session))
    }

    async fn session_index(&self) -> StoreResult<SessionIndex> {
        Ok(self.index.lock().await.clone())
    }

    async fn exists(&self, id: &ConversationId) -> StoreResult<bool> {
        id.validate()?;
        Ok(fs::try_exists(self.conversation_path(id)).await?)
    }
}

/// Write to a sibling temp file, fsync, then rename over the destination.
/// Rename within one directory is atomic, so concurrent readers see either
/// the old or the new contents.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let temp_path = path.with_file_name(format!("{}.tmp.{}", file_name, uuid::Uuid::new_v4()));

    let write = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    };

    if let Err(e) = write.await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    // Best effort: persist the directory entry as well
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

/// Move an unreadable file out of the way without touching its bytes.
/// When it cannot be moved, the bytes already read are written to the
/// quarantine path instead, so a later save never destroys the only copy.
async fn preserve_corrupt(path: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        chrono::Utc::now().timestamp_millis()
    ));

    if let Err(e) = fs::rename(path, &target).await {
        tracing::warn!(
            "[FileSystemStore] Could not move {:?} aside ({}); writing a copy to {:?}",
            path,
            e,
            target
        );
        write_atomic(&target, bytes).await?;
    }
    Ok(target)
}
