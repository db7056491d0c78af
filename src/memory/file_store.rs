//! JSON-file persistence for memories.
//!
//! The whole store lives in one JSON snapshot that is rewritten after every
//! mutation (temp file + rename, so a crash never leaves a torn file). A
//! failed write rolls the in-memory state back.

use super::model::{Memory, MemoryType};
use super::store::{InMemoryStore, MemoryStore, StoreSnapshot};
use crate::{MemoryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub struct JsonFileStore {
    path: PathBuf,
    inner: InMemoryStore,
    /// Serializes snapshot writes
    save_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories and an empty
    /// file when nothing exists yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let snapshot: StoreSnapshot = serde_json::from_str(&content).map_err(|e| {
                MemoryError::Store(format!("corrupt memory file {}: {}", path.display(), e))
            })?;
            info!(
                "Loaded {} memories from {}",
                snapshot.memories.len(),
                path.display()
            );
            InMemoryStore::from_snapshot(snapshot)
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            InMemoryStore::new()
        };

        let store = Self {
            path,
            inner,
            save_lock: Mutex::new(()),
        };
        let snapshot = store.inner.snapshot().await;
        store.write_snapshot(&snapshot).await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the save lock and remember the current contents. Mutate `inner`
    /// while holding the guard, then call [`Self::commit`].
    async fn begin(&self) -> (MutexGuard<'_, ()>, StoreSnapshot) {
        let guard = self.save_lock.lock().await;
        let before = self.inner.snapshot().await;
        (guard, before)
    }

    /// Write the mutated contents, rolling `inner` back to `before` when the
    /// write fails so memory and disk never disagree.
    async fn commit(&self, before: StoreSnapshot) -> Result<()> {
        let after = self.inner.snapshot().await;
        if let Err(e) = self.write_snapshot(&after).await {
            warn!(
                "Failed to save memories to {}: {}; rolling back",
                self.path.display(),
                e
            );
            self.inner.restore(before).await;
            return Err(e);
        }
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        debug!("Saved {} memories to {}", snapshot.memories.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for JsonFileStore {
    async fn insert(&self, memory: Memory) -> Result<i64> {
        let (_guard, before) = self.begin().await;
        let id = self.inner.insert(memory).await?;
        self.commit(before).await?;
        Ok(id)
    }

    async fn update(&self, memory: &Memory) -> Result<()> {
        let (_guard, before) = self.begin().await;
        self.inner.update(memory).await?;
        self.commit(before).await
    }

    async fn delete(&self, memory: &Memory) -> Result<()> {
        let (_guard, before) = self.begin().await;
        self.inner.delete(memory).await?;
        self.commit(before).await
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        let (_guard, before) = self.begin().await;
        self.inner.delete_by_id(id).await?;
        self.commit(before).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Memory>> {
        self.inner.get_by_id(id).await
    }

    async fn get_for_child(&self, child_id: &str) -> Result<Vec<Memory>> {
        self.inner.get_for_child(child_id).await
    }

    async fn get_recent_memories(&self, child_id: &str, limit: usize) -> Result<Vec<Memory>> {
        self.inner.get_recent_memories(child_id, limit).await
    }

    async fn get_memories_by_type(
        &self,
        child_id: &str,
        memory_type: MemoryType,
    ) -> Result<Vec<Memory>> {
        self.inner.get_memories_by_type(child_id, memory_type).await
    }

    async fn get_important_memories(
        &self,
        child_id: &str,
        min_importance: u8,
    ) -> Result<Vec<Memory>> {
        self.inner.get_important_memories(child_id, min_importance).await
    }

    async fn get_memories_in_time_range(
        &self,
        child_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        self.inner.get_memories_in_time_range(child_id, start, end).await
    }

    async fn search_memories(&self, child_id: &str, text: &str) -> Result<Vec<Memory>> {
        self.inner.search_memories(child_id, text).await
    }

    async fn get_memory_count(&self, child_id: &str) -> Result<usize> {
        self.inner.get_memory_count(child_id).await
    }

    async fn get_last_memory_timestamp(&self, child_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.inner.get_last_memory_timestamp(child_id).await
    }

    async fn delete_old_memories(&self, child_id: &str, before: DateTime<Utc>) -> Result<usize> {
        let (_guard, snapshot) = self.begin().await;
        let deleted = self.inner.delete_old_memories(child_id, before).await?;
        if deleted > 0 {
            self.commit(snapshot).await?;
        }
        Ok(deleted)
    }

    async fn delete_low_importance_memories(
        &self,
        child_id: &str,
        max_importance: u8,
    ) -> Result<usize> {
        let (_guard, before) = self.begin().await;
        let deleted = self
            .inner
            .delete_low_importance_memories(child_id, max_importance)
            .await?;
        if deleted > 0 {
            self.commit(before).await?;
        }
        Ok(deleted)
    }

    async fn clear_memories_for_child(&self, child_id: &str) -> Result<usize> {
        let (_guard, before) = self.begin().await;
        let deleted = self.inner.clear_memories_for_child(child_id).await?;
        self.commit(before).await?;
        Ok(deleted)
    }

    async fn insert_and_delete(&self, memory: Memory, ids: &[i64]) -> Result<i64> {
        let (_guard, before) = self.begin().await;
        let id = self.inner.insert_and_delete(memory, ids).await?;
        self.commit(before).await?;
        Ok(id)
    }
}
