//! Memory store contract and the in-process implementation.
//!
//! Every query is scoped by child. Lists come back newest first unless a
//! method documents otherwise.

use super::model::{Memory, MemoryType, MAX_IMPORTANCE, MIN_IMPORTANCE};
use crate::{MemoryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Durable repository of memories. All business logic goes through this.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert a memory and return its newly assigned id
    async fn insert(&self, memory: Memory) -> Result<i64>;

    /// Replace a stored memory (matched by id)
    async fn update(&self, memory: &Memory) -> Result<()>;

    async fn delete(&self, memory: &Memory) -> Result<()>;

    async fn delete_by_id(&self, id: i64) -> Result<()>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Memory>>;

    async fn get_for_child(&self, child_id: &str) -> Result<Vec<Memory>>;

    async fn get_recent_memories(&self, child_id: &str, limit: usize) -> Result<Vec<Memory>>;

    async fn get_memories_by_type(
        &self,
        child_id: &str,
        memory_type: MemoryType,
    ) -> Result<Vec<Memory>>;

    /// Memories with importance >= `min_importance`, most important first
    async fn get_important_memories(
        &self,
        child_id: &str,
        min_importance: u8,
    ) -> Result<Vec<Memory>>;

    /// Memories with `start <= timestamp <= end`
    async fn get_memories_in_time_range(
        &self,
        child_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Memory>>;

    /// Case-insensitive substring search over memory text
    async fn search_memories(&self, child_id: &str, text: &str) -> Result<Vec<Memory>>;

    async fn get_memory_count(&self, child_id: &str) -> Result<usize>;

    async fn get_last_memory_timestamp(&self, child_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Delete memories strictly older than `before`; returns the deleted count
    async fn delete_old_memories(&self, child_id: &str, before: DateTime<Utc>) -> Result<usize>;

    /// Delete memories with importance <= `max_importance`; returns the deleted count
    async fn delete_low_importance_memories(
        &self,
        child_id: &str,
        max_importance: u8,
    ) -> Result<usize>;

    async fn clear_memories_for_child(&self, child_id: &str) -> Result<usize>;

    /// Insert `memory`, then delete `ids`. Readers must never observe the
    /// deletions without the insert. The default runs the steps in that
    /// order; stores that can do both under one lock should override it.
    async fn insert_and_delete(&self, memory: Memory, ids: &[i64]) -> Result<i64> {
        let id = self.insert(memory).await?;
        for old in ids {
            self.delete_by_id(*old).await?;
        }
        Ok(id)
    }
}

/// Raw contents of a store: the rows plus the next id to hand out.
/// This is also the on-disk format of [`super::JsonFileStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_id: i64,
    pub memories: Vec<Memory>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    rows: BTreeMap<i64, Memory>,
}

impl StoreState {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState {
            next_id: snapshot.next_id,
            rows: BTreeMap::new(),
        };
        let (with_ids, without_ids): (Vec<Memory>, Vec<Memory>) =
            snapshot.memories.into_iter().partition(|m| m.id.is_some());
        for memory in with_ids {
            if let Some(id) = memory.id {
                state.next_id = state.next_id.max(id);
                state.rows.insert(id, memory.clamped());
            }
        }
        for memory in without_ids {
            state.assign(memory.clamped());
        }
        state
    }

    fn assign(&mut self, mut memory: Memory) -> i64 {
        self.next_id = self.next_id.max(0) + 1;
        let id = self.next_id;
        memory.id = Some(id);
        self.rows.insert(id, memory);
        id
    }

    fn child_rows<'a>(&'a self, child_id: &'a str) -> impl Iterator<Item = &'a Memory> + 'a {
        self.rows.values().filter(move |m| m.child_id == child_id)
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&Memory) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, m| !pred(m));
        before - self.rows.len()
    }
}

/// Newest first, with id as the tiebreak so ordering is total
fn newest_first(mut memories: Vec<Memory>) -> Vec<Memory> {
    memories.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
    memories
}

/// Process-local store guarded by a single async lock
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from raw rows. Out-of-range importance and sentiment
    /// are clamped; rows without an id get a fresh one.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(StoreState::from_snapshot(snapshot)),
        }
    }

    /// Replace the whole contents with `snapshot`
    pub(crate) async fn restore(&self, snapshot: StoreSnapshot) {
        *self.state.write().await = StoreState::from_snapshot(snapshot);
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        StoreSnapshot {
            next_id: state.next_id,
            memories: state.rows.values().cloned().collect(),
        }
    }

    async fn collect(&self, child_id: &str, pred: impl Fn(&Memory) -> bool) -> Vec<Memory> {
        let state = self.state.read().await;
        newest_first(state.child_rows(child_id).filter(|m| pred(m)).cloned().collect())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert(&self, memory: Memory) -> Result<i64> {
        let mut state = self.state.write().await;
        let id = state.assign(memory);
        debug!("Inserted memory {}", id);
        Ok(id)
    }

    async fn update(&self, memory: &Memory) -> Result<()> {
        let id = memory
            .id
            .ok_or_else(|| MemoryError::Store("cannot update a memory without an id".into()))?;
        let mut state = self.state.write().await;
        match state.rows.get_mut(&id) {
            Some(row) => {
                *row = memory.clone();
                Ok(())
            }
            None => Err(MemoryError::Store(format!("memory {id} not found"))),
        }
    }

    async fn delete(&self, memory: &Memory) -> Result<()> {
        match memory.id {
            Some(id) => self.delete_by_id(id).await,
            None => Ok(()),
        }
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        self.state.write().await.rows.remove(&id);
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Memory>> {
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn get_for_child(&self, child_id: &str) -> Result<Vec<Memory>> {
        Ok(self.collect(child_id, |_| true).await)
    }

    async fn get_recent_memories(&self, child_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let mut memories = self.collect(child_id, |_| true).await;
        memories.truncate(limit);
        Ok(memories)
    }

    async fn get_memories_by_type(
        &self,
        child_id: &str,
        memory_type: MemoryType,
    ) -> Result<Vec<Memory>> {
        Ok(self.collect(child_id, |m| m.memory_type == memory_type).await)
    }

    async fn get_important_memories(
        &self,
        child_id: &str,
        min_importance: u8,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.collect(child_id, |m| m.importance >= min_importance).await;
        // stable sort keeps newest-first within an importance level
        memories.sort_by(|a, b| b.importance.cmp(&a.importance));
        Ok(memories)
    }

    async fn get_memories_in_time_range(
        &self,
        child_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        Ok(self
            .collect(child_id, |m| m.timestamp >= start && m.timestamp <= end)
            .await)
    }

    async fn search_memories(&self, child_id: &str, text: &str) -> Result<Vec<Memory>> {
        let needle = text.to_lowercase();
        Ok(self
            .collect(child_id, |m| m.text.to_lowercase().contains(&needle))
            .await)
    }

    async fn get_memory_count(&self, child_id: &str) -> Result<usize> {
        Ok(self.state.read().await.child_rows(child_id).count())
    }

    async fn get_last_memory_timestamp(&self, child_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .read()
            .await
            .child_rows(child_id)
            .map(|m| m.timestamp)
            .max())
    }

    async fn delete_old_memories(&self, child_id: &str, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state.remove_where(|m| m.child_id == child_id && m.timestamp < before))
    }

    async fn delete_low_importance_memories(
        &self,
        child_id: &str,
        max_importance: u8,
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state.remove_where(|m| m.child_id == child_id && m.importance <= max_importance))
    }

    async fn clear_memories_for_child(&self, child_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state.remove_where(|m| m.child_id == child_id))
    }

    async fn insert_and_delete(&self, memory: Memory, ids: &[i64]) -> Result<i64> {
        let mut state = self.state.write().await;
        let id = state.assign(memory);
        for old in ids {
            state.rows.remove(old);
        }
        Ok(id)
    }
}

/// Per-child overview of the store
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStatistics {
    pub total_count: usize,
    pub last_memory_timestamp: Option<DateTime<Utc>>,
    pub type_distribution: HashMap<MemoryType, usize>,
    /// For each level 1..=5, how many memories have at least that importance
    pub importance_distribution: BTreeMap<u8, usize>,
}

pub async fn memory_statistics(
    store: &dyn MemoryStore,
    child_id: &str,
) -> Result<MemoryStatistics> {
    let total_count = store.get_memory_count(child_id).await?;
    let last_memory_timestamp = store.get_last_memory_timestamp(child_id).await?;

    let mut type_distribution = HashMap::new();
    for memory_type in MemoryType::ALL {
        let count = store.get_memories_by_type(child_id, memory_type).await?.len();
        type_distribution.insert(memory_type, count);
    }

    let mut importance_distribution = BTreeMap::new();
    for level in MIN_IMPORTANCE..=MAX_IMPORTANCE {
        let count = store.get_important_memories(child_id, level).await?.len();
        importance_distribution.insert(level, count);
    }

    Ok(MemoryStatistics {
        total_count,
        last_memory_timestamp,
        type_distribution,
        importance_distribution,
    })
}
