//! In-process execution stores
//!
//! `MemoryExecutionStore` is the default adapter for single-process
//! deployments and tests. `LaggedExecutionStore` wraps it and serves stale
//! reads for a configurable number of `get` calls after every write, to
//! exercise read-after-write verification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryExecutionStore
// ---------------------------------------------------------------------------

/// In-memory store backed by a `HashMap<execution_id, record>`.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: Mutex<HashMap<String, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, record: ExecutionRecord) -> StorageResult<()> {
        let mut records = lock(&self.records)?;
        if records.contains_key(&record.id.0) {
            return Err(StorageError::Duplicate {
                execution_id: record.id.0.clone(),
            });
        }
        records.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        transition: Transition,
    ) -> StorageResult<ExecutionRecord> {
        let mut records = lock(&self.records)?;
        let record = records
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound {
                execution_id: id.0.clone(),
            })?;
        record.apply(transition)?;
        Ok(record.clone())
    }

    async fn get(&self, id: &ExecutionId) -> StorageResult<Option<ExecutionRecord>> {
        let records = lock(&self.records)?;
        Ok(records.get(&id.0).cloned())
    }

    async fn list_by_evaluation(
        &self,
        evaluation_id: &str,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let records = lock(&self.records)?;
        let mut out: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.evaluation_id == evaluation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.0.cmp(&b.id.0)));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// LaggedExecutionStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Visibility {
    /// What readers see until the lag drains (`None` = not yet visible)
    snapshot: Option<ExecutionRecord>,
    stale_reads_left: u32,
}

/// Eventually-consistent store: after each write, the next `lag` calls to
/// `get` for that record observe the pre-write state.
#[derive(Debug, Default)]
pub struct LaggedExecutionStore {
    inner: MemoryExecutionStore,
    lag: AtomicU32,
    visibility: Mutex<HashMap<String, Visibility>>,
}

impl LaggedExecutionStore {
    pub fn new(lag: u32) -> Self {
        Self {
            inner: MemoryExecutionStore::new(),
            lag: AtomicU32::new(lag),
            visibility: Mutex::new(HashMap::new()),
        }
    }

    /// Change the lag applied to subsequent writes.
    pub fn set_lag(&self, lag: u32) {
        self.lag.store(lag, Ordering::SeqCst);
    }

    fn mark_stale(&self, id: &str, snapshot: Option<ExecutionRecord>) -> StorageResult<()> {
        let lag = self.lag.load(Ordering::SeqCst);
        let mut vis = lock(&self.visibility)?;
        if lag == 0 {
            vis.remove(id);
        } else {
            vis.insert(
                id.to_string(),
                Visibility {
                    snapshot,
                    stale_reads_left: lag,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for LaggedExecutionStore {
    async fn insert(&self, record: ExecutionRecord) -> StorageResult<()> {
        let id = record.id.0.clone();
        self.inner.insert(record).await?;
        self.mark_stale(&id, None)
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        transition: Transition,
    ) -> StorageResult<ExecutionRecord> {
        let before = self.inner.get(id).await?;
        let updated = self.inner.transition(id, transition).await?;
        self.mark_stale(&id.0, before)?;
        Ok(updated)
    }

    async fn get(&self, id: &ExecutionId) -> StorageResult<Option<ExecutionRecord>> {
        {
            let mut vis = lock(&self.visibility)?;
            if let Some(entry) = vis.get_mut(&id.0) {
                if entry.stale_reads_left > 0 {
                    entry.stale_reads_left -= 1;
                    return Ok(entry.snapshot.clone());
                }
                vis.remove(&id.0);
            }
        }
        self.inner.get(id).await
    }

    async fn list_by_evaluation(
        &self,
        evaluation_id: &str,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let fresh = self.inner.list_by_evaluation(evaluation_id).await?;
        let vis = lock(&self.visibility)?;
        Ok(fresh
            .into_iter()
            .filter_map(|record| match vis.get(&record.id.0) {
                Some(entry) if entry.stale_reads_left > 0 => entry.snapshot.clone(),
                _ => Some(record),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> ExecutionRecord {
        ExecutionRecord::pending(ExecutionId::from(id), "eval-1", "sentiment")
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicate_ids() {
        let store = MemoryExecutionStore::new();
        store.insert(pending("x")).await.unwrap();
        let err = store.insert(pending("x")).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_lagged_store_serves_stale_reads_then_converges() {
        let store = LaggedExecutionStore::new(2);
        let id = ExecutionId::from("x");
        store.insert(pending("x")).await.unwrap();

        // Insert not yet visible
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.get(&id).await.unwrap().is_some());

        store.transition(&id, Transition::Running).await.unwrap();
        let stale = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Pending);
        let stale = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Pending);
        let fresh = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_lagged_store_still_enforces_state_machine() {
        let store = LaggedExecutionStore::new(5);
        let id = ExecutionId::from("x");
        store.insert(pending("x")).await.unwrap();
        store
            .transition(
                &id,
                Transition::Failed {
                    error: "e".to_string(),
                },
            )
            .await
            .unwrap();

        // Reads are stale, but the writer-of-record state is terminal
        let err = store.transition(&id, Transition::Running).await.unwrap_err();
        assert!(err.is_terminal_conflict());
    }
}
