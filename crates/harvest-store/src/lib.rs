//! Durable state for the harvester: documents, checkpoints, failure ledger and price history.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::{FailureRecord, HarvestCheckpoint, ItemId, PriceSnapshot, StorageDocument};
use parking_lot::Mutex;
use thiserror::Error;

pub mod ledger;
pub mod persistence;
pub mod pg;
pub mod price;

pub use ledger::{FailureLedger, FailureStatistics, LedgerError};
pub use persistence::{PersistError, PersistReport, PersistenceConfig, PersistenceLayer};
pub use pg::PgStore;
pub use price::{PriceBatchReport, PriceChangeDetector};

pub const CRATE_NAME: &str = "harvest-store";

/// Largest id list a single existence sub-query may carry.
pub const DEFAULT_LOOKUP_LIMIT: usize = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Database(sqlx::Error::PoolTimedOut)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureQuery {
    pub only_unrecovered: bool,
    pub min_failure_count: u32,
    pub limit: Option<usize>,
}

impl Default for FailureQuery {
    fn default() -> Self {
        Self {
            only_unrecovered: true,
            min_failure_count: 1,
            limit: None,
        }
    }
}

impl FailureQuery {
    pub fn all() -> Self {
        Self {
            only_unrecovered: false,
            min_failure_count: 0,
            limit: None,
        }
    }

    pub fn matches(&self, record: &FailureRecord) -> bool {
        (!self.only_unrecovered || !record.is_recovered())
            && record.failure_count >= self.min_failure_count
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Upserts every document in one atomic write. Stored `created_at` survives.
    async fn commit_documents(&self, documents: &[StorageDocument]) -> Result<(), StoreError>;

    /// Which of `keys` already exist. Callers keep `keys` within `lookup_limit`.
    async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn get_document(&self, key: &str) -> Result<Option<StorageDocument>, StoreError>;

    async fn count_documents(&self) -> Result<usize, StoreError>;

    fn lookup_limit(&self) -> usize {
        DEFAULT_LOOKUP_LIMIT
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(
        &self,
        run_type: &str,
    ) -> Result<Option<HarvestCheckpoint>, StoreError>;
    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn get_failures(
        &self,
        item_ids: &[ItemId],
    ) -> Result<HashMap<ItemId, FailureRecord>, StoreError>;
    async fn put_failures(&self, records: &[FailureRecord]) -> Result<(), StoreError>;
    /// Oldest `last_failed_at` first.
    async fn query_failures(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(
        &self,
        item_id: &ItemId,
        day: NaiveDate,
    ) -> Result<Option<PriceSnapshot>, StoreError>;
    async fn put_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError>;
    /// Oldest day first.
    async fn snapshot_history(&self, item_id: &ItemId) -> Result<Vec<PriceSnapshot>, StoreError>;
}

/// Every store concern behind one handle.
pub trait HarvestStore: DocumentStore + CheckpointStore + FailureStore + SnapshotStore {}

impl<T: DocumentStore + CheckpointStore + FailureStore + SnapshotStore> HarvestStore for T {}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, StorageDocument>,
    checkpoints: HashMap<String, HarvestCheckpoint>,
    failures: BTreeMap<ItemId, FailureRecord>,
    snapshots: BTreeMap<(ItemId, NaiveDate), PriceSnapshot>,
    document_commits: usize,
}

/// In-process backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_commits(&self) -> usize {
        self.state.lock().document_commits
    }

    pub fn document_keys(&self) -> Vec<String> {
        self.state.lock().documents.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn commit_documents(&self, documents: &[StorageDocument]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for doc in documents {
            let mut doc = doc.clone();
            if let Some(existing) = state.documents.get(doc.key()) {
                doc.created_at = existing.created_at;
            }
            state.documents.insert(doc.product_id.clone(), doc);
        }
        state.document_commits += 1;
        Ok(())
    }

    async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock();
        Ok(keys
            .iter()
            .filter(|key| state.documents.contains_key(key.as_str()))
            .cloned()
            .collect())
    }

    async fn get_document(&self, key: &str) -> Result<Option<StorageDocument>, StoreError> {
        Ok(self.state.lock().documents.get(key).cloned())
    }

    async fn count_documents(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().documents.len())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(
        &self,
        run_type: &str,
    ) -> Result<Option<HarvestCheckpoint>, StoreError> {
        Ok(self.state.lock().checkpoints.get(run_type).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) -> Result<(), StoreError> {
        self.state
            .lock()
            .checkpoints
            .insert(checkpoint.run_type.clone(), checkpoint.clone());
        Ok(())
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn get_failures(
        &self,
        item_ids: &[ItemId],
    ) -> Result<HashMap<ItemId, FailureRecord>, StoreError> {
        let state = self.state.lock();
        Ok(item_ids
            .iter()
            .filter_map(|id| state.failures.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn put_failures(&self, records: &[FailureRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for record in records {
            state.failures.insert(record.item_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query_failures(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>, StoreError> {
        let state = self.state.lock();
        let mut matched: Vec<FailureRecord> = state
            .failures
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.last_failed_at);
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get_snapshot(
        &self,
        item_id: &ItemId,
        day: NaiveDate,
    ) -> Result<Option<PriceSnapshot>, StoreError> {
        Ok(self.state.lock().snapshots.get(&(item_id.clone(), day)).cloned())
    }

    async fn put_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.state
            .lock()
            .snapshots
            .insert((snapshot.item_id.clone(), snapshot.day), snapshot.clone());
        Ok(())
    }

    async fn snapshot_history(&self, item_id: &ItemId) -> Result<Vec<PriceSnapshot>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .snapshots
            .range((item_id.clone(), NaiveDate::MIN)..=(item_id.clone(), NaiveDate::MAX))
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }
}
