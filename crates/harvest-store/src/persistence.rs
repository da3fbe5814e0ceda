use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use harvest_core::{FailureReason, ItemId, StorageDocument};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{DocumentStore, FailureLedger};

const SAMPLE_IDS: usize = 5;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// At or below this many documents everything goes in one transaction.
    pub single_tx_limit: usize,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            single_tx_limit: 50,
            chunk_size: 50,
            chunk_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub total: usize,
    pub committed: usize,
    pub failed: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub failed_keys: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(
        "systemic persistence failure: all {failed_chunks} of {total_chunks} chunks failed \
         ({documents} documents)"
    )]
    Systemic {
        failed_chunks: usize,
        total_chunks: usize,
        documents: usize,
    },
}

/// Chunked transactional writes that tolerate isolated chunk failures.
#[derive(Clone)]
pub struct PersistenceLayer {
    store: Arc<dyn DocumentStore>,
    ledger: Option<FailureLedger>,
    config: PersistenceConfig,
}

impl PersistenceLayer {
    pub fn new(store: Arc<dyn DocumentStore>, config: PersistenceConfig) -> Self {
        Self {
            store,
            ledger: None,
            config,
        }
    }

    pub fn with_ledger(mut self, ledger: FailureLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Fails only when every chunk fails.
    pub async fn persist(
        &self,
        documents: &[StorageDocument],
    ) -> Result<PersistReport, PersistError> {
        let mut report = PersistReport {
            total: documents.len(),
            ..Default::default()
        };
        if documents.is_empty() {
            return Ok(report);
        }

        let chunks: Vec<&[StorageDocument]> = if documents.len() <= self.config.single_tx_limit {
            vec![documents]
        } else {
            documents.chunks(self.config.chunk_size.max(1)).collect()
        };
        report.chunks = chunks.len();

        for (idx, chunk) in chunks.iter().enumerate() {
            if idx > 0 && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            match self.store.commit_documents(chunk).await {
                Ok(()) => report.committed += chunk.len(),
                Err(err) => {
                    let reason = if err.is_timeout() {
                        FailureReason::Timeout
                    } else {
                        FailureReason::Unknown
                    };
                    let sample: Vec<&str> =
                        chunk.iter().take(SAMPLE_IDS).map(StorageDocument::key).collect();
                    error!(
                        chunk = idx,
                        size = chunk.len(),
                        %reason,
                        error = %err,
                        sample_ids = ?sample,
                        "chunk commit failed"
                    );
                    report.failed += chunk.len();
                    report.failed_chunks += 1;
                    report
                        .failed_keys
                        .extend(chunk.iter().map(|doc| doc.product_id.clone()));
                    self.forward_to_ledger(chunk, reason, &err.to_string()).await;
                }
            }
        }

        if report.failed_chunks == report.chunks {
            return Err(PersistError::Systemic {
                failed_chunks: report.failed_chunks,
                total_chunks: report.chunks,
                documents: report.total,
            });
        }

        info!(
            committed = report.committed,
            failed = report.failed,
            chunks = report.chunks,
            "documents persisted"
        );
        Ok(report)
    }

    async fn forward_to_ledger(
        &self,
        chunk: &[StorageDocument],
        reason: FailureReason,
        detail: &str,
    ) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let entries: Vec<_> = chunk
            .iter()
            .filter_map(|doc| ItemId::parse(&doc.product_id).ok())
            .map(|id| (id, reason, format!("persistence: {detail}")))
            .collect();
        if let Err(err) = ledger.record_many(entries).await {
            warn!(error = %err, "could not record chunk failure in ledger");
        }
    }

    /// Parallel existence lookup. Any sub-query failure means "treat all as new".
    pub async fn existing_keys(&self, keys: &[String]) -> HashSet<String> {
        if keys.is_empty() {
            return HashSet::new();
        }
        let limit = self.store.lookup_limit().max(1);
        let lookups = keys.chunks(limit).map(|part| self.store.existing_keys(part));

        let mut found = HashSet::new();
        for result in join_all(lookups).await {
            match result {
                Ok(part) => found.extend(part),
                Err(err) => {
                    warn!(
                        error = %err,
                        keys = keys.len(),
                        "existing-document lookup failed; treating all as new"
                    );
                    return HashSet::new();
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureQuery, MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use harvest_core::{map_raw_record, RawRecord};
    use parking_lot::Mutex;

    fn docs(n: usize) -> Vec<StorageDocument> {
        (0..n)
            .map(|i| {
                let raw = RawRecord {
                    workno: Some(format!("RJ{:06}", 200000 + i)),
                    ..Default::default()
                };
                map_raw_record(&raw, Utc::now()).unwrap()
            })
            .collect()
    }

    /// Fails commits whose chunk index is listed; counts every attempt.
    struct FlakyStore {
        inner: MemoryStore,
        fail_chunks: Vec<usize>,
        timeout: bool,
        attempts: Mutex<usize>,
        fail_lookups: bool,
    }

    impl FlakyStore {
        fn failing(fail_chunks: Vec<usize>) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_chunks,
                timeout: false,
                attempts: Mutex::new(0),
                fail_lookups: false,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn commit_documents(&self, documents: &[StorageDocument]) -> Result<(), StoreError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                *attempts += 1;
                *attempts - 1
            };
            if self.fail_chunks.contains(&attempt) {
                return Err(if self.timeout {
                    StoreError::Timeout(Duration::from_secs(10))
                } else {
                    StoreError::Unavailable("write rejected".into())
                });
            }
            self.inner.commit_documents(documents).await
        }

        async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError> {
            if self.fail_lookups {
                return Err(StoreError::Unavailable("lookup down".into()));
            }
            self.inner.existing_keys(keys).await
        }

        async fn get_document(&self, key: &str) -> Result<Option<StorageDocument>, StoreError> {
            self.inner.get_document(key).await
        }

        async fn count_documents(&self) -> Result<usize, StoreError> {
            self.inner.count_documents().await
        }

        fn lookup_limit(&self) -> usize {
            3
        }
    }

    #[tokio::test(start_paused = true)]
    async fn small_sets_commit_in_one_transaction() {
        let store = Arc::new(MemoryStore::new());
        let layer = PersistenceLayer::new(store.clone(), PersistenceConfig::default());
        let report = layer.persist(&docs(50)).await.unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(store.document_commits(), 1);

        let again = layer.persist(&docs(50)).await.unwrap();
        assert_eq!(again.committed, 50);
        assert_eq!(store.count_documents().await.unwrap(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn large_sets_commit_ceil_n_over_c_chunks_with_delays() {
        let store = Arc::new(MemoryStore::new());
        let layer = PersistenceLayer::new(store.clone(), PersistenceConfig::default());
        let started = tokio::time::Instant::now();
        let report = layer.persist(&docs(120)).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(store.document_commits(), 3);
        assert_eq!(report.committed, 120);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_chunk_is_isolated_and_ledgered() {
        let store = Arc::new(FlakyStore::failing(vec![1]));
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        let layer = PersistenceLayer::new(store.clone(), PersistenceConfig::default())
            .with_ledger(ledger.clone());

        let report = layer.persist(&docs(120)).await.unwrap();
        assert_eq!(report.committed, 70);
        assert_eq!(report.failed, 50);
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(store.inner.count_documents().await.unwrap(), 70);

        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.unrecovered, 50);
        assert_eq!(stats.by_reason[&FailureReason::Unknown], 50);
        let open = ledger.query(&FailureQuery::default()).await.unwrap();
        assert!(open.contains(&ItemId::parse("RJ200050").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn all_chunks_failing_is_systemic() {
        let mut flaky = FlakyStore::failing(vec![0, 1, 2]);
        flaky.timeout = true;
        let layer = PersistenceLayer::new(Arc::new(flaky), PersistenceConfig::default());

        let err = layer.persist(&docs(120)).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("all 3 of 3 chunks failed"), "{message}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_classified_for_the_ledger() {
        let mut flaky = FlakyStore::failing(vec![0]);
        flaky.timeout = true;
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        let layer = PersistenceLayer::new(Arc::new(flaky), PersistenceConfig::default())
            .with_ledger(ledger.clone());

        layer.persist(&docs(60)).await.unwrap();
        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.by_reason.get(&FailureReason::Timeout), Some(&50));
    }

    #[tokio::test]
    async fn lookup_merges_sub_queries_and_degrades_to_all_new() {
        let store = Arc::new(FlakyStore::failing(Vec::new()));
        let existing = docs(7);
        store.inner.commit_documents(&existing).await.unwrap();
        let layer = PersistenceLayer::new(store.clone(), PersistenceConfig::default());

        let mut keys: Vec<String> = existing.iter().map(|d| d.product_id.clone()).collect();
        keys.push("RJ999999".to_string());
        let found = layer.existing_keys(&keys).await;
        assert_eq!(found.len(), 7);
        assert!(!found.contains("RJ999999"));

        let mut failing = FlakyStore::failing(Vec::new());
        failing.fail_lookups = true;
        let layer = PersistenceLayer::new(Arc::new(failing), PersistenceConfig::default());
        assert!(layer.existing_keys(&keys).await.is_empty());
    }
}
