use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_client::{FetchOutcome, ItemFetcher};
use harvest_core::{map_raw_record, FailureReason, ItemId, RawRecord};
use harvest_store::{FailureLedger, FailureQuery, PersistenceLayer, PriceChangeDetector};
use tracing::{info, info_span, warn, Instrument};

use crate::HarvestError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
}

/// Slow, sequential retry of ledger entries through a retrying fetcher.
pub struct RecoveryPass {
    fetcher: Arc<dyn ItemFetcher>,
    ledger: FailureLedger,
    persistence: PersistenceLayer,
    prices: PriceChangeDetector,
    query: FailureQuery,
    item_delay: Duration,
}

impl RecoveryPass {
    pub fn new(
        fetcher: Arc<dyn ItemFetcher>,
        ledger: FailureLedger,
        persistence: PersistenceLayer,
        prices: PriceChangeDetector,
        query: FailureQuery,
    ) -> Self {
        Self {
            fetcher,
            ledger,
            persistence,
            prices,
            query,
            item_delay: Duration::ZERO,
        }
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn query(&self) -> &FailureQuery {
        &self.query
    }

    pub async fn run(&self) -> Result<RecoverySummary, HarvestError> {
        let span = info_span!("failure_recovery", limit = ?self.query.limit);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RecoverySummary, HarvestError> {
        let candidates = self.ledger.query(&self.query).await?;
        let mut summary = RecoverySummary {
            attempted: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("no failed items to recover");
            return Ok(summary);
        }
        info!(candidates = candidates.len(), "recovering failed items");

        let mut fetched: HashMap<ItemId, RawRecord> = HashMap::new();
        for (idx, item_id) in candidates.iter().enumerate() {
            if idx > 0 && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
            let (reason, detail) = match self.fetcher.fetch_outcome(item_id).await {
                Ok(FetchOutcome::Found(record)) => {
                    fetched.insert(item_id.clone(), record);
                    continue;
                }
                Ok(FetchOutcome::SoftMiss(kind)) => {
                    (kind.failure_reason(), kind.describe().to_string())
                }
                Err(err) => (err.failure_reason(), err.to_string()),
            };
            summary.still_failing += 1;
            if let Err(err) = self.ledger.record(item_id, reason, detail).await {
                warn!(item_id = %item_id, error = %err, "could not update failure record");
            }
        }

        let now = Utc::now();
        let mut documents = Vec::with_capacity(fetched.len());
        let mut owners: HashMap<String, ItemId> = HashMap::with_capacity(fetched.len());
        for (item_id, raw) in &fetched {
            match map_raw_record(raw, now) {
                Ok(doc) => {
                    owners.insert(doc.product_id.clone(), item_id.clone());
                    documents.push(doc);
                }
                Err(err) => {
                    summary.still_failing += 1;
                    let recorded = self
                        .ledger
                        .record(item_id, FailureReason::ValidationError, err.to_string())
                        .await;
                    if let Err(err) = recorded {
                        warn!(item_id = %item_id, error = %err, "could not update failure record");
                    }
                }
            }
        }

        if !documents.is_empty() {
            let report = self.persistence.persist(&documents).await?;
            summary.still_failing += report.failed;
            let persisted: Vec<ItemId> = documents
                .iter()
                .filter(|doc| !report.failed_keys.contains(&doc.product_id))
                .filter_map(|doc| owners.get(&doc.product_id).cloned())
                .collect();
            match self.ledger.recover_many_at(&persisted, now).await {
                Ok(count) => summary.recovered = count,
                Err(err) => warn!(error = %err, "could not mark recovered items"),
            }
            self.prices
                .record_batch_at(fetched.iter().filter(|(id, _)| persisted.contains(*id)), now)
                .await;
        }

        info!(
            attempted = summary.attempted,
            recovered = summary.recovered,
            still_failing = summary.still_failing,
            "failure recovery finished"
        );
        Ok(summary)
    }
}
