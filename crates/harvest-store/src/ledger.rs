use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{FailureReason, FailureRecord, ItemId};
use thiserror::Error;
use tracing::{debug, info};

use crate::{FailureQuery, FailureStore, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failure ledger store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureStatistics {
    pub total_failed: usize,
    pub unrecovered: usize,
    pub recovered: usize,
    pub by_reason: BTreeMap<FailureReason, usize>,
}

impl FailureStatistics {
    /// Unrecovered failures as a percentage of `total_items`.
    pub fn failure_rate(&self, total_items: usize) -> f64 {
        if total_items == 0 {
            return 0.0;
        }
        self.unrecovered as f64 / total_items as f64 * 100.0
    }
}

/// Durable record of failed items. Recovery marks, never deletes.
#[derive(Clone)]
pub struct FailureLedger {
    store: Arc<dyn FailureStore>,
}

impl FailureLedger {
    pub fn new(store: Arc<dyn FailureStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        item_id: &ItemId,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<FailureRecord, LedgerError> {
        let mut written = self
            .record_many_at(vec![(item_id.clone(), reason, detail.into())], Utc::now())
            .await?;
        Ok(written.remove(0))
    }

    pub async fn record_many(
        &self,
        entries: Vec<(ItemId, FailureReason, String)>,
    ) -> Result<usize, LedgerError> {
        Ok(self.record_many_at(entries, Utc::now()).await?.len())
    }

    /// Upserts one record per distinct id; repeated ids in `entries` count once each.
    pub async fn record_many_at(
        &self,
        entries: Vec<(ItemId, FailureReason, String)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, LedgerError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<ItemId> = entries.iter().map(|(id, _, _)| id.clone()).collect();
        let mut existing = self.store.get_failures(&ids).await?;

        let mut order = Vec::new();
        let mut merged: HashMap<ItemId, FailureRecord> = HashMap::new();
        for (item_id, reason, detail) in entries {
            let record = match merged.remove(&item_id).or_else(|| existing.remove(&item_id)) {
                Some(mut record) => {
                    record.register_failure(reason, detail, now);
                    record
                }
                None => FailureRecord::first(item_id.clone(), reason, detail, now),
            };
            if !order.contains(&item_id) {
                order.push(item_id.clone());
            }
            merged.insert(item_id, record);
        }

        let records: Vec<FailureRecord> = order.iter().filter_map(|id| merged.remove(id)).collect();
        self.store.put_failures(&records).await?;
        debug!(count = records.len(), "failure records written");
        Ok(records)
    }

    pub async fn query(&self, query: &FailureQuery) -> Result<Vec<ItemId>, LedgerError> {
        Ok(self
            .store
            .query_failures(query)
            .await?
            .into_iter()
            .map(|record| record.item_id)
            .collect())
    }

    pub async fn records(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>, LedgerError> {
        Ok(self.store.query_failures(query).await?)
    }

    pub async fn recover(&self, item_id: &ItemId) -> Result<bool, LedgerError> {
        Ok(self.recover_many_at(std::slice::from_ref(item_id), Utc::now()).await? == 1)
    }

    /// Marks every open record among `item_ids` recovered. Ids with no record are ignored.
    pub async fn recover_many_at(
        &self,
        item_ids: &[ItemId],
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let existing = self.store.get_failures(item_ids).await?;
        let recovered: Vec<FailureRecord> = existing
            .into_values()
            .filter_map(|mut record| record.mark_recovered(now).then_some(record))
            .collect();
        if recovered.is_empty() {
            return Ok(0);
        }
        self.store.put_failures(&recovered).await?;
        info!(count = recovered.len(), "items recovered");
        Ok(recovered.len())
    }

    pub async fn statistics(&self) -> Result<FailureStatistics, LedgerError> {
        let records = self.store.query_failures(&FailureQuery::all()).await?;
        let mut stats = FailureStatistics {
            total_failed: records.len(),
            ..Default::default()
        };
        for record in &records {
            if record.is_recovered() {
                stats.recovered += 1;
            } else {
                stats.unrecovered += 1;
            }
            *stats.by_reason.entry(record.reason).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::TimeZone;

    fn id(raw: &str) -> ItemId {
        ItemId::parse(raw).unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn repeated_failures_increment_and_keep_first_timestamp() {
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        ledger
            .record_many_at(vec![(id("RJ000001"), FailureReason::Timeout, "slow".into())], at(1))
            .await
            .unwrap();
        let written = ledger
            .record_many_at(
                vec![
                    (id("RJ000001"), FailureReason::AccessDenied, "403".into()),
                    (id("RJ000002"), FailureReason::NotFound, "404".into()),
                ],
                at(2),
            )
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        let first = written.iter().find(|r| r.item_id == id("RJ000001")).unwrap();
        assert_eq!(first.failure_count, 2);
        assert_eq!(first.first_failed_at, at(1));
        assert_eq!(first.reason, FailureReason::AccessDenied);
    }

    #[tokio::test]
    async fn recovery_marks_without_deleting() {
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        ledger.record(&id("RJ000001"), FailureReason::Unknown, "boom").await.unwrap();
        ledger.record(&id("RJ000002"), FailureReason::NotFound, "404").await.unwrap();

        assert!(ledger.recover(&id("RJ000001")).await.unwrap());
        assert!(!ledger.recover(&id("RJ000001")).await.unwrap());
        assert!(!ledger.recover(&id("RJ000099")).await.unwrap());

        let open = ledger.query(&FailureQuery::default()).await.unwrap();
        assert_eq!(open, vec![id("RJ000002")]);

        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.unrecovered, 1);
        assert_eq!(stats.by_reason[&FailureReason::NotFound], 1);
        assert_eq!(stats.failure_rate(4), 25.0);
    }

    #[tokio::test]
    async fn query_filters_by_count_and_limit() {
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        for hour in 1..=3 {
            let entry = (id("RJ000001"), FailureReason::Timeout, "t".to_string());
            ledger.record_many_at(vec![entry], at(hour)).await.unwrap();
        }
        ledger
            .record_many_at(vec![(id("RJ000002"), FailureReason::Timeout, "t".into())], at(4))
            .await
            .unwrap();
        ledger
            .record_many_at(vec![(id("RJ000003"), FailureReason::Timeout, "t".into())], at(5))
            .await
            .unwrap();

        let repeat = FailureQuery {
            min_failure_count: 2,
            ..Default::default()
        };
        assert_eq!(ledger.query(&repeat).await.unwrap(), vec![id("RJ000001")]);

        let limited = FailureQuery {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(ledger.query(&limited).await.unwrap(), vec![id("RJ000001"), id("RJ000002")]);
    }

    #[tokio::test]
    async fn failure_after_recovery_reopens() {
        let ledger = FailureLedger::new(Arc::new(MemoryStore::new()));
        ledger.record(&id("RJ000001"), FailureReason::Timeout, "t").await.unwrap();
        ledger.recover(&id("RJ000001")).await.unwrap();
        let reopened = ledger.record(&id("RJ000001"), FailureReason::Timeout, "t").await.unwrap();
        assert!(reopened.recovered_at.is_none());
        assert_eq!(reopened.failure_count, 2);
    }
}
