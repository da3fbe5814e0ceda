use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{market_day, ItemId, PriceChange, PriceSnapshot, RawRecord};
use tracing::{debug, info, warn};

use crate::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceBatchReport {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub price_changes: usize,
    pub new_campaigns: usize,
}

/// Once-per-day price history with day-over-day change flags.
#[derive(Clone)]
pub struct PriceChangeDetector {
    store: Arc<dyn SnapshotStore>,
}

impl PriceChangeDetector {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    pub async fn record_daily_snapshot(
        &self,
        item_id: &ItemId,
        raw: &RawRecord,
    ) -> Result<bool, StoreError> {
        Ok(self.snapshot_at(item_id, raw, Utc::now()).await?.is_some())
    }

    pub async fn record_daily_snapshot_at(
        &self,
        item_id: &ItemId,
        raw: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.snapshot_at(item_id, raw, now).await?.is_some())
    }

    /// Returns the written snapshot, or `None` when the payload has no price.
    async fn snapshot_at(
        &self,
        item_id: &ItemId,
        raw: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<PriceSnapshot>, StoreError> {
        let Some(point) = raw.price_point() else {
            debug!(item_id = %item_id, "no price fields; snapshot skipped");
            return Ok(None);
        };

        let today = market_day(now);
        // change flags always compare with the previous day, never today's earlier write
        let yesterday = match today.pred_opt() {
            Some(day) => self.store.get_snapshot(item_id, day).await?,
            None => None,
        };
        let change = PriceChange::between(&point, yesterday.as_ref());

        let snapshot = match self.store.get_snapshot(item_id, today).await? {
            Some(mut existing) => {
                existing.merge_same_day(point, change, now);
                existing
            }
            None => PriceSnapshot::new(item_id.clone(), today, point, change, now),
        };
        self.store.put_snapshot(&snapshot).await?;
        Ok(Some(snapshot))
    }

    /// Per-item errors are logged and counted, never propagated.
    pub async fn record_batch_at<'a, I>(&self, records: I, now: DateTime<Utc>) -> PriceBatchReport
    where
        I: IntoIterator<Item = (&'a ItemId, &'a RawRecord)>,
    {
        let mut report = PriceBatchReport::default();
        for (item_id, raw) in records {
            match self.snapshot_at(item_id, raw, now).await {
                Ok(Some(snapshot)) => {
                    report.written += 1;
                    report.price_changes += usize::from(snapshot.price_changed);
                    report.new_campaigns += usize::from(snapshot.new_campaign);
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(item_id = %item_id, error = %err, "price snapshot failed");
                    report.failed += 1;
                }
            }
        }
        if report.price_changes > 0 || report.new_campaigns > 0 {
            info!(
                price_changes = report.price_changes,
                new_campaigns = report.new_campaigns,
                "price changes detected"
            );
        }
        report
    }

    pub async fn history(&self, item_id: &ItemId) -> Result<Vec<PriceSnapshot>, StoreError> {
        self.store.snapshot_history(item_id).await
    }
}
