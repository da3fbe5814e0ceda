use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use harvest_core::{FailureReason, ItemId, RawRecord};
use rand::Rng;
use tracing::{info, warn};

use crate::{FetchOutcome, ItemFetcher};

const FAILED_ID_LOG_LIMIT: usize = 20;

fn panicked() -> (FailureReason, String) {
    (FailureReason::Unknown, "group fetch panicked".to_string())
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrent: usize,
    pub inter_group_delay: Duration,
    /// Random extra delay in `[0, jitter]` added to each inter-group sleep.
    pub jitter: Duration,
    pub group_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            inter_group_delay: Duration::from_millis(400),
            jitter: Duration::from_millis(400),
            group_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct BatchFetchOutcome {
    pub succeeded: HashMap<ItemId, RawRecord>,
    pub failed_ids: Vec<ItemId>,
    pub failures: HashMap<ItemId, FetchFailure>,
}

impl BatchFetchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed_ids.len()
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.failed_ids.len() as f64 / self.total() as f64 * 100.0
    }

    fn fail(&mut self, item_id: ItemId, reason: FailureReason, detail: String) {
        self.failures.insert(item_id.clone(), FetchFailure { reason, detail });
        self.failed_ids.push(item_id);
    }
}

/// Fans item ids out in concurrency-bounded groups with a pause between groups.
#[derive(Clone)]
pub struct BatchFetchCoordinator {
    fetcher: Arc<dyn ItemFetcher>,
    config: CoordinatorConfig,
}

impl BatchFetchCoordinator {
    pub fn new(fetcher: Arc<dyn ItemFetcher>, config: CoordinatorConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn fetch_many(&self, item_ids: &[ItemId]) -> BatchFetchOutcome {
        let mut outcome = BatchFetchOutcome::default();
        let groups: Vec<&[ItemId]> = item_ids.chunks(self.config.max_concurrent.max(1)).collect();
        let group_count = groups.len();

        for (idx, group) in groups.into_iter().enumerate() {
            self.fetch_group(group, &mut outcome).await;
            if idx + 1 < group_count {
                tokio::time::sleep(self.next_delay()).await;
            }
        }

        self.log_summary(&outcome);
        outcome
    }

    async fn fetch_group(&self, group: &[ItemId], outcome: &mut BatchFetchOutcome) {
        let fetches = join_all(group.iter().map(|item_id| self.fetcher.fetch_outcome(item_id)));
        let guarded = AssertUnwindSafe(fetches).catch_unwind();

        let results = match self.config.group_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(joined) => joined.map_err(|_| panicked()),
                Err(_) => Err((
                    FailureReason::Timeout,
                    format!("group exceeded {}s", limit.as_secs()),
                )),
            },
            None => guarded.await.map_err(|_| panicked()),
        };

        let results = match results {
            Ok(results) => results,
            Err((reason, detail)) => {
                warn!(group_size = group.len(), %reason, %detail, "whole fetch group failed");
                for item_id in group {
                    outcome.fail(item_id.clone(), reason, detail.clone());
                }
                return;
            }
        };

        for (item_id, result) in group.iter().zip(results) {
            match result {
                Ok(FetchOutcome::Found(record)) => {
                    outcome.succeeded.insert(item_id.clone(), record);
                }
                Ok(FetchOutcome::SoftMiss(kind)) => {
                    let detail = kind.describe().to_string();
                    outcome.fail(item_id.clone(), kind.failure_reason(), detail);
                }
                Err(err) => {
                    warn!(item_id = %item_id, error = %err, "item fetch failed");
                    outcome.fail(item_id.clone(), err.failure_reason(), err.to_string());
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.inter_group_delay;
        }
        let extra = rand::rng().random_range(0..=jitter_ms);
        self.config.inter_group_delay + Duration::from_millis(extra)
    }

    fn log_summary(&self, outcome: &BatchFetchOutcome) {
        info!(
            total = outcome.total(),
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed_ids.len(),
            failure_pct = %format!("{:.1}", outcome.failure_rate()),
            "batch fetch finished"
        );
        if !outcome.failed_ids.is_empty() && outcome.failed_ids.len() <= FAILED_ID_LOG_LIMIT {
            let ids: Vec<&str> = outcome.failed_ids.iter().map(ItemId::as_str).collect();
            warn!(failed_ids = ?ids, "failed item ids");
        }
    }
}
