use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_client::{BatchFetchCoordinator, IdentityRotator};
use harvest_core::{map_raw_record, CheckpointError, FailureReason, HarvestCheckpoint, ItemId};
use harvest_store::{FailureLedger, HarvestStore, PersistenceLayer, PriceChangeDetector};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{FallbackIdCollector, HarvestError};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub run_type: String,
    pub batch_size: usize,
    pub time_budget: Duration,
    pub batch_delay: Duration,
    pub failure_alert_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed,
    InterruptedByTimeBudget,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InvocationSummary {
    pub run_id: Uuid,
    pub outcome: InvocationOutcome,
    pub resumed_from: Option<usize>,
    pub batches_processed: Vec<usize>,
    pub total_batches: usize,
    pub items_fetched: usize,
    pub items_failed: usize,
    pub documents_new: usize,
    pub documents_updated: usize,
    pub documents_failed: usize,
    pub snapshots_written: usize,
    pub elapsed: Duration,
}

impl InvocationSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            outcome: InvocationOutcome::Failed("not started".to_string()),
            resumed_from: None,
            batches_processed: Vec::new(),
            total_batches: 0,
            items_fetched: 0,
            items_failed: 0,
            documents_new: 0,
            documents_updated: 0,
            documents_failed: 0,
            snapshots_written: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Checkpointed, resumable, budget-limited harvest over the whole id universe.
///
/// One invocation processes whole batches until the universe is done or the
/// wall-clock budget runs out, saving the checkpoint after every batch. Errors
/// never escape `run_invocation`; they land in the checkpoint and the logs.
pub struct HarvestOrchestrator<S> {
    store: Arc<S>,
    coordinator: BatchFetchCoordinator,
    collector: Arc<FallbackIdCollector>,
    persistence: PersistenceLayer,
    ledger: FailureLedger,
    prices: PriceChangeDetector,
    rotator: Option<Arc<IdentityRotator>>,
    settings: OrchestratorSettings,
}

impl<S: HarvestStore + 'static> HarvestOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        coordinator: BatchFetchCoordinator,
        collector: Arc<FallbackIdCollector>,
        persistence: PersistenceLayer,
        ledger: FailureLedger,
        prices: PriceChangeDetector,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            coordinator,
            collector,
            persistence,
            ledger,
            prices,
            rotator: None,
            settings,
        }
    }

    pub fn with_rotator(mut self, rotator: Arc<IdentityRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn checkpoint(&self) -> Result<Option<HarvestCheckpoint>, HarvestError> {
        Ok(self.store.load_checkpoint(&self.settings.run_type).await?)
    }

    pub async fn run_invocation(&self) -> InvocationSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_invocation", %run_id, run_type = %self.settings.run_type);

        async {
            let started = Instant::now();
            let mut summary = InvocationSummary::new(run_id);
            let mut checkpoint = None;

            match self.drive(started, &mut checkpoint, &mut summary).await {
                Ok(outcome) => summary.outcome = outcome,
                Err(err) => {
                    error!(error = %err, "harvest invocation failed");
                    self.record_failure(checkpoint, &err).await;
                    summary.outcome = InvocationOutcome::Failed(err.to_string());
                }
            }

            if let Some(rotator) = &self.rotator {
                rotator.log_summary();
            }
            summary.elapsed = started.elapsed();
            info!(
                outcome = ?summary.outcome,
                batches = summary.batches_processed.len(),
                fetched = summary.items_fetched,
                failed = summary.items_failed,
                new_documents = summary.documents_new,
                updated_documents = summary.documents_updated,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "harvest invocation finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        started: Instant,
        slot: &mut Option<HarvestCheckpoint>,
        summary: &mut InvocationSummary,
    ) -> Result<InvocationOutcome, HarvestError> {
        let stored = self.load_valid_checkpoint().await?;

        let checkpoint = match stored {
            Some(cp) if cp.is_resumable() => {
                info!(
                    batch = cp.current_batch_index,
                    total_batches = cp.total_batches,
                    "resuming harvest from checkpoint"
                );
                summary.resumed_from = Some(cp.current_batch_index);
                slot.insert(cp)
            }
            previous => {
                // held in the slot so a failed id collection keeps the completion history
                *slot = previous;
                let ids = self.collector.collect_ids().await?;
                let fresh = HarvestCheckpoint::begin(
                    self.settings.run_type.clone(),
                    ids,
                    self.settings.batch_size,
                    slot.as_ref(),
                    Utc::now(),
                )?;
                info!(
                    items = fresh.all_item_ids.len(),
                    total_batches = fresh.total_batches,
                    "starting new harvest"
                );
                self.store.save_checkpoint(&fresh).await?;
                slot.insert(fresh)
            }
        };
        summary.total_batches = checkpoint.total_batches;

        for index in checkpoint.current_batch_index..checkpoint.total_batches {
            if started.elapsed() >= self.settings.time_budget {
                checkpoint.interrupt_for_budget(index, Utc::now())?;
                self.store.save_checkpoint(checkpoint).await?;
                info!(
                    batch = index,
                    remaining = checkpoint.total_batches - index,
                    "time budget exhausted; will resume next invocation"
                );
                return Ok(InvocationOutcome::InterruptedByTimeBudget);
            }

            let batch: Vec<ItemId> =
                checkpoint.batch(index).map(<[ItemId]>::to_vec).unwrap_or_default();
            self.process_batch(index, &batch, summary)
                .instrument(info_span!("harvest_batch", batch = index))
                .await?;

            checkpoint.mark_batch_completed(index, batch.len(), Utc::now())?;
            self.store.save_checkpoint(checkpoint).await?;
            summary.batches_processed.push(index);

            if index + 1 < checkpoint.total_batches {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        let universe = checkpoint.all_item_ids.len();
        if !checkpoint.is_complete() {
            return Err(CheckpointError::Incomplete {
                completed: checkpoint.completed_batches.len(),
                total: checkpoint.total_batches,
            }
            .into());
        }
        checkpoint.complete(Utc::now());
        self.store.save_checkpoint(checkpoint).await?;
        info!(items = universe, "harvest completed");
        self.check_failure_rate(universe).await;
        Ok(InvocationOutcome::Completed)
    }

    /// Invalid in-progress checkpoints are discarded so the run starts fresh. The
    /// discarded checkpoint is still returned so its completion history carries over.
    async fn load_valid_checkpoint(&self) -> Result<Option<HarvestCheckpoint>, HarvestError> {
        let loaded = match self.store.load_checkpoint(&self.settings.run_type).await {
            Ok(loaded) => loaded,
            Err(harvest_store::StoreError::Corrupt { key, detail }) => {
                warn!(%key, %detail, "unreadable checkpoint discarded");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(match loaded {
            Some(cp) => match cp.validate() {
                Ok(()) => Some(cp),
                Err(err) => {
                    warn!(error = %err, "invalid checkpoint discarded; starting fresh");
                    let mut discarded = cp;
                    discarded.fail(format!("discarded invalid checkpoint: {err}"), Utc::now());
                    Some(discarded)
                }
            },
            None => None,
        })
    }

    async fn process_batch(
        &self,
        index: usize,
        batch: &[ItemId],
        summary: &mut InvocationSummary,
    ) -> Result<(), HarvestError> {
        let fetched = self.coordinator.fetch_many(batch).await;
        summary.items_fetched += fetched.succeeded.len();
        summary.items_failed += fetched.failed_ids.len();

        let mut failures: Vec<(ItemId, FailureReason, String)> = fetched
            .failed_ids
            .iter()
            .map(|id| match fetched.failures.get(id) {
                Some(failure) => (id.clone(), failure.reason, failure.detail.clone()),
                None => (id.clone(), FailureReason::Unknown, "fetch failed".to_string()),
            })
            .collect();

        let now = Utc::now();
        let mut documents = Vec::with_capacity(fetched.succeeded.len());
        let mut key_owner: HashMap<String, ItemId> =
            HashMap::with_capacity(fetched.succeeded.len());
        for (item_id, raw) in &fetched.succeeded {
            match map_raw_record(raw, now) {
                Ok(doc) => {
                    key_owner.insert(doc.product_id.clone(), item_id.clone());
                    documents.push(doc);
                }
                Err(err) => failures.push((
                    item_id.clone(),
                    FailureReason::ValidationError,
                    err.to_string(),
                )),
            }
        }
        documents.sort_by(|a, b| a.product_id.cmp(&b.product_id));

        if !failures.is_empty() {
            if let Err(err) = self.ledger.record_many_at(failures, now).await {
                warn!(batch = index, error = %err, "could not write failure records");
            }
        }

        let keys: Vec<String> = documents.iter().map(|d| d.product_id.clone()).collect();
        let existing = self.persistence.existing_keys(&keys).await;
        let report = self.persistence.persist(&documents).await?;

        let failed: HashSet<&str> = report.failed_keys.iter().map(String::as_str).collect();
        let new_committed = keys
            .iter()
            .filter(|k| !failed.contains(k.as_str()) && !existing.contains(*k))
            .count();
        let updated_committed = report.committed.saturating_sub(new_committed);
        summary.documents_new += new_committed;
        summary.documents_updated += updated_committed;
        summary.documents_failed += report.failed;

        let recovered: Vec<ItemId> = keys
            .iter()
            .filter(|k| !failed.contains(k.as_str()))
            .filter_map(|k| key_owner.get(k).cloned())
            .collect();
        if let Err(err) = self.ledger.recover_many_at(&recovered, now).await {
            warn!(batch = index, error = %err, "could not mark recovered items");
        }

        let prices = self.prices.record_batch_at(fetched.succeeded.iter(), now).await;
        summary.snapshots_written += prices.written;

        info!(
            batch = index,
            fetched = fetched.succeeded.len(),
            failed = fetched.failed_ids.len(),
            new_documents = new_committed,
            updated_documents = updated_committed,
            "batch processed"
        );
        Ok(())
    }

    async fn check_failure_rate(&self, universe: usize) {
        match self.ledger.statistics().await {
            Ok(stats) => {
                let rate = stats.failure_rate(universe);
                if rate > self.settings.failure_alert_pct {
                    warn!(
                        failure_pct = %format!("{rate:.1}"),
                        threshold_pct = self.settings.failure_alert_pct,
                        unrecovered = stats.unrecovered,
                        by_reason = ?stats.by_reason,
                        "failure rate above alert threshold"
                    );
                } else {
                    info!(
                        failure_pct = %format!("{rate:.1}"),
                        unrecovered = stats.unrecovered,
                        "failure rate"
                    );
                }
            }
            Err(err) => warn!(error = %err, "could not compute failure statistics"),
        }
    }

    /// Only an invocation that never read a stored checkpoint falls back to a blank one.
    async fn record_failure(&self, checkpoint: Option<HarvestCheckpoint>, err: &HarvestError) {
        let now = Utc::now();
        let mut checkpoint = checkpoint
            .unwrap_or_else(|| HarvestCheckpoint::not_started(self.settings.run_type.clone(), now));
        checkpoint.fail(err.to_string(), now);
        if let Err(save_err) = self.store.save_checkpoint(&checkpoint).await {
            error!(error = %save_err, "could not persist failed checkpoint");
        }
    }
}
