use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_client::{
    BatchFetchCoordinator, CoordinatorConfig, FetchClient, FetchClientConfig, IdentityRotator,
};
use harvest_core::{FailureReason, HarvestCheckpoint, HarvestState, ItemId};
use harvest_store::{
    CheckpointStore, DocumentStore, FailureLedger, FailureQuery, MemoryStore, PersistenceConfig,
    PersistenceLayer, PriceChangeDetector,
};
use harvest_sync::{
    FallbackIdCollector, HarvestOrchestrator, InvocationOutcome, OrchestratorSettings, StaticIdList,
    DEFAULT_RUN_TYPE,
};
use serde_json::json;
use tempfile::NamedTempFile;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IDS: [&str; 5] = ["RJ100001", "RJ100002", "RJ100003", "RJ100004", "RJ100005"];

fn id(raw: &str) -> ItemId {
    ItemId::parse(raw).unwrap()
}

async fn catalog_server(missing: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    for raw in IDS {
        let response = if missing.contains(&raw) {
            ResponseTemplate::new(404)
        } else {
            ResponseTemplate::new(200).set_body_json(json!([{
                "workno": raw,
                "work_name": format!("Work {raw}"),
                "maker_id": "RG00001",
                "maker_name": "Circle",
                "price": 1100,
                "official_price": 1100,
                "dl_count": "42",
                "on_sale": 1
            }]))
        };
        Mock::given(method("GET"))
            .and(path("/api/product.json"))
            .and(query_param("workno", raw))
            .respond_with(response)
            .mount(&server)
            .await;
    }
    server
}

fn id_list(ids: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", json!(ids)).unwrap();
    file
}

fn orchestrator(
    server: &MockServer,
    store: Arc<MemoryStore>,
    ids_path: &Path,
    batch_size: usize,
    time_budget: Duration,
) -> HarvestOrchestrator<MemoryStore> {
    let rotator = Arc::new(IdentityRotator::with_default_profiles(Duration::ZERO).unwrap());
    let client = FetchClient::new(
        FetchClientConfig {
            base_url: format!("{}/api/product.json", server.uri()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        rotator.clone(),
    )
    .unwrap();
    let coordinator = BatchFetchCoordinator::new(
        Arc::new(client),
        CoordinatorConfig {
            max_concurrent: 2,
            inter_group_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            group_timeout: Some(Duration::from_secs(10)),
        },
    );
    let ledger = FailureLedger::new(store.clone());
    let persistence = PersistenceLayer::new(store.clone(), PersistenceConfig::default())
        .with_ledger(ledger.clone());
    let collector = FallbackIdCollector::new(None, Box::new(StaticIdList::new(ids_path)));

    HarvestOrchestrator::new(
        store.clone(),
        coordinator,
        Arc::new(collector),
        persistence,
        ledger,
        PriceChangeDetector::new(store),
        OrchestratorSettings {
            run_type: DEFAULT_RUN_TYPE.to_string(),
            batch_size,
            time_budget,
            batch_delay: Duration::ZERO,
            failure_alert_pct: 30.0,
        },
    )
    .with_rotator(rotator)
}

async fn requested_ids(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|req| {
            req.url
                .query_pairs()
                .find(|(k, _)| k == "workno")
                .map(|(_, v)| v.into_owned())
        })
        .collect()
}

#[tokio::test]
async fn single_invocation_harvests_everything_and_clears_progress() {
    let server = catalog_server(&["RJ100004"]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS);
    let orch = orchestrator(&server, store.clone(), ids.path(), 2, Duration::from_secs(60));

    let summary = orch.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::Completed);
    assert_eq!(summary.batches_processed, vec![0, 1, 2]);
    assert_eq!(summary.items_fetched, 4);
    assert_eq!(summary.items_failed, 1);
    assert_eq!(summary.documents_new, 4);
    assert_eq!(summary.documents_updated, 0);

    assert_eq!(store.count_documents().await.unwrap(), 4);
    let failed = FailureLedger::new(store.clone())
        .records(&FailureQuery::default())
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item_id, id("RJ100004"));
    assert_eq!(failed[0].reason, FailureReason::NotFound);

    let cp = store.load_checkpoint(DEFAULT_RUN_TYPE).await.unwrap().unwrap();
    assert_eq!(cp.state, HarvestState::Completed);
    assert!(!cp.is_in_progress);
    assert!(cp.all_item_ids.is_empty());
    assert!(cp.completed_batches.is_empty());
    assert_eq!(cp.last_completed_total, Some(5));
    assert!(cp.last_successful_completion.is_some());
}

#[tokio::test]
async fn second_run_counts_updates_not_inserts() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS[..2]);
    let orch = orchestrator(&server, store.clone(), ids.path(), 10, Duration::from_secs(60));

    let first = orch.run_invocation().await;
    let second = orch.run_invocation().await;
    assert_eq!(first.documents_new, 2);
    assert_eq!(second.documents_new, 0);
    assert_eq!(second.documents_updated, 2);
    assert_eq!(store.count_documents().await.unwrap(), 2);
}

#[tokio::test]
async fn exhausted_budget_interrupts_and_next_invocation_resumes() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS);

    let starved = orchestrator(&server, store.clone(), ids.path(), 2, Duration::ZERO);
    let summary = starved.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::InterruptedByTimeBudget);
    assert!(summary.batches_processed.is_empty());

    let cp = store.load_checkpoint(DEFAULT_RUN_TYPE).await.unwrap().unwrap();
    assert_eq!(cp.state, HarvestState::InterruptedByTimeBudget);
    assert!(cp.is_in_progress);
    assert_eq!(cp.current_batch_index, 0);
    assert_eq!(cp.total_batches, 3);
    assert_eq!(cp.last_error.as_deref(), Some("time budget exceeded"));
    assert!(requested_ids(&server).await.is_empty());

    let roomy = orchestrator(&server, store.clone(), ids.path(), 2, Duration::from_secs(60));
    let summary = roomy.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::Completed);
    assert_eq!(summary.resumed_from, Some(0));
    assert_eq!(store.count_documents().await.unwrap(), 5);
}

#[tokio::test]
async fn resume_skips_batches_already_completed() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS);

    let universe: Vec<ItemId> = IDS.iter().map(|raw| id(raw)).collect();
    let mut seeded =
        HarvestCheckpoint::begin(DEFAULT_RUN_TYPE, universe, 2, None, Utc::now()).unwrap();
    seeded.mark_batch_completed(0, 2, Utc::now()).unwrap();
    seeded.mark_batch_completed(1, 2, Utc::now()).unwrap();
    store.save_checkpoint(&seeded).await.unwrap();

    let orch = orchestrator(&server, store.clone(), ids.path(), 2, Duration::from_secs(60));
    let summary = orch.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::Completed);
    assert_eq!(summary.resumed_from, Some(2));
    assert_eq!(summary.batches_processed, vec![2]);
    assert_eq!(requested_ids(&server).await, vec!["RJ100005".to_string()]);
}

#[tokio::test]
async fn tampered_checkpoint_is_discarded_and_run_starts_over() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS[..2]);

    let universe = vec![id("RJ100001"), id("RJ100002")];
    let mut seeded =
        HarvestCheckpoint::begin(DEFAULT_RUN_TYPE, universe, 1, None, Utc::now()).unwrap();
    seeded.ids_digest = Some("not-the-digest".to_string());
    seeded.current_batch_index = 1;
    seeded.completed_batches = vec![0];
    store.save_checkpoint(&seeded).await.unwrap();

    let orch = orchestrator(&server, store.clone(), ids.path(), 1, Duration::from_secs(60));
    let summary = orch.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::Completed);
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.batches_processed, vec![0, 1]);
}

#[tokio::test]
async fn missing_id_sources_fail_the_invocation_without_leaving_progress() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(
        &server,
        store.clone(),
        Path::new("/nonexistent/fallback-ids.json"),
        2,
        Duration::from_secs(60),
    );

    let summary = orch.run_invocation().await;
    assert!(matches!(summary.outcome, InvocationOutcome::Failed(_)));

    let cp = store.load_checkpoint(DEFAULT_RUN_TYPE).await.unwrap().unwrap();
    assert!(!cp.is_in_progress);
    assert_eq!(cp.state, HarvestState::NotStarted);
    assert!(cp.last_error.is_some());
    assert!(requested_ids(&server).await.is_empty());
}

#[tokio::test]
async fn failed_collection_keeps_previous_completion_history() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS[..2]);
    let first = orchestrator(&server, store.clone(), ids.path(), 2, Duration::from_secs(60));
    assert_eq!(first.run_invocation().await.outcome, InvocationOutcome::Completed);
    let completed = store.load_checkpoint(DEFAULT_RUN_TYPE).await.unwrap().unwrap();

    let broken = orchestrator(
        &server,
        store.clone(),
        Path::new("/nonexistent/fallback-ids.json"),
        2,
        Duration::from_secs(60),
    );
    let summary = broken.run_invocation().await;
    assert!(matches!(summary.outcome, InvocationOutcome::Failed(_)));

    let cp = store.load_checkpoint(DEFAULT_RUN_TYPE).await.unwrap().unwrap();
    assert_eq!(cp.state, HarvestState::NotStarted);
    assert!(cp.last_error.is_some());
    assert_eq!(cp.last_completed_total, Some(2));
    assert_eq!(cp.last_successful_completion, completed.last_successful_completion);
}

#[tokio::test]
async fn checkpoint_skipping_batches_is_not_resumed() {
    let server = catalog_server(&[]).await;
    let store = Arc::new(MemoryStore::new());
    let ids = id_list(&IDS);

    let universe: Vec<ItemId> = IDS.iter().map(|raw| id(raw)).collect();
    let mut seeded =
        HarvestCheckpoint::begin(DEFAULT_RUN_TYPE, universe, 2, None, Utc::now()).unwrap();
    seeded.current_batch_index = 2;
    store.save_checkpoint(&seeded).await.unwrap();

    let orch = orchestrator(&server, store.clone(), ids.path(), 2, Duration::from_secs(60));
    let summary = orch.run_invocation().await;
    assert_eq!(summary.outcome, InvocationOutcome::Completed);
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.batches_processed, vec![0, 1, 2]);

    let mut requested = requested_ids(&server).await;
    requested.sort();
    assert_eq!(requested, IDS.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    assert_eq!(store.count_documents().await.unwrap(), 5);
}
