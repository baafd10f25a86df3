//! Shared wiring for black-box tests: the full service stack over a
//! throwaway database, with a hand-advanced clock and a recording
//! delivery fake instead of real Agent HTTP.

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

use scanmaster::catalog::CatalogResolver;
use scanmaster::config::AppConfig;
use scanmaster::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use scanmaster::dispatcher::{RecordingDeliverer, TaskDispatcher};
use scanmaster::domain_types::{CapabilityId, ScanType, TagId, TagType};
use scanmaster::etl::{AssetNormalizer, EtlReplayService, RawIngestService};
use scanmaster::events::{EventReceiver, event_channel};
use scanmaster::heartbeat::HeartbeatProcessor;
use scanmaster::liveness::LivenessSweeper;
use scanmaster::metrics::MetricsAggregator;
use scanmaster::registry::AgentRegistry;
use scanmaster::rest_api::AppState;
use scanmaster::storage::{
    SqliteAgentStore, SqliteCatalogStore, SqliteEtlErrorStore, SqliteMetricsStore,
    SqliteRawAssetStore, SqliteTaskStore, SqliteUnifiedAssetStore,
};
use scanmaster::time_provider::{MockTimeProvider, SharedTimeProvider};

pub struct Harness {
    pub state: AppState,
    pub registry: Arc<AgentRegistry>,
    pub heartbeat: Arc<HeartbeatProcessor>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub ingest: Arc<RawIngestService>,
    pub normalizer: Arc<AssetNormalizer>,
    pub replay: Arc<EtlReplayService>,
    pub sweeper: LivenessSweeper,
    pub deliverer: Arc<RecordingDeliverer>,
    pub clock: MockTimeProvider,
    pub events: EventReceiver,
    pub tasks: Arc<SqliteTaskStore>,
    pub unified: Arc<SqliteUnifiedAssetStore>,
    // Held so the database file outlives the harness.
    _dir: TempDir,
}

/// Builds the whole stack with default settings and seeds the catalog
/// with two capabilities (ids "1", "2") on tag "t1".
pub async fn harness() -> Harness {
    harness_with(AppConfig::default()).await
}

pub async fn harness_with(config: AppConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = DatabasePath::new(dir.path().join("harness.db")).expect("db path");
    let db = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
        .await
        .expect("database");

    let agents = Arc::new(SqliteAgentStore::new(db.clone()));
    let metrics_store = Arc::new(SqliteMetricsStore::new(db.clone()));
    let tasks = Arc::new(SqliteTaskStore::new(db.clone()));
    let catalog_store = Arc::new(SqliteCatalogStore::new(db.clone()));
    let raw = Arc::new(SqliteRawAssetStore::new(db.clone()));
    let unified = Arc::new(SqliteUnifiedAssetStore::new(db.clone()));
    let etl_errors = Arc::new(SqliteEtlErrorStore::new(db));

    let clock = MockTimeProvider::new();
    let time: SharedTimeProvider = Arc::new(clock.clone());
    let (events_tx, events_rx) = event_channel();

    let catalog = Arc::new(CatalogResolver::new(
        catalog_store,
        agents.clone(),
        config.catalog.cache_ttl_secs,
        time.clone(),
    ));
    seed_catalog(&catalog).await;

    let registry = Arc::new(AgentRegistry::new(
        agents.clone(),
        metrics_store.clone(),
        tasks.clone(),
        catalog.clone(),
        time.clone(),
    ));
    let heartbeat = Arc::new(HeartbeatProcessor::new(
        agents.clone(),
        metrics_store.clone(),
        events_tx.clone(),
        time.clone(),
    ));
    let metrics = Arc::new(MetricsAggregator::new(metrics_store.clone(), time.clone()));

    let deliverer = Arc::new(RecordingDeliverer::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        tasks.clone(),
        agents.clone(),
        metrics_store,
        catalog.clone(),
        deliverer.clone(),
        config.dispatcher.clone(),
        config.liveness.stale_after_secs,
        events_tx.clone(),
        time.clone(),
    ));

    let wakeup = Arc::new(Notify::new());
    let ingest = Arc::new(RawIngestService::new(raw.clone(), wakeup.clone(), time.clone()));
    let normalizer = Arc::new(AssetNormalizer::new(
        raw.clone(),
        unified.clone(),
        etl_errors.clone(),
        config.etl.clone(),
        wakeup,
        time.clone(),
    ));
    let replay = Arc::new(EtlReplayService::new(
        etl_errors,
        raw,
        normalizer.clone(),
        config.etl.replay_limit,
        time.clone(),
    ));
    let sweeper = LivenessSweeper::new(agents, config.liveness, events_tx, time);

    let state = AppState {
        registry: registry.clone(),
        heartbeat: heartbeat.clone(),
        metrics,
        dispatcher: dispatcher.clone(),
        ingest: ingest.clone(),
        replay: replay.clone(),
        unified: unified.clone(),
        catalog,
        stale_after: config.liveness.stale_after_secs,
    };

    Harness {
        state,
        registry,
        heartbeat,
        dispatcher,
        ingest,
        normalizer,
        replay,
        sweeper,
        deliverer,
        clock,
        events: events_rx,
        tasks,
        unified,
        _dir: dir,
    }
}

async fn seed_catalog(catalog: &CatalogResolver) {
    catalog
        .create_tag(&TagType {
            id: TagId::try_new("t1".to_string()).unwrap(),
            name: "scan".to_string(),
            category: "capability".to_string(),
        })
        .await
        .unwrap();
    for (id, name) in [("1", "portscan"), ("2", "webfinger")] {
        catalog
            .create_scan_type(&ScanType {
                id: CapabilityId::try_new(id.to_string()).unwrap(),
                name: name.to_string(),
                is_active: true,
                tag_id: TagId::try_new("t1".to_string()).unwrap(),
            })
            .await
            .unwrap();
    }
}
