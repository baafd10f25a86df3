//! Scanmaster server entry point
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 storage
//! unreachable at startup, 3 port bind failure.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scanmaster::catalog::CatalogResolver;
use scanmaster::config::AppConfig;
use scanmaster::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use scanmaster::dispatcher::{HttpAgentClient, TaskDispatcher};
use scanmaster::etl::{AssetNormalizer, EtlReplayService, RawIngestService};
use scanmaster::events::{event_channel, run_event_logger};
use scanmaster::heartbeat::HeartbeatProcessor;
use scanmaster::liveness::LivenessSweeper;
use scanmaster::metrics::MetricsAggregator;
use scanmaster::registry::AgentRegistry;
use scanmaster::rest_api::{AppState, create_app};
use scanmaster::storage::{
    SqliteAgentStore, SqliteCatalogStore, SqliteEtlErrorStore, SqliteMetricsStore,
    SqliteRawAssetStore, SqliteTaskStore, SqliteUnifiedAssetStore,
};
use scanmaster::time_provider::production_time_provider;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STORAGE: i32 = 2;
const EXIT_BIND: i32 = 3;

/// How long in-flight work may drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "scanmaster", about = "Master node for a distributed scanning fleet")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override, e.g. 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(path) => match AppConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("configuration error: {err}");
                return EXIT_CONFIG;
            }
        },
        None => AppConfig::default(),
    };
    if let Some(listen) = cli.listen {
        match listen.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => {
                    config.server.host = host.to_string();
                    config.server.port = port;
                }
                Err(_) => {
                    eprintln!("configuration error: invalid --listen port in {listen}");
                    return EXIT_CONFIG;
                }
            },
            None => {
                eprintln!("configuration error: --listen must be host:port");
                return EXIT_CONFIG;
            }
        }
    }
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err}");
        return EXIT_CONFIG;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanmaster=info".into()),
        )
        .init();
    info!("starting scanmaster");

    let db_path = match DatabasePath::new(&config.storage.path) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "invalid storage path");
            return EXIT_STORAGE;
        }
    };
    let db = match DatabaseConnection::initialize(
        DatabaseConfig::new(db_path).with_pool_size(config.storage.pool_size),
    )
    .await
    {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "storage unreachable");
            return EXIT_STORAGE;
        }
    };
    info!(path = %config.storage.path, "storage ready");

    // Stores
    let agents = Arc::new(SqliteAgentStore::new(db.clone()));
    let metrics_store = Arc::new(SqliteMetricsStore::new(db.clone()));
    let tasks = Arc::new(SqliteTaskStore::new(db.clone()));
    let catalog_store = Arc::new(SqliteCatalogStore::new(db.clone()));
    let raw = Arc::new(SqliteRawAssetStore::new(db.clone()));
    let unified = Arc::new(SqliteUnifiedAssetStore::new(db.clone()));
    let etl_errors = Arc::new(SqliteEtlErrorStore::new(db));

    // Services
    let time = production_time_provider();
    let (events, event_rx) = event_channel();
    let catalog = Arc::new(CatalogResolver::new(
        catalog_store,
        agents.clone(),
        config.catalog.cache_ttl_secs,
        time.clone(),
    ));
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
        events.clone(),
        time.clone(),
    ));
    let metrics = Arc::new(MetricsAggregator::new(metrics_store.clone(), time.clone()));

    let deliverer = match HttpAgentClient::new(
        config.dispatcher.agent_timeout_secs,
        config.dispatcher.agent_token.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    let dispatcher = Arc::new(TaskDispatcher::new(
        tasks,
        agents.clone(),
        metrics_store,
        catalog.clone(),
        deliverer,
        config.dispatcher.clone(),
        config.liveness.stale_after_secs,
        events.clone(),
        time.clone(),
    ));

    let normalizer_wakeup = Arc::new(Notify::new());
    let ingest = Arc::new(RawIngestService::new(
        raw.clone(),
        normalizer_wakeup.clone(),
        time.clone(),
    ));
    let normalizer = Arc::new(AssetNormalizer::new(
        raw.clone(),
        unified.clone(),
        etl_errors.clone(),
        config.etl.clone(),
        normalizer_wakeup,
        time.clone(),
    ));
    let replay = Arc::new(EtlReplayService::new(
        etl_errors,
        raw,
        normalizer.clone(),
        config.etl.replay_limit,
        time.clone(),
    ));

    // Background work
    let cancel = CancellationToken::new();
    let mut background = Vec::new();
    background.push(tokio::spawn(run_event_logger(event_rx)));

    let sweeper = LivenessSweeper::new(agents, config.liveness, events, time);
    background.push(tokio::spawn(sweeper.run(cancel.clone())));
    background.extend(
        dispatcher.spawn_workers(config.dispatcher_workers().as_usize(), &cancel),
    );
    background.extend(normalizer.spawn_workers(config.etl_workers().as_usize(), &cancel));

    match dispatcher.recover_backlog().await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "task backlog recovered"),
        Err(err) => error!(error = %err, "backlog recovery failed"),
    }

    // HTTP surface
    let state = AppState {
        registry,
        heartbeat,
        metrics,
        dispatcher,
        ingest,
        replay,
        unified,
        catalog,
        stale_after: config.liveness.stale_after_secs,
    };
    let app = create_app(state);

    let (listener, addr) = match scanmaster::server::bind(&config.server.host, config.server.port)
        .await
    {
        Ok(bound) => bound,
        Err(err) => {
            error!(error = %err, host = %config.server.host, port = config.server.port, "bind failed");
            return EXIT_BIND;
        }
    };
    info!(%addr, "listening");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.cancel();
        }
    });

    if let Err(err) = scanmaster::server::serve(listener, app, cancel.clone()).await {
        error!(error = %err, "server failed");
    }

    // Drain in-flight dispatch/normalization, then abort stragglers.
    cancel.cancel();
    let drain = futures::future::join_all(&mut background);
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        info!("drain window elapsed, aborting remaining workers");
        for handle in &background {
            handle.abort();
        }
    }

    info!("scanmaster stopped");
    EXIT_OK
}
