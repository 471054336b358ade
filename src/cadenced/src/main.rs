//! Cadence — delayed campaign sequencer for the marketing site.
//!
//! Main entry point: initializes the catalog, the durable sequence store,
//! the scheduler, and the HTTP API, then serves until shutdown.

use std::sync::Arc;
use std::time::Duration;

use cadence_api::ApiServer;
use cadence_catalog::CampaignCatalog;
use cadence_core::config::AppConfig;
use cadence_core::event_bus;
use cadence_engine::{
    CancellationGateway, Executor, LogTransport, RetryPolicy, Scheduler, TemplateRenderer,
    TriggerIngestor,
};
use cadence_store::{JournalStore, MemoryStore, SequenceStore};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cadenced")]
#[command(about = "Delayed campaign sequencer daemon")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CADENCE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CADENCE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Sequence journal path (overrides config; empty = in-memory store)
    #[arg(long, env = "CADENCE__STORE__JOURNAL_PATH")]
    journal: Option<String>,

    /// Campaign catalog TOML file (overrides config; built-in when unset)
    #[arg(long, env = "CADENCE__CATALOG__PATH")]
    catalog: Option<String>,

    /// Skip the scheduler (API-only mode; triggers are recorded but no
    /// steps fire on this node)
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadenced=info,cadence_store=info,cadence_engine=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Cadence starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(journal) = cli.journal {
        config.store.journal_path = journal;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog.path = Some(catalog);
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        journal = %config.store.journal_path,
        poll_interval_ms = config.scheduler.poll_interval_ms,
        "Configuration loaded"
    );

    // Load the campaign catalog
    let catalog = Arc::new(match &config.catalog.path {
        Some(path) => CampaignCatalog::from_file(path)?,
        None => CampaignCatalog::builtin(),
    });
    info!(
        version = catalog.version(),
        campaigns = catalog.campaigns().count(),
        "Campaign catalog ready"
    );

    // Open the sequence store; replay queues ambiguous sends for
    // reconciliation before anything fires.
    let store: Arc<dyn SequenceStore> = if config.store.journal_path.is_empty() {
        Arc::new(MemoryStore::new())
    } else {
        let journal = JournalStore::open(&config.store.journal_path)?;
        if config.store.compact_on_open {
            journal.compact()?;
        }
        Arc::new(journal)
    };
    let pending_reconciliation = store.reconciliation_queue().len();
    if pending_reconciliation > 0 {
        error!(
            entries = pending_reconciliation,
            "Sends with unknown outcome await operator reconciliation"
        );
    }

    let events = event_bus::noop_sink();

    let ingestor = Arc::new(TriggerIngestor::new(
        catalog.clone(),
        store.clone(),
        events.clone(),
    ));
    let gateway = Arc::new(CancellationGateway::new(
        catalog.clone(),
        store.clone(),
        events.clone(),
    ));
    let executor = Arc::new(Executor::new(
        store.clone(),
        catalog.clone(),
        Arc::new(TemplateRenderer::builtin()),
        Arc::new(LogTransport),
        RetryPolicy::from_config(&config.delivery),
        events,
        Duration::from_millis(config.delivery.send_timeout_ms),
    ));

    // Start the scheduler (unless API-only mode)
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if !cli.api_only {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            executor,
            config.scheduler.clone(),
        ));
        tokio::spawn(scheduler.run(shutdown_rx));
    } else {
        info!("Running in API-only mode (no steps fire on this node)");
    }

    // Start API server
    let api_server = ApiServer::new(config.clone(), ingestor, gateway, store.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Cadence is ready to serve traffic");

    // Serve HTTP until shutdown signal
    tokio::select! {
        result = api_server.start_http() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}
