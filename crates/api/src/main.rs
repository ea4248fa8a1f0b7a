//! API server entry point.

use std::sync::Arc;

use api::StartupError;
use api::config::{Config, LogFormat};
use ledger::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use metrics_exporter_prometheus::PrometheusHandle;
use purchase::{
    FulfillmentProvider, HttpFulfillmentProvider, InMemoryCatalog, InMemoryFulfillmentProvider,
    NotificationSink, TracingNotificationSink,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn fulfillment_provider(config: &Config) -> Result<Arc<dyn FulfillmentProvider>, StartupError> {
    match &config.fulfillment_url {
        Some(raw) => {
            let endpoint = Url::parse(raw)?;
            tracing::info!(%endpoint, "using HTTP fulfillment provider");
            let provider = HttpFulfillmentProvider::new(endpoint, config.fulfillment_timeout)
                .map_err(|e| StartupError::FulfillmentClient(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        None => {
            tracing::warn!("FULFILLMENT_URL not set, issuing certificates in memory");
            Ok(Arc::new(InMemoryFulfillmentProvider::new()))
        }
    }
}

fn load_catalog(config: &Config) -> Result<InMemoryCatalog, StartupError> {
    match &config.catalog_file {
        Some(path) => {
            let catalog = InMemoryCatalog::from_file(path)?;
            tracing::info!(path = %path.display(), resources = catalog.len(), "catalog loaded");
            Ok(catalog)
        }
        None => {
            tracing::warn!("CATALOG_FILE not set, starting with an empty catalog");
            Ok(InMemoryCatalog::default())
        }
    }
}

async fn serve<L: LedgerStore + Clone + 'static>(
    config: Config,
    ledger: L,
    metrics_handle: PrometheusHandle,
) -> Result<(), StartupError> {
    let fulfillment = fulfillment_provider(&config)?;
    let notifications: Arc<dyn NotificationSink> = Arc::new(TracingNotificationSink);
    let catalog = load_catalog(&config)?;

    let state = api::create_state(
        ledger,
        fulfillment,
        notifications,
        catalog,
        config.orchestrator_config(),
    );

    // Recover purchases left in `processing` by a previous crash
    let sweeper = api::spawn_stale_sweeper(
        state.clone(),
        config.stale_purchase_after,
        config.stale_sweep_interval,
    );

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let config = Config::from_env();
    config.validate()?;

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the ledger backend and run
    match config.database_url.clone() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&database_url)
                .await?;
            let ledger = PostgresLedgerStore::new(pool);
            ledger.run_migrations().await?;
            tracing::info!("using PostgreSQL ledger");
            serve(config, ledger, metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory ledger");
            serve(config, InMemoryLedgerStore::new(), metrics_handle).await
        }
    }
}
