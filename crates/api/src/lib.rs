//! HTTP API server for wallet-funded purchases.
//!
//! Exposes the purchase flow, wallet balances, ledger history and
//! reconciliation over REST, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use ledger::LedgerStore;
use metrics_exporter_prometheus::PrometheusHandle;
use purchase::{
    FulfillmentProvider, InMemoryCatalog, InMemoryFulfillmentProvider, NotificationSink,
    OrchestratorConfig, PurchaseOrchestrator, TracingNotificationSink,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, StartupError};
use routes::purchases::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L: LedgerStore + Clone + 'static>(
    state: Arc<AppState<L>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/purchases", post(routes::purchases::create::<L>))
        .route("/purchases/{id}", get(routes::purchases::get::<L>))
        .route("/wallets/{owner_id}", get(routes::wallets::get::<L>))
        .route(
            "/wallets/{owner_id}/entries",
            get(routes::wallets::entries::<L>),
        )
        .route(
            "/wallets/{owner_id}/deposits",
            post(routes::wallets::deposit::<L>),
        )
        .route(
            "/wallets/{owner_id}/reconciliation",
            get(routes::wallets::reconciliation::<L>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state from explicit adapters.
pub fn create_state<L: LedgerStore + Clone + 'static>(
    ledger: L,
    fulfillment: Arc<dyn FulfillmentProvider>,
    notifications: Arc<dyn NotificationSink>,
    catalog: InMemoryCatalog,
    config: OrchestratorConfig,
) -> Arc<AppState<L>> {
    let orchestrator =
        PurchaseOrchestrator::with_config(ledger, fulfillment, notifications, catalog, config);
    Arc::new(AppState { orchestrator })
}

/// Creates the default application state: in-memory fulfillment and
/// log-based notifications.
pub fn create_default_state<L: LedgerStore + Clone + 'static>(
    ledger: L,
    catalog: InMemoryCatalog,
) -> Arc<AppState<L>> {
    create_state(
        ledger,
        Arc::new(InMemoryFulfillmentProvider::new()),
        Arc::new(TracingNotificationSink),
        catalog,
        OrchestratorConfig::default(),
    )
}

/// Periodically refunds purchases stuck in `processing` for longer than `older_than`.
pub fn spawn_stale_sweeper<L: LedgerStore + Clone + 'static>(
    state: Arc<AppState<L>>,
    older_than: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = state.orchestrator.reconcile_stale(older_than).await {
                tracing::error!(error = %e, "stale purchase sweep failed");
            }
        }
    })
}
