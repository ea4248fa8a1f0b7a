//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ledger::LedgerError;
use purchase::{CatalogLoadError, PurchaseError};
use thiserror::Error;

use crate::config::ConfigError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Ledger store error.
    Ledger(LedgerError),
    /// Purchase error.
    Purchase(PurchaseError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Ledger(err) => ledger_error_to_response(err),
            ApiError::Purchase(err) => purchase_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn ledger_error_to_response(err: LedgerError) -> (StatusCode, String) {
    match &err {
        LedgerError::PurchaseNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        LedgerError::InsufficientFunds { .. } => (StatusCode::PAYMENT_REQUIRED, err.to_string()),
        LedgerError::DuplicateInFlight { .. }
        | LedgerError::DuplicateReference(_)
        | LedgerError::InvalidTransition { .. }
        | LedgerError::ArtifactConflict { .. } => (StatusCode::CONFLICT, err.to_string()),
        LedgerError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn purchase_error_to_response(err: PurchaseError) -> (StatusCode, String) {
    match err {
        PurchaseError::ResourceNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        PurchaseError::UnknownVariant { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        PurchaseError::Ledger(ledger_err) => ledger_error_to_response(ledger_err),
        PurchaseError::CompensationFailed { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl From<PurchaseError> for ApiError {
    fn from(err: PurchaseError) -> Self {
        ApiError::Purchase(err)
    }
}

/// Errors that abort server startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to install Prometheus recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to load catalog: {0}")]
    Catalog(#[from] CatalogLoadError),

    #[error("invalid FULFILLMENT_URL: {0}")]
    FulfillmentUrl(#[from] url::ParseError),

    #[error("failed to build fulfillment client: {0}")]
    FulfillmentClient(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
