//! Purchase endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use ledger::{DeliveryDetails, LedgerStore, Money, OwnerId, PurchaseRecord};
use purchase::{
    FulfillmentProvider, InMemoryCatalog, NotificationSink, PurchaseOrchestrator,
    PurchaseOutcome, PurchaseRequest, RejectionReason,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::parse_purchase_id;

/// Orchestrator with the adapters chosen at startup.
pub type AppOrchestrator<L> = PurchaseOrchestrator<
    L,
    Arc<dyn FulfillmentProvider>,
    Arc<dyn NotificationSink>,
    InMemoryCatalog,
>;

/// Shared application state accessible from all handlers.
pub struct AppState<L: LedgerStore + Clone> {
    pub orchestrator: AppOrchestrator<L>,
}

impl<L: LedgerStore + Clone> AppState<L> {
    pub fn ledger(&self) -> &L {
        self.orchestrator.ledger()
    }
}

// -- Request types --

#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    pub owner_id: OwnerId,
    pub resource_id: String,
    pub variant: String,
    pub expected_price_cents: i64,
    #[serde(default)]
    pub delivery: Option<DeliveryDetails>,
}

// -- Response types --

#[derive(Serialize)]
pub struct PurchaseOutcomeResponse {
    #[serde(flatten)]
    pub outcome: PurchaseOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct PurchaseRecordResponse {
    pub id: String,
    pub owner_id: String,
    pub resource_id: String,
    pub variant: String,
    pub price_cents: i64,
    pub reference_id: String,
    pub status: String,
    pub artifact_id: Option<String>,
    pub delivery: Option<DeliveryDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PurchaseRecord> for PurchaseRecordResponse {
    fn from(record: PurchaseRecord) -> Self {
        Self {
            id: record.id.to_string(),
            owner_id: record.owner_id.to_string(),
            resource_id: record.resource_id.to_string(),
            variant: record.variant,
            price_cents: record.price.cents(),
            reference_id: record.reference_id.to_string(),
            status: record.status.to_string(),
            artifact_id: record.artifact_id.map(|a| a.to_string()),
            delivery: record.delivery,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

fn outcome_response(outcome: PurchaseOutcome) -> (StatusCode, Json<PurchaseOutcomeResponse>) {
    let (status, message) = match &outcome {
        PurchaseOutcome::Completed { .. } => (StatusCode::OK, None),
        PurchaseOutcome::Rejected { reason } => {
            let status = match reason {
                RejectionReason::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
                RejectionReason::DuplicateInFlight => StatusCode::CONFLICT,
                RejectionReason::PriceMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (status, None)
        }
        PurchaseOutcome::FailedRefunded { .. } => (
            StatusCode::BAD_GATEWAY,
            Some("The certificate could not be issued. Your wallet has been refunded.".to_string()),
        ),
        PurchaseOutcome::FailedUnreconciled { reference_id, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(format!(
                "Your payment could not be settled. Please contact support with reference {reference_id}."
            )),
        ),
    };

    (status, Json(PurchaseOutcomeResponse { outcome, message }))
}

// -- Handlers --

/// POST /purchases: buy one variant of a resource from the wallet.
#[tracing::instrument(skip(state, req), fields(owner_id = %req.owner_id, resource_id = %req.resource_id))]
pub async fn create<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseOutcomeResponse>), ApiError> {
    let mut request = PurchaseRequest::new(
        req.owner_id,
        req.resource_id,
        req.variant,
        Money::from_cents(req.expected_price_cents),
    );
    if let Some(delivery) = req.delivery {
        request = request.with_delivery(delivery);
    }

    let outcome = state.orchestrator.purchase(request).await?;
    Ok(outcome_response(outcome))
}

/// GET /purchases/{id}: load a purchase record.
#[tracing::instrument(skip(state))]
pub async fn get<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<PurchaseRecordResponse>, ApiError> {
    let purchase_id = parse_purchase_id(&id)?;
    let record = state
        .ledger()
        .get_purchase(purchase_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Purchase {purchase_id} not found")))?;

    Ok(Json(record.into()))
}
