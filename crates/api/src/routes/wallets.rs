//! Wallet balance, ledger history, deposits and reconciliation.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use ledger::{DepositRequest, LedgerEntry, LedgerStore, LedgerStoreExt, Money};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::parse_owner_id;
use crate::routes::purchases::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct DepositBody {
    pub amount_cents: i64,
    pub reference_id: String,
    pub description: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct WalletResponse {
    pub owner_id: String,
    pub balance_cents: i64,
    pub balance: String,
}

#[derive(Serialize)]
pub struct EntryResponse {
    pub id: String,
    pub amount_cents: i64,
    pub category: String,
    pub description: String,
    pub reference_id: String,
    pub purchase_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            amount_cents: entry.amount.cents(),
            category: entry.category.to_string(),
            description: entry.description,
            reference_id: entry.reference_id.to_string(),
            purchase_id: entry.purchase_id.map(|id| id.to_string()),
            status: entry.status.as_str().to_string(),
            created_at: entry.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ReconciliationResponse {
    pub owner_id: String,
    pub balance_cents: i64,
    pub entries_total_cents: i64,
    pub entry_count: usize,
    pub is_balanced: bool,
}

// -- Handlers --

/// GET /wallets/{owner_id}: current balance; zero for unknown owners.
#[tracing::instrument(skip(state))]
pub async fn get<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(owner_id): Path<String>,
) -> Result<Json<WalletResponse>, ApiError> {
    let owner_id = parse_owner_id(&owner_id)?;
    let balance = state.ledger().balance(owner_id).await?;

    Ok(Json(WalletResponse {
        owner_id: owner_id.to_string(),
        balance_cents: balance.cents(),
        balance: balance.to_string(),
    }))
}

/// GET /wallets/{owner_id}/entries: ledger entries, oldest first.
#[tracing::instrument(skip(state))]
pub async fn entries<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(owner_id): Path<String>,
) -> Result<Json<Vec<EntryResponse>>, ApiError> {
    let owner_id = parse_owner_id(&owner_id)?;
    let entries = state.ledger().entries_for_owner(owner_id).await?;

    Ok(Json(entries.into_iter().map(EntryResponse::from).collect()))
}

/// POST /wallets/{owner_id}/deposits: top up a wallet. Idempotent per reference id.
#[tracing::instrument(skip(state, body))]
pub async fn deposit<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(owner_id): Path<String>,
    Json(body): Json<DepositBody>,
) -> Result<(StatusCode, Json<EntryResponse>), ApiError> {
    let owner_id = parse_owner_id(&owner_id)?;
    if body.reference_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "reference_id must not be blank".to_string(),
        ));
    }

    let mut request = DepositRequest::new(
        owner_id,
        Money::from_cents(body.amount_cents),
        body.reference_id,
    );
    if let Some(description) = body.description {
        request = request.with_description(description);
    }

    let entry = state.ledger().deposit(request).await?;
    metrics::counter!("wallet_deposits_total").increment(1);
    tracing::info!(entry_id = %entry.id, amount = %entry.amount, "deposit recorded");

    Ok((StatusCode::CREATED, Json(entry.into())))
}

/// GET /wallets/{owner_id}/reconciliation: balance against the sum of entries.
#[tracing::instrument(skip(state))]
pub async fn reconciliation<L: LedgerStore + Clone + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(owner_id): Path<String>,
) -> Result<Json<ReconciliationResponse>, ApiError> {
    let owner_id = parse_owner_id(&owner_id)?;
    let report = state.ledger().reconcile(owner_id).await?;

    if !report.is_balanced {
        tracing::error!(
            %owner_id,
            balance = %report.balance,
            entries_total = %report.entries_total,
            "wallet out of balance"
        );
    }

    Ok(Json(ReconciliationResponse {
        owner_id: owner_id.to_string(),
        balance_cents: report.balance.cents(),
        entries_total_cents: report.entries_total.cents(),
        entry_count: report.entry_count,
        is_balanced: report.is_balanced,
    }))
}
