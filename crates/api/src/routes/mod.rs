//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod purchases;
pub mod wallets;

use ledger::{OwnerId, PurchaseId};
use uuid::Uuid;

use crate::error::ApiError;

pub(crate) fn parse_owner_id(id: &str) -> Result<OwnerId, ApiError> {
    Uuid::parse_str(id)
        .map(OwnerId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid owner id: {e}")))
}

pub(crate) fn parse_purchase_id(id: &str) -> Result<PurchaseId, ApiError> {
    Uuid::parse_str(id)
        .map(PurchaseId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid purchase id: {e}")))
}
