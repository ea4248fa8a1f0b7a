//! Purchase error types.

use common::{OwnerId, PurchaseId, ReferenceId, ResourceId};
use ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur while running a purchase.
///
/// Business rejections (insufficient funds, duplicates, price mismatch) are
/// not errors; they are reported as [`PurchaseOutcome::Rejected`](crate::PurchaseOutcome).
#[derive(Debug, Error)]
pub enum PurchaseError {
    /// The requested resource is not in the catalog.
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// The resource exists but does not offer the requested variant.
    #[error("Resource {resource_id} has no variant '{variant}'")]
    UnknownVariant {
        resource_id: ResourceId,
        variant: String,
    },

    /// The refund of a charged purchase could not be written.
    ///
    /// The wallet stays debited until an operator reconciles it.
    #[error(
        "Refund failed for purchase {purchase_id} (reference {reference_id}, owner {owner_id}): {source}"
    )]
    CompensationFailed {
        purchase_id: PurchaseId,
        reference_id: ReferenceId,
        owner_id: OwnerId,
        #[source]
        source: LedgerError,
    },

    /// Ledger store error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Convenience type alias for purchase results.
pub type Result<T> = std::result::Result<T, PurchaseError>;

/// Errors reported by a fulfillment provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FulfillmentError {
    /// The provider refused the request.
    #[error("Fulfillment rejected: {0}")]
    Rejected(String),

    /// The provider did not answer in time.
    #[error("Fulfillment timed out: {0}")]
    Timeout(String),

    /// Network or server-side failure.
    #[error("Fulfillment transport error: {0}")]
    Transport(String),

    /// The provider answered with an unreadable payload.
    #[error("Fulfillment response could not be decoded: {0}")]
    Decode(String),
}

/// Error returned by a notification sink. Never affects a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Notification failed: {0}")]
pub struct NotificationError(pub String);
