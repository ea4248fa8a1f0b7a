use common::{ArtifactId, Money, OwnerId, PurchaseId, ReferenceId, ResourceId};
use thiserror::Error;

use crate::status::PurchaseStatus;

/// Errors that can occur when interacting with the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The wallet balance does not cover the requested debit.
    #[error("Insufficient funds for owner {owner_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        owner_id: OwnerId,
        requested: Money,
        available: Money,
    },

    /// Another purchase for the same owner and resource is still processing.
    #[error("Purchase of {resource_id} for owner {owner_id} is already in flight")]
    DuplicateInFlight {
        owner_id: OwnerId,
        resource_id: ResourceId,
        purchase_id: Option<PurchaseId>,
    },

    /// The purchase record was not found.
    #[error("Purchase not found: {0}")]
    PurchaseNotFound(PurchaseId),

    /// The purchase cannot move between the given states.
    #[error("Purchase {purchase_id} cannot move from {from} to {to}")]
    InvalidTransition {
        purchase_id: PurchaseId,
        from: PurchaseStatus,
        to: PurchaseStatus,
    },

    /// The purchase was already finalized with a different artifact.
    #[error("Purchase {purchase_id} already linked to artifact {existing}, refusing {attempted}")]
    ArtifactConflict {
        purchase_id: PurchaseId,
        existing: ArtifactId,
        attempted: ArtifactId,
    },

    /// The amount is not strictly positive, or applying it would overflow
    /// the balance.
    #[error("Invalid amount: {0}")]
    InvalidAmount(Money),

    /// The reference id is already used by another purchase or entry.
    #[error("Reference {0} is already in use")]
    DuplicateReference(ReferenceId),

    /// The store is temporarily unable to serve the request.
    #[error("Ledger store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be decoded.
    #[error("Corrupt ledger row: {0}")]
    Decode(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Returns true for failures caused by the store rather than by the request,
    /// which are worth retrying.
    ///
    /// Constraint violations are never transient. Of the database-reported
    /// errors only serialization failures (`40001`) and deadlocks (`40P01`)
    /// are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Unavailable(_) => true,
            LedgerError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => {
                    matches!(db_err.code().as_deref(), Some("40001" | "40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
