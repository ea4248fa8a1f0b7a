//! Caller-facing purchase results.

use common::{ArtifactId, PurchaseId, ReferenceId};
use serde::{Deserialize, Serialize};

/// Why a purchase was refused before any money moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InsufficientFunds,
    DuplicateInFlight,
    PriceMismatch,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientFunds => "insufficient_funds",
            RejectionReason::DuplicateInFlight => "duplicate_in_flight",
            RejectionReason::PriceMismatch => "price_mismatch",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal result of one purchase attempt.
///
/// ```text
/// validate ──► reserve ──┬──► Rejected
///                        ├──► Completed { replayed: true }
///                        └──► fulfill ──┬──► finalize ──┬──► Completed
///                                       │               └──► FailedUnreconciled
///                                       └──► refund ────┬──► FailedRefunded
///                                                       └──► FailedUnreconciled
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    /// The artifact was issued and linked to the purchase.
    Completed {
        purchase_id: PurchaseId,
        artifact_id: ArtifactId,
        /// True when an earlier completed purchase was returned unchanged.
        replayed: bool,
    },

    /// Nothing was written.
    Rejected { reason: RejectionReason },

    /// Fulfillment failed and the charge was reversed.
    FailedRefunded {
        purchase_id: PurchaseId,
        reason: String,
    },

    /// The wallet was charged but the purchase could not be settled.
    /// Needs operator attention.
    FailedUnreconciled {
        purchase_id: PurchaseId,
        reference_id: ReferenceId,
    },
}

impl PurchaseOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PurchaseOutcome::Completed { .. })
    }

    pub fn purchase_id(&self) -> Option<PurchaseId> {
        match self {
            PurchaseOutcome::Completed { purchase_id, .. }
            | PurchaseOutcome::FailedRefunded { purchase_id, .. }
            | PurchaseOutcome::FailedUnreconciled { purchase_id, .. } => Some(*purchase_id),
            PurchaseOutcome::Rejected { .. } => None,
        }
    }
}
