//! Purchase state machine and ledger entry enumerations.

use std::str::FromStr;

use common::PurchaseId;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// The state of a purchase record in its lifecycle.
///
/// State transitions:
/// ```text
/// Processing ──┬──► Completed
///              └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    /// Funds are reserved and fulfillment is pending.
    Processing,

    /// The artifact was issued and linked (terminal state).
    Completed,

    /// Fulfillment failed and the debit was refunded (terminal state).
    Failed,
}

impl PurchaseStatus {
    /// Returns true if the record may move to `next`.
    pub fn can_transition_to(&self, next: PurchaseStatus) -> bool {
        matches!(
            (self, next),
            (PurchaseStatus::Processing, PurchaseStatus::Completed)
                | (PurchaseStatus::Processing, PurchaseStatus::Failed)
        )
    }

    /// Fails with `InvalidTransition` unless the record may move to `next`.
    pub fn ensure_transition(
        &self,
        purchase_id: PurchaseId,
        next: PurchaseStatus,
    ) -> Result<(), LedgerError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransition {
                purchase_id,
                from: *self,
                to: next,
            })
        }
    }

    /// Returns true if a record in this state blocks a new reservation for the
    /// same owner and resource.
    pub fn blocks_reservation(&self) -> bool {
        matches!(self, PurchaseStatus::Processing | PurchaseStatus::Completed)
    }

    /// Returns the state name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Processing => "processing",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(PurchaseStatus::Processing),
            "completed" => Ok(PurchaseStatus::Completed),
            "failed" => Ok(PurchaseStatus::Failed),
            other => Err(LedgerError::Decode(format!("unknown purchase status '{other}'"))),
        }
    }
}

/// Why a ledger entry moved money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryCategory {
    /// Debit for a wallet-funded purchase (negative amount).
    Purchase,
    /// Reversal of a purchase debit (positive amount).
    Refund,
    /// Wallet top-up (positive amount).
    Deposit,
}

impl EntryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryCategory::Purchase => "purchase",
            EntryCategory::Refund => "refund",
            EntryCategory::Deposit => "deposit",
        }
    }
}

impl std::fmt::Display for EntryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryCategory {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(EntryCategory::Purchase),
            "refund" => Ok(EntryCategory::Refund),
            "deposit" => Ok(EntryCategory::Deposit),
            other => Err(LedgerError::Decode(format!("unknown entry category '{other}'"))),
        }
    }
}

/// Status of a ledger entry. Entries are only ever written once committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Completed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Completed => "completed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(EntryStatus::Completed),
            other => Err(LedgerError::Decode(format!("unknown entry status '{other}'"))),
        }
    }
}
