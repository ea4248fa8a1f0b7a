//! Wallet, ledger entry and purchase record types.

use chrono::{DateTime, Utc};
use common::{ArtifactId, EntryId, Money, OwnerId, PurchaseId, ReferenceId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::status::{EntryCategory, EntryStatus, PurchaseStatus};

/// A user's wallet. Created lazily on the first funded action, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub owner_id: OwnerId,
    /// Current balance. Never negative.
    pub balance: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Creates an empty wallet for `owner_id`.
    pub fn open(owner_id: OwnerId) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            balance: Money::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An immutable record of a single balance movement.
///
/// The sum of all entries of an owner always equals the owner's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub owner_id: OwnerId,
    /// Signed amount: negative for purchases, positive for refunds and deposits.
    pub amount: Money,
    pub category: EntryCategory,
    pub description: String,
    pub reference_id: ReferenceId,
    /// The purchase this entry belongs to, if any.
    pub purchase_id: Option<PurchaseId>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Debit entry recorded when funds are reserved for a purchase.
    pub fn purchase_debit(record: &PurchaseRecord, description: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            owner_id: record.owner_id,
            amount: -record.price,
            category: EntryCategory::Purchase,
            description: description.into(),
            reference_id: record.reference_id.clone(),
            purchase_id: Some(record.id),
            status: EntryStatus::Completed,
            created_at: Utc::now(),
        }
    }

    /// Credit entry that reverses the debit of `record`.
    pub fn refund_for(record: &PurchaseRecord) -> Self {
        Self {
            id: EntryId::new(),
            owner_id: record.owner_id,
            amount: record.price,
            category: EntryCategory::Refund,
            description: format!(
                "Refund for {} ({}): fulfillment failed",
                record.resource_id, record.variant
            ),
            reference_id: record.reference_id.clone(),
            purchase_id: Some(record.id),
            status: EntryStatus::Completed,
            created_at: Utc::now(),
        }
    }

    /// Credit entry for a wallet top-up.
    pub fn deposit(request: &DepositRequest) -> Self {
        Self {
            id: EntryId::new(),
            owner_id: request.owner_id,
            amount: request.amount,
            category: EntryCategory::Deposit,
            description: request.description.clone(),
            reference_id: request.reference_id.clone(),
            purchase_id: None,
            status: EntryStatus::Completed,
            created_at: Utc::now(),
        }
    }
}

/// Optional shipping/delivery information attached to a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryDetails {
    pub recipient_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub address_line2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// A wallet-funded purchase and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub id: PurchaseId,
    pub owner_id: OwnerId,
    pub resource_id: ResourceId,
    pub variant: String,
    pub price: Money,
    /// Shared with the ledger entries of this purchase.
    pub reference_id: ReferenceId,
    pub status: PurchaseStatus,
    /// Set once the fulfillment provider has issued the artifact.
    pub artifact_id: Option<ArtifactId>,
    pub delivery: Option<DeliveryDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseRecord {
    /// Builds the `processing` record created by a reservation.
    pub fn processing(request: &ReservationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: PurchaseId::new(),
            owner_id: request.owner_id,
            resource_id: request.resource_id.clone(),
            variant: request.variant.clone(),
            price: request.amount,
            reference_id: request.reference_id.clone(),
            status: PurchaseStatus::Processing,
            artifact_id: None,
            delivery: request.delivery.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input to [`LedgerStore::reserve_funds`](crate::LedgerStore::reserve_funds).
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub owner_id: OwnerId,
    pub resource_id: ResourceId,
    pub variant: String,
    pub amount: Money,
    pub reference_id: ReferenceId,
    pub description: String,
    pub delivery: Option<DeliveryDetails>,
}

impl ReservationRequest {
    /// Creates a request with a freshly generated reference id.
    pub fn new(
        owner_id: OwnerId,
        resource_id: impl Into<ResourceId>,
        variant: impl Into<String>,
        amount: Money,
    ) -> Self {
        let resource_id = resource_id.into();
        let variant = variant.into();
        let description = format!("Purchase of {resource_id} ({variant})");
        Self {
            owner_id,
            resource_id,
            variant,
            amount,
            reference_id: ReferenceId::generate(),
            description,
            delivery: None,
        }
    }

    /// Uses a caller-supplied reference id.
    pub fn with_reference(mut self, reference_id: ReferenceId) -> Self {
        self.reference_id = reference_id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryDetails) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Result of a successful reservation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Funds were debited and a `processing` record was created.
    Reserved(PurchaseRecord),
    /// A `completed` record already exists; nothing was debited.
    AlreadyCompleted(PurchaseRecord),
}

impl Reservation {
    pub fn record(&self) -> &PurchaseRecord {
        match self {
            Reservation::Reserved(record) | Reservation::AlreadyCompleted(record) => record,
        }
    }

    pub fn into_record(self) -> PurchaseRecord {
        match self {
            Reservation::Reserved(record) | Reservation::AlreadyCompleted(record) => record,
        }
    }
}

/// Input to [`LedgerStore::deposit`](crate::LedgerStore::deposit).
#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub owner_id: OwnerId,
    pub amount: Money,
    /// Deposits are idempotent per `(owner, reference_id)`.
    pub reference_id: ReferenceId,
    pub description: String,
}

impl DepositRequest {
    pub fn new(owner_id: OwnerId, amount: Money, reference_id: impl Into<ReferenceId>) -> Self {
        Self {
            owner_id,
            amount,
            reference_id: reference_id.into(),
            description: "Wallet top-up".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Comparison of a wallet balance against the sum of its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub owner_id: OwnerId,
    pub balance: Money,
    pub entries_total: Money,
    pub entry_count: usize,
    pub is_balanced: bool,
}
