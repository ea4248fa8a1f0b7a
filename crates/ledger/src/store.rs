use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ArtifactId, Money, OwnerId, PurchaseId, ResourceId};

use crate::{
    DepositRequest, LedgerEntry, LedgerError, PurchaseRecord, ReconciliationReport, Reservation,
    ReservationRequest, Result, WalletAccount,
};

/// Core trait for ledger store implementations.
///
/// The store is the only component permitted to mutate wallet balances or
/// append ledger entries and purchase records. Every mutating method is a
/// single atomic unit: either all of its writes commit or none do.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically reserves funds for a purchase.
    ///
    /// Within one atomic scope this:
    /// 1. looks for a `processing` or `completed` record for the same owner and
    ///    resource. A `completed` one is returned as
    ///    [`Reservation::AlreadyCompleted`]; a `processing` one fails with
    ///    `DuplicateInFlight`;
    /// 2. debits the wallet only if the balance covers the amount, failing
    ///    with `InsufficientFunds` otherwise;
    /// 3. appends a negative `purchase` entry;
    /// 4. creates a `processing` purchase record.
    async fn reserve_funds(&self, request: ReservationRequest) -> Result<Reservation>;

    /// Marks a purchase `completed` and links the issued artifact.
    ///
    /// Calling this again with the same artifact is a no-op.
    async fn finalize_purchase(
        &self,
        purchase_id: PurchaseId,
        artifact_id: &ArtifactId,
    ) -> Result<PurchaseRecord>;

    /// Refunds a `processing` purchase and marks it `failed`.
    ///
    /// Records that are already terminal are returned unchanged.
    async fn compensate_failure(&self, purchase_id: PurchaseId) -> Result<PurchaseRecord>;

    /// Credits a wallet, creating it if needed.
    ///
    /// Idempotent per `(owner, reference_id)`: a repeated deposit returns the
    /// original entry without crediting again.
    async fn deposit(&self, request: DepositRequest) -> Result<LedgerEntry>;

    /// Gets a wallet. Returns None for owners that never funded anything.
    async fn get_account(&self, owner_id: OwnerId) -> Result<Option<WalletAccount>>;

    /// Gets a purchase record by id.
    async fn get_purchase(&self, purchase_id: PurchaseId) -> Result<Option<PurchaseRecord>>;

    /// Gets the most recent purchase record for an owner and resource.
    async fn find_purchase(
        &self,
        owner_id: OwnerId,
        resource_id: &ResourceId,
    ) -> Result<Option<PurchaseRecord>>;

    /// Retrieves all entries of an owner, oldest first.
    async fn entries_for_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>>;

    /// Retrieves `processing` purchases created before `cutoff`.
    async fn processing_purchases_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PurchaseRecord>>;
}

/// Extension trait providing convenience methods for ledger stores.
#[async_trait]
pub trait LedgerStoreExt: LedgerStore {
    /// Current balance; zero for owners without a wallet.
    async fn balance(&self, owner_id: OwnerId) -> Result<Money> {
        Ok(self
            .get_account(owner_id)
            .await?
            .map(|account| account.balance)
            .unwrap_or(Money::ZERO))
    }

    /// Checks that the balance equals the sum of all entries.
    async fn reconcile(&self, owner_id: OwnerId) -> Result<ReconciliationReport> {
        let balance = self.balance(owner_id).await?;
        let entries = self.entries_for_owner(owner_id).await?;
        let entries_total = Money::checked_sum(entries.iter().map(|e| e.amount))
            .ok_or_else(|| {
                LedgerError::Decode(format!("entries of owner {owner_id} overflow their total"))
            })?;

        Ok(ReconciliationReport {
            owner_id,
            balance,
            entries_total,
            entry_count: entries.len(),
            is_balanced: balance == entries_total,
        })
    }
}

// Blanket implementation for all LedgerStore implementations
impl<T: LedgerStore + ?Sized> LedgerStoreExt for T {}
