use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::{
    ArtifactId, DepositRequest, EntryCategory, LedgerEntry, LedgerError, OwnerId, PurchaseId,
    PurchaseRecord, PurchaseStatus, ReferenceId, Reservation, ReservationRequest, ResourceId,
    Result, WalletAccount, store::LedgerStore,
};

/// Everything the ledger knows about one owner. Guarded by a single mutex so
/// each operation on the owner is atomic.
#[derive(Debug, Default)]
struct WalletShard {
    account: Option<WalletAccount>,
    entries: Vec<LedgerEntry>,
    purchases: Vec<PurchaseRecord>,
}

impl WalletShard {
    fn purchase_mut(&mut self, purchase_id: PurchaseId) -> Result<&mut PurchaseRecord> {
        self.purchases
            .iter_mut()
            .find(|p| p.id == purchase_id)
            .ok_or(LedgerError::PurchaseNotFound(purchase_id))
    }

    /// Appends `entry` and applies it to the balance. Nothing changes on error.
    ///
    /// Mirrors the `unique_entry_reference` constraint and the BIGINT bound of
    /// the PostgreSQL schema.
    fn credit(&mut self, owner_id: OwnerId, entry: LedgerEntry) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.category == entry.category && e.reference_id == entry.reference_id)
        {
            return Err(LedgerError::DuplicateReference(entry.reference_id));
        }

        let current = self
            .account
            .as_ref()
            .map(|a| a.balance)
            .unwrap_or_default();
        let balance = current
            .checked_add(entry.amount)
            .ok_or(LedgerError::InvalidAmount(entry.amount))?;

        let account = self
            .account
            .get_or_insert_with(|| WalletAccount::open(owner_id));
        account.balance = balance;
        account.updated_at = entry.created_at;
        self.entries.push(entry);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FaultInjection {
    compensations: AtomicU32,
    finalizations: AtomicU32,
}

impl FaultInjection {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory ledger store.
///
/// Each owner has its own shard behind a `tokio::sync::Mutex`, so operations
/// for the same owner are serialized while operations for different owners
/// never wait on each other.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    shards: Arc<RwLock<HashMap<OwnerId, Arc<Mutex<WalletShard>>>>>,
    purchase_owners: Arc<RwLock<HashMap<PurchaseId, OwnerId>>>,
    /// Reference ids of all purchases, across owners.
    purchase_references: Arc<RwLock<HashSet<ReferenceId>>>,
    faults: Arc<FaultInjection>,
}

impl InMemoryLedgerStore {
    /// Creates a new empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` compensation writes fail with `Unavailable`.
    pub fn fail_next_compensations(&self, count: u32) {
        self.faults.compensations.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` finalization writes fail with `Unavailable`.
    pub fn fail_next_finalizations(&self, count: u32) {
        self.faults.finalizations.store(count, Ordering::SeqCst);
    }

    async fn shard(&self, owner_id: OwnerId) -> Arc<Mutex<WalletShard>> {
        if let Some(shard) = self.shards.read().await.get(&owner_id) {
            return shard.clone();
        }
        self.shards
            .write()
            .await
            .entry(owner_id)
            .or_default()
            .clone()
    }

    async fn shard_for_purchase(
        &self,
        purchase_id: PurchaseId,
    ) -> Result<Arc<Mutex<WalletShard>>> {
        let owner_id = self
            .purchase_owners
            .read()
            .await
            .get(&purchase_id)
            .copied()
            .ok_or(LedgerError::PurchaseNotFound(purchase_id))?;
        Ok(self.shard(owner_id).await)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id, resource_id = %request.resource_id))]
    async fn reserve_funds(&self, request: ReservationRequest) -> Result<Reservation> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let shard = self.shard(request.owner_id).await;
        let mut wallet = shard.lock().await;

        // Duplicate guard, under the same lock as the debit
        if let Some(existing) = wallet
            .purchases
            .iter()
            .rev()
            .find(|p| p.resource_id == request.resource_id && p.status.blocks_reservation())
        {
            return match existing.status {
                PurchaseStatus::Completed => Ok(Reservation::AlreadyCompleted(existing.clone())),
                _ => Err(LedgerError::DuplicateInFlight {
                    owner_id: request.owner_id,
                    resource_id: request.resource_id.clone(),
                    purchase_id: Some(existing.id),
                }),
            };
        }

        let available = wallet
            .account
            .as_ref()
            .map(|a| a.balance)
            .unwrap_or_default();
        match available.checked_sub(request.amount) {
            Some(remaining) if !remaining.is_negative() => {}
            _ => {
                return Err(LedgerError::InsufficientFunds {
                    owner_id: request.owner_id,
                    requested: request.amount,
                    available,
                });
            }
        }

        // Held across the debit so two owners cannot claim one reference
        let mut references = self.purchase_references.write().await;
        if references.contains(&request.reference_id) {
            return Err(LedgerError::DuplicateReference(request.reference_id));
        }

        let record = PurchaseRecord::processing(&request);
        let entry = LedgerEntry::purchase_debit(&record, request.description.as_str());
        wallet.credit(request.owner_id, entry)?;
        references.insert(record.reference_id.clone());
        drop(references);
        wallet.purchases.push(record.clone());
        self.purchase_owners
            .write()
            .await
            .insert(record.id, record.owner_id);

        Ok(Reservation::Reserved(record))
    }

    #[tracing::instrument(skip(self))]
    async fn finalize_purchase(
        &self,
        purchase_id: PurchaseId,
        artifact_id: &ArtifactId,
    ) -> Result<PurchaseRecord> {
        if FaultInjection::take(&self.faults.finalizations) {
            return Err(LedgerError::Unavailable(
                "injected finalization failure".to_string(),
            ));
        }

        let shard = self.shard_for_purchase(purchase_id).await?;
        let mut wallet = shard.lock().await;
        let record = wallet.purchase_mut(purchase_id)?;

        if record.status == PurchaseStatus::Completed {
            return match &record.artifact_id {
                Some(existing) if existing == artifact_id => Ok(record.clone()),
                Some(existing) => Err(LedgerError::ArtifactConflict {
                    purchase_id,
                    existing: existing.clone(),
                    attempted: artifact_id.clone(),
                }),
                None => Err(LedgerError::Decode(format!(
                    "completed purchase {purchase_id} has no artifact"
                ))),
            };
        }
        record
            .status
            .ensure_transition(purchase_id, PurchaseStatus::Completed)?;

        record.status = PurchaseStatus::Completed;
        record.artifact_id = Some(artifact_id.clone());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    #[tracing::instrument(skip(self))]
    async fn compensate_failure(&self, purchase_id: PurchaseId) -> Result<PurchaseRecord> {
        if FaultInjection::take(&self.faults.compensations) {
            return Err(LedgerError::Unavailable(
                "injected compensation failure".to_string(),
            ));
        }

        let shard = self.shard_for_purchase(purchase_id).await?;
        let mut wallet = shard.lock().await;
        let record = wallet.purchase_mut(purchase_id)?;

        // Already settled either way
        if !record.status.can_transition_to(PurchaseStatus::Failed) {
            return Ok(record.clone());
        }

        let mut failed = record.clone();
        failed.status = PurchaseStatus::Failed;
        failed.updated_at = Utc::now();

        wallet.credit(failed.owner_id, LedgerEntry::refund_for(&failed))?;
        *wallet.purchase_mut(purchase_id)? = failed.clone();

        Ok(failed)
    }

    #[tracing::instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    async fn deposit(&self, request: DepositRequest) -> Result<LedgerEntry> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(request.amount));
        }

        let shard = self.shard(request.owner_id).await;
        let mut wallet = shard.lock().await;

        if let Some(existing) = wallet.entries.iter().find(|e| {
            e.category == EntryCategory::Deposit && e.reference_id == request.reference_id
        }) {
            return Ok(existing.clone());
        }

        let entry = LedgerEntry::deposit(&request);
        wallet.credit(request.owner_id, entry.clone())?;
        Ok(entry)
    }

    async fn get_account(&self, owner_id: OwnerId) -> Result<Option<WalletAccount>> {
        let Some(shard) = self.shards.read().await.get(&owner_id).cloned() else {
            return Ok(None);
        };
        let wallet = shard.lock().await;
        Ok(wallet.account.clone())
    }

    async fn get_purchase(&self, purchase_id: PurchaseId) -> Result<Option<PurchaseRecord>> {
        let shard = match self.shard_for_purchase(purchase_id).await {
            Ok(shard) => shard,
            Err(LedgerError::PurchaseNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let wallet = shard.lock().await;
        Ok(wallet.purchases.iter().find(|p| p.id == purchase_id).cloned())
    }

    async fn find_purchase(
        &self,
        owner_id: OwnerId,
        resource_id: &ResourceId,
    ) -> Result<Option<PurchaseRecord>> {
        let Some(shard) = self.shards.read().await.get(&owner_id).cloned() else {
            return Ok(None);
        };
        let wallet = shard.lock().await;
        Ok(wallet
            .purchases
            .iter()
            .rev()
            .find(|p| &p.resource_id == resource_id)
            .cloned())
    }

    async fn entries_for_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>> {
        let Some(shard) = self.shards.read().await.get(&owner_id).cloned() else {
            return Ok(Vec::new());
        };
        let wallet = shard.lock().await;
        Ok(wallet.entries.clone())
    }

    async fn processing_purchases_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PurchaseRecord>> {
        let shards: Vec<_> = self.shards.read().await.values().cloned().collect();
        let mut stale = Vec::new();
        for shard in shards {
            let wallet = shard.lock().await;
            stale.extend(
                wallet
                    .purchases
                    .iter()
                    .filter(|p| p.status == PurchaseStatus::Processing && p.created_at < cutoff)
                    .cloned(),
            );
        }
        stale.sort_by_key(|p| p.created_at);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LedgerStoreExt, Money};

    async fn funded_store(cents: i64) -> (InMemoryLedgerStore, OwnerId) {
        let store = InMemoryLedgerStore::new();
        let owner = OwnerId::new();
        if cents > 0 {
            store
                .deposit(DepositRequest::new(owner, Money::from_cents(cents), "seed"))
                .await
                .unwrap();
        }
        (store, owner)
    }

    fn request(owner: OwnerId, cents: i64) -> ReservationRequest {
        ReservationRequest::new(owner, "course-101", "digital", Money::from_cents(cents))
    }

    #[tokio::test]
    async fn test_reserve_debits_and_records() {
        let (store, owner) = funded_store(10_000).await;

        let reservation = store.reserve_funds(request(owner, 2599)).await.unwrap();
        let Reservation::Reserved(record) = reservation else {
            panic!("expected a fresh reservation");
        };

        assert_eq!(record.status, PurchaseStatus::Processing);
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(7401));

        let entries = store.entries_for_owner(owner).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].amount, Money::from_cents(-2599));
        assert_eq!(entries[1].category, EntryCategory::Purchase);
        assert_eq!(entries[1].reference_id, record.reference_id);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_wallet_untouched() {
        let (store, owner) = funded_store(1_000).await;

        let result = store.reserve_funds(request(owner, 2599)).await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds { available, .. }) if available == Money::from_cents(1000)
        ));
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(1000));
        assert_eq!(store.entries_for_owner(owner).await.unwrap().len(), 1);
        assert!(
            store
                .find_purchase(owner, &ResourceId::new("course-101"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unfunded_owner_gets_no_wallet_on_rejection() {
        let store = InMemoryLedgerStore::new();
        let owner = OwnerId::new();

        let result = store.reserve_funds(request(owner, 100)).await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        assert!(store.get_account(owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_is_rejected() {
        let (store, owner) = funded_store(10_000).await;

        store.reserve_funds(request(owner, 2599)).await.unwrap();
        let second = store.reserve_funds(request(owner, 2599)).await;

        assert!(matches!(second, Err(LedgerError::DuplicateInFlight { .. })));
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(7401));
    }

    #[tokio::test]
    async fn test_completed_purchase_is_replayed() {
        let (store, owner) = funded_store(10_000).await;

        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();
        let artifact = ArtifactId::new("CERT-0001");
        store.finalize_purchase(record.id, &artifact).await.unwrap();

        let replay = store.reserve_funds(request(owner, 2599)).await.unwrap();
        let Reservation::AlreadyCompleted(existing) = replay else {
            panic!("expected idempotent replay");
        };
        assert_eq!(existing.id, record.id);
        assert_eq!(existing.artifact_id, Some(artifact));
        assert_eq!(store.entries_for_owner(owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();

        let artifact = ArtifactId::new("CERT-0001");
        let first = store.finalize_purchase(record.id, &artifact).await.unwrap();
        let second = store.finalize_purchase(record.id, &artifact).await.unwrap();
        assert_eq!(first, second);

        let conflict = store
            .finalize_purchase(record.id, &ArtifactId::new("CERT-9999"))
            .await;
        assert!(matches!(conflict, Err(LedgerError::ArtifactConflict { .. })));
    }

    #[tokio::test]
    async fn test_compensation_refunds_once() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();

        let failed = store.compensate_failure(record.id).await.unwrap();
        assert_eq!(failed.status, PurchaseStatus::Failed);
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(10_000));

        store.compensate_failure(record.id).await.unwrap();
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(10_000));
        assert_eq!(store.entries_for_owner(owner).await.unwrap().len(), 3);

        let finalize = store
            .finalize_purchase(record.id, &ArtifactId::new("CERT-0001"))
            .await;
        assert!(matches!(finalize, Err(LedgerError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_failed_purchase_allows_new_attempt() {
        let (store, owner) = funded_store(10_000).await;
        let first = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();
        store.compensate_failure(first.id).await.unwrap();

        let second = store.reserve_funds(request(owner, 2599)).await.unwrap();
        assert!(matches!(second, Reservation::Reserved(ref r) if r.id != first.id));
    }

    #[tokio::test]
    async fn test_compensating_completed_purchase_is_noop() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();
        store
            .finalize_purchase(record.id, &ArtifactId::new("CERT-0001"))
            .await
            .unwrap();

        let after = store.compensate_failure(record.id).await.unwrap();
        assert_eq!(after.status, PurchaseStatus::Completed);
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(7401));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();

        store.fail_next_compensations(1);
        assert!(matches!(
            store.compensate_failure(record.id).await,
            Err(LedgerError::Unavailable(_))
        ));
        assert!(store.compensate_failure(record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_deposit_is_idempotent_per_reference() {
        let store = InMemoryLedgerStore::new();
        let owner = OwnerId::new();

        let first = store
            .deposit(DepositRequest::new(owner, Money::from_cents(5000), "topup-1"))
            .await
            .unwrap();
        let again = store
            .deposit(DepositRequest::new(owner, Money::from_cents(5000), "topup-1"))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(5000));

        let invalid = store
            .deposit(DepositRequest::new(owner, Money::from_cents(-1), "topup-2"))
            .await;
        assert!(matches!(invalid, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_deposit_overflowing_balance_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let owner = OwnerId::new();

        store
            .deposit(DepositRequest::new(owner, Money::from_cents(i64::MAX), "topup-max"))
            .await
            .unwrap();
        let overflow = store
            .deposit(DepositRequest::new(owner, Money::from_cents(1), "topup-one"))
            .await;

        assert!(matches!(overflow, Err(LedgerError::InvalidAmount(_))));
        assert_eq!(store.balance(owner).await.unwrap(), Money::from_cents(i64::MAX));
        assert_eq!(store.entries_for_owner(owner).await.unwrap().len(), 1);
        assert!(store.reconcile(owner).await.unwrap().is_balanced);
    }

    #[tokio::test]
    async fn test_refund_overflowing_balance_leaves_purchase_processing() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();
        store
            .deposit(DepositRequest::new(
                owner,
                Money::from_cents(i64::MAX - 7401),
                "topup-max",
            ))
            .await
            .unwrap();

        let result = store.compensate_failure(record.id).await;

        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        let stored = store.get_purchase(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Processing);
        assert_eq!(store.entries_for_owner(owner).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_purchase_reference_is_unique_across_owners() {
        let (store, first_owner) = funded_store(10_000).await;
        let second_owner = OwnerId::new();
        store
            .deposit(DepositRequest::new(second_owner, Money::from_cents(10_000), "seed"))
            .await
            .unwrap();
        let reference = ReferenceId::new("wallet_shared");

        store
            .reserve_funds(request(first_owner, 2599).with_reference(reference.clone()))
            .await
            .unwrap();
        let clash = store
            .reserve_funds(request(second_owner, 2599).with_reference(reference.clone()))
            .await;

        assert!(matches!(clash, Err(LedgerError::DuplicateReference(r)) if r == reference));
        assert_eq!(
            store.balance(second_owner).await.unwrap(),
            Money::from_cents(10_000)
        );
        assert!(
            store
                .find_purchase(second_owner, &ResourceId::new("course-101"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_reconcile_balanced_after_mixed_movements() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();
        store.compensate_failure(record.id).await.unwrap();

        let report = store.reconcile(owner).await.unwrap();
        assert!(report.is_balanced);
        assert_eq!(report.entry_count, 3);
        assert_eq!(report.balance, Money::from_cents(10_000));
    }

    #[tokio::test]
    async fn test_processing_purchases_before_cutoff() {
        let (store, owner) = funded_store(10_000).await;
        let record = store
            .reserve_funds(request(owner, 2599))
            .await
            .unwrap()
            .into_record();

        let stale = store
            .processing_purchases_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, record.id);

        let none = store
            .processing_purchases_before(record.created_at - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
