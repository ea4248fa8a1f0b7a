//! Compensation handler: reverses the debit of an unfulfilled purchase.

use ledger::{LedgerStore, PurchaseRecord};

use crate::error::{PurchaseError, Result};
use crate::retry::RetryPolicy;

/// Refunds charged purchases whose fulfillment failed.
///
/// The refund write is retried with backoff. When it still cannot be
/// written, the purchase is left `processing` and debited, and the handler
/// reports [`PurchaseError::CompensationFailed`] with enough context for an
/// operator to settle it by hand.
#[derive(Debug, Clone)]
pub struct CompensationHandler<L> {
    ledger: L,
    retry: RetryPolicy,
}

impl<L: LedgerStore> CompensationHandler<L> {
    pub fn new(ledger: L, retry: RetryPolicy) -> Self {
        Self { ledger, retry }
    }

    /// Refunds `record` and marks it `failed`.
    ///
    /// Already terminal records are returned unchanged.
    #[tracing::instrument(skip(self, record), fields(purchase_id = %record.id, owner_id = %record.owner_id))]
    pub async fn reverse(&self, record: &PurchaseRecord) -> Result<PurchaseRecord> {
        let purchase_id = record.id;

        match self
            .retry
            .run("compensate", || self.ledger.compensate_failure(purchase_id))
            .await
        {
            Ok(reversed) => {
                tracing::info!(
                    %purchase_id,
                    status = %reversed.status,
                    refunded = %reversed.price,
                    "purchase compensated"
                );
                Ok(reversed)
            }
            Err(source) => {
                tracing::error!(
                    %purchase_id,
                    reference_id = %record.reference_id,
                    owner_id = %record.owner_id,
                    amount = %record.price,
                    error = %source,
                    "refund failed, purchase needs manual reconciliation"
                );
                metrics::counter!("compensation_failures_total").increment(1);
                Err(PurchaseError::CompensationFailed {
                    purchase_id,
                    reference_id: record.reference_id.clone(),
                    owner_id: record.owner_id,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{Money, OwnerId};
    use ledger::{
        DepositRequest, InMemoryLedgerStore, LedgerStoreExt, PurchaseStatus, ReservationRequest,
    };

    use super::*;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn reserved(ledger: &InMemoryLedgerStore) -> PurchaseRecord {
        let owner = OwnerId::new();
        ledger
            .deposit(DepositRequest::new(owner, Money::from_cents(10_000), "seed"))
            .await
            .unwrap();
        ledger
            .reserve_funds(ReservationRequest::new(
                owner,
                "course-101",
                "digital",
                Money::from_cents(2599),
            ))
            .await
            .unwrap()
            .into_record()
    }

    #[tokio::test]
    async fn test_reverse_refunds() {
        let ledger = InMemoryLedgerStore::new();
        let record = reserved(&ledger).await;
        let handler = CompensationHandler::new(ledger.clone(), fast_retry(3));

        let reversed = handler.reverse(&record).await.unwrap();
        assert_eq!(reversed.status, PurchaseStatus::Failed);
        assert_eq!(
            ledger.balance(record.owner_id).await.unwrap(),
            Money::from_cents(10_000)
        );
    }

    #[tokio::test]
    async fn test_reverse_survives_transient_outage() {
        let ledger = InMemoryLedgerStore::new();
        let record = reserved(&ledger).await;
        ledger.fail_next_compensations(2);
        let handler = CompensationHandler::new(ledger.clone(), fast_retry(3));

        let reversed = handler.reverse(&record).await.unwrap();
        assert_eq!(reversed.status, PurchaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_reverse_reports_exhausted_retries() {
        let ledger = InMemoryLedgerStore::new();
        let record = reserved(&ledger).await;
        ledger.fail_next_compensations(10);
        let handler = CompensationHandler::new(ledger.clone(), fast_retry(3));

        let err = handler.reverse(&record).await.unwrap_err();
        match err {
            PurchaseError::CompensationFailed {
                purchase_id,
                reference_id,
                ..
            } => {
                assert_eq!(purchase_id, record.id);
                assert_eq!(reference_id, record.reference_id);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Still debited and processing
        let stored = ledger.get_purchase(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Processing);
        assert_eq!(
            ledger.balance(record.owner_id).await.unwrap(),
            Money::from_cents(7401)
        );
    }
}
