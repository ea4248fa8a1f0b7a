//! Purchase orchestrator: drives one wallet-funded purchase end to end.

use std::time::{Duration, Instant};

use chrono::Utc;
use common::{ArtifactId, Money, OwnerId, PurchaseId, ResourceId};
use ledger::{
    DeliveryDetails, LedgerError, LedgerStore, PurchaseRecord, PurchaseStatus, Reservation,
    ReservationRequest,
};

use crate::catalog::Catalog;
use crate::compensation::CompensationHandler;
use crate::error::{FulfillmentError, PurchaseError, Result};
use crate::outcome::{PurchaseOutcome, RejectionReason};
use crate::retry::RetryPolicy;
use crate::services::{
    FulfillmentProvider, FulfillmentReceipt, FulfillmentRequest, NotificationSink,
    NotificationStatus, PurchaseNotification,
};

/// Timeouts and retry settings of the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Upper bound on one fulfillment call. Expiry counts as a failure.
    pub fulfillment_timeout: Duration,
    /// Upper bound on one notification call.
    pub notification_timeout: Duration,
    /// Applied to the finalize and refund writes.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fulfillment_timeout: Duration::from_secs(10),
            notification_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// A caller's request to buy one variant of a resource.
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub owner_id: OwnerId,
    pub resource_id: ResourceId,
    pub variant: String,
    /// Price the caller was shown; must match the catalog.
    pub expected_price: Money,
    pub delivery: Option<DeliveryDetails>,
}

impl PurchaseRequest {
    pub fn new(
        owner_id: OwnerId,
        resource_id: impl Into<ResourceId>,
        variant: impl Into<String>,
        expected_price: Money,
    ) -> Self {
        Self {
            owner_id,
            resource_id: resource_id.into(),
            variant: variant.into(),
            expected_price,
            delivery: None,
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryDetails) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Result of [`PurchaseOrchestrator::reconcile_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSweepReport {
    /// Purchases refunded and marked `failed`.
    pub compensated: Vec<PurchaseId>,
    /// Purchases whose refund could not be written.
    pub unreconciled: Vec<PurchaseId>,
}

/// Orchestrates wallet-funded purchases.
///
/// Validates against the catalog, reserves funds in one ledger transaction,
/// calls the fulfillment provider with no transaction open, then finalizes
/// or compensates in a fresh transaction. The ledger is the only
/// serialization point; the orchestrator itself holds no state.
pub struct PurchaseOrchestrator<L, F, N, C>
where
    L: LedgerStore,
    F: FulfillmentProvider,
    N: NotificationSink,
    C: Catalog,
{
    ledger: L,
    fulfillment: F,
    notifications: N,
    catalog: C,
    compensation: CompensationHandler<L>,
    config: OrchestratorConfig,
}

impl<L, F, N, C> PurchaseOrchestrator<L, F, N, C>
where
    L: LedgerStore + Clone,
    F: FulfillmentProvider,
    N: NotificationSink,
    C: Catalog,
{
    /// Creates an orchestrator with default timeouts and retries.
    pub fn new(ledger: L, fulfillment: F, notifications: N, catalog: C) -> Self {
        Self::with_config(
            ledger,
            fulfillment,
            notifications,
            catalog,
            OrchestratorConfig::default(),
        )
    }

    pub fn with_config(
        ledger: L,
        fulfillment: F,
        notifications: N,
        catalog: C,
        config: OrchestratorConfig,
    ) -> Self {
        let compensation = CompensationHandler::new(ledger.clone(), config.retry);
        Self {
            ledger,
            fulfillment,
            notifications,
            catalog,
            compensation,
            config,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Runs one purchase.
    ///
    /// Business outcomes, including rejections and failures after the charge,
    /// come back as `Ok`. `Err` means nothing was charged: an unknown
    /// resource or variant, or a store failure during reservation.
    #[tracing::instrument(
        skip(self, request),
        fields(owner_id = %request.owner_id, resource_id = %request.resource_id, variant = %request.variant)
    )]
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseOutcome> {
        metrics::counter!("purchase_attempts_total").increment(1);
        let started = Instant::now();

        let outcome = self.run(request).await;

        metrics::histogram!("purchase_duration_seconds").record(started.elapsed().as_secs_f64());
        if let Ok(outcome) = &outcome {
            record_outcome(outcome);
        }
        outcome
    }

    async fn run(&self, request: PurchaseRequest) -> Result<PurchaseOutcome> {
        // 1. Validate against the catalog
        let entry = self
            .catalog
            .lookup(&request.resource_id)
            .await
            .ok_or_else(|| PurchaseError::ResourceNotFound(request.resource_id.clone()))?;

        let price =
            entry
                .price_for(&request.variant)
                .ok_or_else(|| PurchaseError::UnknownVariant {
                    resource_id: request.resource_id.clone(),
                    variant: request.variant.clone(),
                })?;

        if price != request.expected_price {
            tracing::warn!(
                expected = %request.expected_price,
                catalog = %price,
                "price mismatch, rejecting"
            );
            return Ok(PurchaseOutcome::Rejected {
                reason: RejectionReason::PriceMismatch,
            });
        }

        // 2. Reserve funds (duplicate guard + debit + record, one transaction)
        let description = format!("Certificate: {} ({})", entry.title, request.variant);
        let mut reservation =
            ReservationRequest::new(request.owner_id, request.resource_id, request.variant, price)
                .with_description(description);
        if let Some(delivery) = request.delivery {
            reservation = reservation.with_delivery(delivery);
        }

        let record = match self.ledger.reserve_funds(reservation).await {
            Ok(Reservation::Reserved(record)) => record,
            Ok(Reservation::AlreadyCompleted(record)) => return replay(record),
            Err(LedgerError::InsufficientFunds { .. }) => {
                return Ok(PurchaseOutcome::Rejected {
                    reason: RejectionReason::InsufficientFunds,
                });
            }
            Err(LedgerError::DuplicateInFlight { .. }) => {
                return Ok(PurchaseOutcome::Rejected {
                    reason: RejectionReason::DuplicateInFlight,
                });
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            purchase_id = %record.id,
            reference_id = %record.reference_id,
            amount = %record.price,
            "funds reserved"
        );

        // 3. Fulfill with no transaction open; 4/5. settle in a fresh one
        match self.fulfill(&record).await {
            Ok(receipt) => Ok(self.finalize(&record, receipt.artifact_id).await),
            Err(failure) => Ok(self.compensate(&record, failure).await),
        }
    }

    async fn fulfill(
        &self,
        record: &PurchaseRecord,
    ) -> std::result::Result<FulfillmentReceipt, FulfillmentError> {
        let request = FulfillmentRequest::from(record);
        let timeout = self.config.fulfillment_timeout;
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, self.fulfillment.issue(&request)).await {
            Ok(result) => result,
            Err(_) => Err(FulfillmentError::Timeout(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        };

        metrics::histogram!("fulfillment_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn finalize(&self, record: &PurchaseRecord, artifact_id: ArtifactId) -> PurchaseOutcome {
        let purchase_id = record.id;

        match self
            .config
            .retry
            .run("finalize", || {
                self.ledger.finalize_purchase(purchase_id, &artifact_id)
            })
            .await
        {
            Ok(_) => {
                tracing::info!(%purchase_id, %artifact_id, "purchase completed");
                self.notify(
                    record,
                    NotificationStatus::Completed {
                        artifact_id: artifact_id.clone(),
                    },
                )
                .await;
                PurchaseOutcome::Completed {
                    purchase_id,
                    artifact_id,
                    replayed: false,
                }
            }
            Err(e) => {
                // Charged and issued, but not recorded as completed
                tracing::error!(
                    %purchase_id,
                    reference_id = %record.reference_id,
                    owner_id = %record.owner_id,
                    %artifact_id,
                    error = %e,
                    "artifact issued but purchase could not be finalized"
                );
                self.notify(
                    record,
                    NotificationStatus::Unreconciled {
                        reference_id: record.reference_id.clone(),
                    },
                )
                .await;
                PurchaseOutcome::FailedUnreconciled {
                    purchase_id,
                    reference_id: record.reference_id.clone(),
                }
            }
        }
    }

    async fn compensate(&self, record: &PurchaseRecord, failure: FulfillmentError) -> PurchaseOutcome {
        tracing::warn!(
            purchase_id = %record.id,
            error = %failure,
            "fulfillment failed, reversing charge"
        );

        match self.compensation.reverse(record).await {
            Ok(_) => {
                let reason = failure.to_string();
                self.notify(
                    record,
                    NotificationStatus::Refunded {
                        reason: reason.clone(),
                    },
                )
                .await;
                PurchaseOutcome::FailedRefunded {
                    purchase_id: record.id,
                    reason,
                }
            }
            Err(_) => {
                self.notify(
                    record,
                    NotificationStatus::Unreconciled {
                        reference_id: record.reference_id.clone(),
                    },
                )
                .await;
                PurchaseOutcome::FailedUnreconciled {
                    purchase_id: record.id,
                    reference_id: record.reference_id.clone(),
                }
            }
        }
    }

    /// Best effort. Bounded by the notification timeout; the result is only logged.
    async fn notify(&self, record: &PurchaseRecord, status: NotificationStatus) {
        let notification = PurchaseNotification {
            purchase_id: record.id,
            owner_id: record.owner_id,
            resource_id: record.resource_id.clone(),
            status,
        };

        match tokio::time::timeout(
            self.config.notification_timeout,
            self.notifications.notify(&notification),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(purchase_id = %record.id, error = %e, "notification failed")
            }
            Err(_) => tracing::warn!(purchase_id = %record.id, "notification timed out"),
        }
    }

    /// Refunds every `processing` purchase created more than `older_than` ago.
    ///
    /// Recovers charges left behind when the process died between
    /// reservation and settlement. `older_than` must exceed the fulfillment
    /// timeout by a wide margin, otherwise in-flight purchases get refunded.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_stale(&self, older_than: Duration) -> Result<StaleSweepReport> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - age;
        let stale = self.ledger.processing_purchases_before(cutoff).await?;

        let mut report = StaleSweepReport::default();
        for record in stale {
            match self.compensation.reverse(&record).await {
                Ok(reversed) if reversed.status == PurchaseStatus::Failed => {
                    self.notify(
                        &record,
                        NotificationStatus::Refunded {
                            reason: "purchase abandoned while processing".to_string(),
                        },
                    )
                    .await;
                    metrics::counter!("purchase_refunded_total").increment(1);
                    report.compensated.push(record.id);
                }
                // Settled concurrently
                Ok(_) => {}
                Err(_) => {
                    metrics::counter!("purchase_unreconciled_total").increment(1);
                    report.unreconciled.push(record.id);
                }
            }
        }

        tracing::info!(
            compensated = report.compensated.len(),
            unreconciled = report.unreconciled.len(),
            "stale purchase sweep finished"
        );
        Ok(report)
    }
}

fn replay(record: PurchaseRecord) -> Result<PurchaseOutcome> {
    let artifact_id = record.artifact_id.ok_or_else(|| {
        PurchaseError::Ledger(LedgerError::Decode(format!(
            "completed purchase {} has no artifact",
            record.id
        )))
    })?;
    tracing::info!(purchase_id = %record.id, %artifact_id, "replaying completed purchase");

    Ok(PurchaseOutcome::Completed {
        purchase_id: record.id,
        artifact_id,
        replayed: true,
    })
}

fn record_outcome(outcome: &PurchaseOutcome) {
    match outcome {
        PurchaseOutcome::Completed { replayed, .. } => {
            metrics::counter!("purchase_completed_total", "replayed" => replayed.to_string())
                .increment(1);
        }
        PurchaseOutcome::Rejected { reason } => {
            metrics::counter!("purchase_rejected_total", "reason" => reason.as_str()).increment(1);
        }
        PurchaseOutcome::FailedRefunded { .. } => {
            metrics::counter!("purchase_refunded_total").increment(1);
        }
        PurchaseOutcome::FailedUnreconciled { .. } => {
            metrics::counter!("purchase_unreconciled_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use ledger::{DepositRequest, InMemoryLedgerStore, LedgerStoreExt};

    use super::*;
    use crate::catalog::{CatalogEntry, InMemoryCatalog};
    use crate::services::{InMemoryFulfillmentProvider, InMemoryNotificationSink};

    type TestOrchestrator = PurchaseOrchestrator<
        InMemoryLedgerStore,
        InMemoryFulfillmentProvider,
        InMemoryNotificationSink,
        InMemoryCatalog,
    >;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new([CatalogEntry::new("course-101", "Rust 101")
            .with_variant("digital", Money::from_cents(2599))])
    }

    fn orchestrator() -> (
        TestOrchestrator,
        InMemoryLedgerStore,
        InMemoryFulfillmentProvider,
    ) {
        let ledger = InMemoryLedgerStore::new();
        let fulfillment = InMemoryFulfillmentProvider::new();
        let orchestrator = PurchaseOrchestrator::new(
            ledger.clone(),
            fulfillment.clone(),
            InMemoryNotificationSink::new(),
            catalog(),
        );
        (orchestrator, ledger, fulfillment)
    }

    #[tokio::test]
    async fn test_unknown_resource_is_an_error() {
        let (o, _, fulfillment) = orchestrator();
        let result = o
            .purchase(PurchaseRequest::new(
                OwnerId::new(),
                "missing",
                "digital",
                Money::from_cents(1),
            ))
            .await;
        assert!(matches!(result, Err(PurchaseError::ResourceNotFound(_))));
        assert_eq!(fulfillment.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_variant_is_an_error() {
        let (o, _, _) = orchestrator();
        let result = o
            .purchase(PurchaseRequest::new(
                OwnerId::new(),
                "course-101",
                "framed",
                Money::from_cents(2599),
            ))
            .await;
        assert!(matches!(result, Err(PurchaseError::UnknownVariant { .. })));
    }

    #[tokio::test]
    async fn test_price_mismatch_touches_nothing() {
        let (o, ledger, fulfillment) = orchestrator();
        let owner = OwnerId::new();
        ledger
            .deposit(DepositRequest::new(owner, Money::from_cents(10_000), "seed"))
            .await
            .unwrap();

        let outcome = o
            .purchase(PurchaseRequest::new(
                owner,
                "course-101",
                "digital",
                Money::from_cents(1),
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PurchaseOutcome::Rejected {
                reason: RejectionReason::PriceMismatch
            }
        );
        assert_eq!(ledger.balance(owner).await.unwrap(), Money::from_cents(10_000));
        assert_eq!(ledger.entries_for_owner(owner).await.unwrap().len(), 1);
        assert_eq!(fulfillment.call_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_purchase_links_artifact() {
        let (o, ledger, _) = orchestrator();
        let owner = OwnerId::new();
        ledger
            .deposit(DepositRequest::new(owner, Money::from_cents(10_000), "seed"))
            .await
            .unwrap();

        let outcome = o
            .purchase(PurchaseRequest::new(
                owner,
                "course-101",
                "digital",
                Money::from_cents(2599),
            ))
            .await
            .unwrap();

        let PurchaseOutcome::Completed {
            purchase_id,
            artifact_id,
            replayed,
        } = outcome
        else {
            panic!("expected completed, got {outcome:?}");
        };
        assert!(!replayed);
        let record = ledger.get_purchase(purchase_id).await.unwrap().unwrap();
        assert_eq!(record.status, PurchaseStatus::Completed);
        assert_eq!(record.artifact_id, Some(artifact_id));
    }
}
