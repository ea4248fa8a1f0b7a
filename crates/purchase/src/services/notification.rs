//! Notification sink port and adapters.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::{ArtifactId, OwnerId, PurchaseId, ReferenceId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::error::NotificationError;

/// Terminal state a notification reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationStatus {
    Completed { artifact_id: ArtifactId },
    Refunded { reason: String },
    Unreconciled { reference_id: ReferenceId },
}

/// Sent once a charged purchase reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseNotification {
    pub purchase_id: PurchaseId,
    pub owner_id: OwnerId,
    pub resource_id: ResourceId,
    #[serde(flatten)]
    pub status: NotificationStatus,
}

/// Receiver of purchase outcomes (receipts, emails).
///
/// Callers never act on the result beyond logging it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &PurchaseNotification) -> Result<(), NotificationError>;
}

#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    async fn notify(&self, notification: &PurchaseNotification) -> Result<(), NotificationError> {
        (**self).notify(notification).await
    }
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<PurchaseNotification>,
    fail_on_notify: bool,
}

/// Records notifications for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationSink {
    state: Arc<Mutex<InMemoryNotificationState>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryNotificationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_notify(&self, fail: bool) {
        self.state().fail_on_notify = fail;
    }

    pub fn sent(&self) -> Vec<PurchaseNotification> {
        self.state().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, notification: &PurchaseNotification) -> Result<(), NotificationError> {
        let mut state = self.state();
        if state.fail_on_notify {
            return Err(NotificationError("mail relay unavailable".to_string()));
        }
        state.sent.push(notification.clone());
        Ok(())
    }
}

/// Writes one structured log line per outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: &PurchaseNotification) -> Result<(), NotificationError> {
        match &notification.status {
            NotificationStatus::Completed { artifact_id } => tracing::info!(
                purchase_id = %notification.purchase_id,
                owner_id = %notification.owner_id,
                resource_id = %notification.resource_id,
                %artifact_id,
                "purchase receipt"
            ),
            NotificationStatus::Refunded { reason } => tracing::info!(
                purchase_id = %notification.purchase_id,
                owner_id = %notification.owner_id,
                resource_id = %notification.resource_id,
                reason = %reason,
                "purchase refunded"
            ),
            NotificationStatus::Unreconciled { reference_id } => tracing::warn!(
                purchase_id = %notification.purchase_id,
                owner_id = %notification.owner_id,
                resource_id = %notification.resource_id,
                %reference_id,
                "purchase awaiting manual reconciliation"
            ),
        }
        Ok(())
    }
}
