//! Wallet-funded purchase orchestration.
//!
//! A purchase follows these steps:
//! 1. Validate the resource, variant and price against the catalog
//! 2. Reserve funds in one ledger transaction (duplicate guard included)
//! 3. Ask the fulfillment provider for the artifact, with no transaction open
//! 4. Finalize the purchase, or refund it through the compensation handler
//!
//! Terminal outcomes are reported to a notification sink on a best-effort basis.

pub mod catalog;
pub mod compensation;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod retry;
pub mod services;

pub use catalog::{Catalog, CatalogEntry, CatalogLoadError, InMemoryCatalog};
pub use compensation::CompensationHandler;
pub use error::{FulfillmentError, NotificationError, PurchaseError, Result};
pub use orchestrator::{
    OrchestratorConfig, PurchaseOrchestrator, PurchaseRequest, StaleSweepReport,
};
pub use outcome::{PurchaseOutcome, RejectionReason};
pub use retry::RetryPolicy;
pub use services::{
    FulfillmentProvider, FulfillmentReceipt, FulfillmentRequest, HttpFulfillmentProvider,
    InMemoryFulfillmentProvider, InMemoryNotificationSink, NotificationSink, NotificationStatus,
    PurchaseNotification, TracingNotificationSink,
};
