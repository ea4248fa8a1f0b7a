//! Wallet ledger store.
//!
//! The ledger is the only component allowed to mutate wallet balances. Every
//! balance movement is recorded as an append-only [`LedgerEntry`], and purchase
//! reservations are created atomically together with their debit so that two
//! concurrent requests for the same `(owner, resource)` pair can never both be
//! charged.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod status;
pub mod store;

pub use common::{ArtifactId, EntryId, Money, OwnerId, PurchaseId, ReferenceId, ResourceId};
pub use error::{LedgerError, Result};
pub use memory::InMemoryLedgerStore;
pub use model::{
    DeliveryDetails, DepositRequest, LedgerEntry, PurchaseRecord, ReconciliationReport,
    Reservation, ReservationRequest, WalletAccount,
};
pub use postgres::PostgresLedgerStore;
pub use status::{EntryCategory, EntryStatus, PurchaseStatus};
pub use store::{LedgerStore, LedgerStoreExt};
