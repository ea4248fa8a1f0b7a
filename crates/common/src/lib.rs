//! Shared types for the wallet purchase system.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{ArtifactId, EntryId, OwnerId, PurchaseId, ReferenceId, ResourceId};
