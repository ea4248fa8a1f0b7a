//! Catalog of purchasable resources and their variant prices.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, ResourceId};
use serde::{Deserialize, Serialize};

/// A purchasable resource with one price per variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub resource_id: ResourceId,
    pub title: String,
    /// Variant name (e.g. `digital`, `printed`) to price.
    pub variants: BTreeMap<String, Money>,
}

impl CatalogEntry {
    pub fn new(resource_id: impl Into<ResourceId>, title: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            title: title.into(),
            variants: BTreeMap::new(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>, price: Money) -> Self {
        self.variants.insert(variant.into(), price);
        self
    }

    pub fn price_for(&self, variant: &str) -> Option<Money> {
        self.variants.get(variant).copied()
    }
}

/// Source of authoritative prices.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn lookup(&self, resource_id: &ResourceId) -> Option<CatalogEntry>;
}

#[async_trait]
impl<T: Catalog + ?Sized> Catalog for Arc<T> {
    async fn lookup(&self, resource_id: &ResourceId) -> Option<CatalogEntry> {
        (**self).lookup(resource_id).await
    }
}

/// Error loading a catalog file.
#[derive(Debug, thiserror::Error)]
pub enum CatalogLoadError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fixed catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: Arc<HashMap<ResourceId, CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.resource_id.clone(), entry))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Parses a JSON array of [`CatalogEntry`].
    pub fn from_json(json: &str) -> Result<Self, CatalogLoadError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        Ok(Self::new(entries))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogLoadError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn lookup(&self, resource_id: &ResourceId) -> Option<CatalogEntry> {
        self.entries.get(resource_id).cloned()
    }
}
