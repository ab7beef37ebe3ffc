//! Storage abstraction for Knowledge Harness.
//!
//! The [`Store`] trait defines every persistence operation the indexing
//! and retrieval pipeline needs, so backends are pluggable (SQLite in the
//! app crate, [`memory::InMemoryStore`] here).
//!
//! Every method takes the tenant explicitly. Backends must never return
//! or modify documents belonging to another tenant.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::hash::content_hash;
use crate::models::{Document, EntityType, TenantId};

/// Result of a [`Store::upsert`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new document was written; carries its id.
    Inserted(String),
    /// A document with the same `(tenant, content_hash)` already exists;
    /// carries the existing id. Nothing was written.
    AlreadyIndexed(String),
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::AlreadyIndexed(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, UpsertOutcome::AlreadyIndexed(_))
    }
}

/// Pre-filter applied by [`Store::scan`] before any scoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    /// Restrict to these types. Empty means all types.
    pub entity_types: Vec<EntityType>,
    /// Only documents updated at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
}

impl ScanFilter {
    pub fn matches(&self, doc: &Document) -> bool {
        (self.entity_types.is_empty() || self.entity_types.contains(&doc.entity_type))
            && self.updated_since.map_or(true, |since| doc.updated_at >= since)
    }
}

/// Abstract tenant-scoped document store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Store::upsert) | Insert unless the content hash is already indexed |
/// | [`get`](Store::get) | Fetch a document by content hash |
/// | [`delete_all_for_tenant`](Store::delete_all_for_tenant) | Clear a tenant before a full rebuild |
/// | [`delete_for_entity`](Store::delete_for_entity) | Release one source entity's documents |
/// | [`entity_refs`](Store::entity_refs) | Source entities a document stands for |
/// | [`scan`](Store::scan) | Stream a tenant's documents for scoring |
/// | [`count_by_type`](Store::count_by_type) | Per-type document counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Embedding dimension every stored vector must have.
    fn dims(&self) -> usize;

    /// Insert-or-skip keyed on `(tenant, content_hash)`.
    ///
    /// Either way the document records `doc`'s source entity as one of its
    /// references, so entities whose content collapsed onto one document
    /// all keep it alive.
    async fn upsert(&self, tenant: &TenantId, doc: &Document) -> Result<UpsertOutcome, StoreError>;

    /// Look a document up by its content hash.
    async fn get(&self, tenant: &TenantId, content_hash: &str) -> Result<Option<Document>, StoreError>;

    /// Remove every document of `tenant`, returning how many were removed.
    async fn delete_all_for_tenant(&self, tenant: &TenantId) -> Result<u64, StoreError>;

    /// Drop one source entity's references.
    ///
    /// A document is removed once no entity references it; one still
    /// referenced by another entity stays and is re-attributed to it.
    /// Returns how many documents were removed.
    async fn delete_for_entity(
        &self,
        tenant: &TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<u64, StoreError>;

    /// Entities referencing a document, ordered by `(entity_type, entity_id)`.
    async fn entity_refs(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<(EntityType, String)>, StoreError>;

    /// All of `tenant`'s documents passing `filter`, in unspecified order.
    async fn scan(&self, tenant: &TenantId, filter: &ScanFilter) -> Result<Vec<Document>, StoreError>;

    async fn count_by_type(&self, tenant: &TenantId) -> Result<BTreeMap<EntityType, u64>, StoreError>;
}

/// Checks every backend applies before writing a document.
pub fn validate_document(tenant: &TenantId, doc: &Document, dims: usize) -> Result<(), StoreError> {
    if &doc.tenant_id != tenant {
        return Err(StoreError::TenantMismatch {
            requested: tenant.to_string(),
            document: doc.tenant_id.to_string(),
        });
    }
    if doc.embedding.len() != dims {
        return Err(StoreError::DimensionMismatch {
            expected: dims,
            actual: doc.embedding.len(),
        });
    }
    if doc.embedding.iter().any(|x| !x.is_finite()) {
        return Err(StoreError::InvalidVector);
    }
    let computed = content_hash(&doc.content);
    if computed != doc.content_hash {
        return Err(StoreError::HashMismatch {
            supplied: doc.content_hash.clone(),
            computed,
        });
    }
    Ok(())
}
