//! Source collaborators: where reindex runs get their records from.
//!
//! A [`RecordSource`] lists the records of one entity type for a tenant,
//! with relations already joined. A [`SourceRegistry`] groups the sources
//! a deployment has; entity types with no registered source are skipped
//! by a reindex run.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::{EntityType, SourceRecord, TenantId};

/// Source of records for one entity type.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Every record of this type belonging to `tenant`.
    async fn list_records(&self, tenant: &TenantId) -> Result<Vec<SourceRecord>, SourceError>;
}

/// Registered sources, keyed by entity type.
#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<EntityType, Box<dyn RecordSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any previous one for the same type.
    pub fn register(&mut self, source: Box<dyn RecordSource>) {
        self.sources.insert(source.entity_type(), source);
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&dyn RecordSource> {
        self.sources.get(&entity_type).map(|s| s.as_ref())
    }

    /// Registered types in reindex visit order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        EntityType::ALL
            .into_iter()
            .filter(|t| self.sources.contains_key(t))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

/// A source backed by records held in memory, per tenant.
///
/// Tenants with no records loaded are reported as unavailable, the way a
/// missing export file is.
pub struct InMemorySource {
    entity_type: EntityType,
    records: RwLock<HashMap<TenantId, Vec<SourceRecord>>>,
}

impl InMemorySource {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Builder form of [`insert`](InMemorySource::insert).
    pub fn with_records(self, tenant: &TenantId, records: Vec<SourceRecord>) -> Self {
        self.insert(tenant, records);
        self
    }

    /// Append records for `tenant`.
    pub fn insert(&self, tenant: &TenantId, records: Vec<SourceRecord>) {
        if let Ok(mut map) = self.records.write() {
            map.entry(tenant.clone()).or_default().extend(records);
        }
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn list_records(&self, tenant: &TenantId) -> Result<Vec<SourceRecord>, SourceError> {
        let map = self
            .records
            .read()
            .map_err(|_| SourceError::Failed(self.entity_type, "lock poisoned".to_string()))?;
        map.get(tenant).cloned().ok_or_else(|| {
            SourceError::Unavailable(self.entity_type, format!("no records loaded for {}", tenant))
        })
    }
}
