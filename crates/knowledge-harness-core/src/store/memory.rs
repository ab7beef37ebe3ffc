//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! Documents live in per-tenant maps behind one `std::sync::RwLock`, so the
//! hash check and the insert in [`Store::upsert`] happen under the same
//! write guard and concurrent duplicates resolve to a single document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Document, EntityType, TenantId};

use super::{validate_document, ScanFilter, Store, UpsertOutcome};

type EntityRef = (EntityType, String);

#[derive(Default)]
struct TenantDocs {
    by_id: HashMap<String, Document>,
    /// content_hash -> document id
    by_hash: HashMap<String, String>,
    /// document id -> entities whose content collapsed onto it
    refs: HashMap<String, BTreeSet<EntityRef>>,
}

impl TenantDocs {
    /// Drop `entity`'s references. Documents left without any are removed;
    /// documents that still have one are re-pointed at a survivor.
    fn release(&mut self, entity: &EntityRef) -> u64 {
        let held: Vec<String> = self
            .refs
            .iter()
            .filter(|(_, refs)| refs.contains(entity))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in held {
            let survivor = self.refs.get_mut(&id).and_then(|refs| {
                refs.remove(entity);
                refs.iter().next().cloned()
            });
            match survivor {
                Some((entity_type, entity_id)) => {
                    if let Some(doc) = self.by_id.get_mut(&id) {
                        if doc.entity_type == entity.0 && doc.entity_id == entity.1 {
                            doc.entity_type = entity_type;
                            doc.entity_id = entity_id;
                        }
                    }
                }
                None => {
                    self.refs.remove(&id);
                    if let Some(doc) = self.by_id.remove(&id) {
                        self.by_hash.remove(&doc.content_hash);
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

/// In-memory store.
pub struct InMemoryStore {
    dims: usize,
    tenants: RwLock<HashMap<TenantId, TenantDocs>>,
}

impl InMemoryStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TenantId, TenantDocs>>, StoreError> {
        self.tenants
            .read()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TenantId, TenantDocs>>, StoreError> {
        self.tenants
            .write()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, tenant: &TenantId, doc: &Document) -> Result<UpsertOutcome, StoreError> {
        validate_document(tenant, doc, self.dims)?;

        let mut tenants = self.write()?;
        let docs = tenants.entry(tenant.clone()).or_default();
        let entity = (doc.entity_type, doc.entity_id.clone());
        if let Some(existing) = docs.by_hash.get(&doc.content_hash).cloned() {
            docs.refs.entry(existing.clone()).or_default().insert(entity);
            return Ok(UpsertOutcome::AlreadyIndexed(existing));
        }
        docs.by_hash.insert(doc.content_hash.clone(), doc.id.clone());
        docs.by_id.insert(doc.id.clone(), doc.clone());
        docs.refs.entry(doc.id.clone()).or_default().insert(entity);
        Ok(UpsertOutcome::Inserted(doc.id.clone()))
    }

    async fn get(&self, tenant: &TenantId, content_hash: &str) -> Result<Option<Document>, StoreError> {
        let tenants = self.read()?;
        Ok(tenants.get(tenant).and_then(|d| {
            d.by_hash
                .get(content_hash)
                .and_then(|id| d.by_id.get(id))
                .cloned()
        }))
    }

    async fn delete_all_for_tenant(&self, tenant: &TenantId) -> Result<u64, StoreError> {
        let mut tenants = self.write()?;
        Ok(tenants
            .remove(tenant)
            .map(|d| d.by_id.len() as u64)
            .unwrap_or(0))
    }

    async fn delete_for_entity(
        &self,
        tenant: &TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<u64, StoreError> {
        let mut tenants = self.write()?;
        let Some(docs) = tenants.get_mut(tenant) else {
            return Ok(0);
        };
        Ok(docs.release(&(entity_type, entity_id.to_string())))
    }

    async fn entity_refs(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<(EntityType, String)>, StoreError> {
        let tenants = self.read()?;
        Ok(tenants
            .get(tenant)
            .and_then(|d| d.refs.get(document_id))
            .map(|refs| refs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, tenant: &TenantId, filter: &ScanFilter) -> Result<Vec<Document>, StoreError> {
        let tenants = self.read()?;
        Ok(tenants
            .get(tenant)
            .map(|d| {
                d.by_id
                    .values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_by_type(&self, tenant: &TenantId) -> Result<BTreeMap<EntityType, u64>, StoreError> {
        let tenants = self.read()?;
        let mut counts = BTreeMap::new();
        if let Some(docs) = tenants.get(tenant) {
            for doc in docs.by_id.values() {
                *counts.entry(doc.entity_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, NormalizedContent, SourceRecord};
    use serde_json::json;
    use std::sync::Arc;

    fn doc(tenant: &str, entity_type: EntityType, id: &str, content: &str) -> Document {
        let record = SourceRecord::new(entity_type, id, json!({}));
        Document::new(
            TenantId::new(tenant).unwrap(),
            &record,
            NormalizedContent {
                title: id.to_string(),
                content: content.to_string(),
                metadata: DocumentMetadata::default(),
            },
            vec![1.0, 0.0, 0.0],
        )
    }

    fn t(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_dedups_on_hash() {
        let store = InMemoryStore::new(3);
        let first = store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: Call client"))
            .await
            .unwrap();
        let second = store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "b", "task:  call CLIENT"))
            .await
            .unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        assert_eq!(second, UpsertOutcome::AlreadyIndexed(first.id().to_string()));

        let hash = crate::hash::content_hash("Task: Call client");
        let stored = store.get(&t("t1"), &hash).await.unwrap().unwrap();
        assert_eq!(stored.entity_id, "a");
        assert!(store.get(&t("t2"), &hash).await.unwrap().is_none());
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_content_in_two_tenants_is_two_documents() {
        let store = InMemoryStore::new(3);
        store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: Call client"))
            .await
            .unwrap();
        let other = store
            .upsert(&t("t2"), &doc("t2", EntityType::Task, "a", "Task: Call client"))
            .await
            .unwrap();
        assert!(matches!(other, UpsertOutcome::Inserted(_)));
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 1);
        assert_eq!(store.scan(&t("t2"), &ScanFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_documents() {
        let store = InMemoryStore::new(3);

        let mut wrong_dims = doc("t1", EntityType::Task, "a", "Task: one");
        wrong_dims.embedding = vec![1.0];
        assert_eq!(
            store.upsert(&t("t1"), &wrong_dims).await.unwrap_err(),
            StoreError::DimensionMismatch { expected: 3, actual: 1 }
        );

        let mut nan = doc("t1", EntityType::Task, "a", "Task: one");
        nan.embedding = vec![f32::NAN, 0.0, 0.0];
        assert_eq!(store.upsert(&t("t1"), &nan).await.unwrap_err(), StoreError::InvalidVector);

        let foreign = doc("t2", EntityType::Task, "a", "Task: one");
        assert!(matches!(
            store.upsert(&t("t1"), &foreign).await.unwrap_err(),
            StoreError::TenantMismatch { .. }
        ));

        let mut bad_hash = doc("t1", EntityType::Task, "a", "Task: one");
        bad_hash.content_hash = "deadbeef".to_string();
        assert!(matches!(
            store.upsert(&t("t1"), &bad_hash).await.unwrap_err(),
            StoreError::HashMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let store = InMemoryStore::new(3);
        store.upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: one")).await.unwrap();
        store.upsert(&t("t1"), &doc("t1", EntityType::Deal, "d", "Deal: two")).await.unwrap();
        store.upsert(&t("t2"), &doc("t2", EntityType::Task, "a", "Task: one")).await.unwrap();

        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 1);
        let counts = store.count_by_type(&t("t1")).await.unwrap();
        assert_eq!(counts.get(&EntityType::Deal), Some(&1));
        assert_eq!(counts.get(&EntityType::Task), None);

        // hash is free again once the entity is gone
        let again = store.upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: one")).await.unwrap();
        assert!(matches!(again, UpsertOutcome::Inserted(_)));

        assert_eq!(store.delete_all_for_tenant(&t("t1")).await.unwrap(), 2);
        assert!(store.count_by_type(&t("t1")).await.unwrap().is_empty());
        assert_eq!(store.count_by_type(&t("t2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collapsed_document_survives_until_last_entity_goes() {
        let store = InMemoryStore::new(3);
        let a = store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: Call client"))
            .await
            .unwrap();
        store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "b", "task:  call CLIENT"))
            .await
            .unwrap();
        assert_eq!(
            store.entity_refs(&t("t1"), a.id()).await.unwrap(),
            vec![(EntityType::Task, "a".to_string()), (EntityType::Task, "b".to_string())]
        );

        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 0);
        let left = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entity_id, "b");
        assert_eq!(
            store.entity_refs(&t("t1"), a.id()).await.unwrap(),
            vec![(EntityType::Task, "b".to_string())]
        );

        // releasing twice is a no-op
        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 0);
        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "b").await.unwrap(), 1);
        assert!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().is_empty());
        assert!(store.entity_refs(&t("t1"), a.id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_filter() {
        let store = InMemoryStore::new(3);
        store.upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: one")).await.unwrap();
        store.upsert(&t("t1"), &doc("t1", EntityType::Deal, "d", "Deal: two")).await.unwrap();

        let filter = ScanFilter {
            entity_types: vec![EntityType::Deal],
            updated_since: None,
        };
        let docs = store.scan(&t("t1"), &filter).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].entity_type, EntityType::Deal);

        let future = ScanFilter {
            entity_types: vec![],
            updated_since: Some(chrono::Utc::now() + chrono::Duration::days(1)),
        };
        assert!(store.scan(&t("t1"), &future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_store_once() {
        let store = Arc::new(InMemoryStore::new(3));
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let d = doc("t1", EntityType::Task, &format!("t-{i}"), "Task: Call client ABC");
                store.upsert(&t("t1"), &d).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), UpsertOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 1);
    }
}
