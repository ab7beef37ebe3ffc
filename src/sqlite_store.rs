//! SQLite-backed [`Store`] implementation.
//!
//! One row per document in the `documents` table. Vectors are stored as
//! little-endian f32 BLOBs, metadata as JSON text, timestamps as Unix
//! milliseconds. Every statement binds `tenant_id`.
//!
//! Deduplication is enforced by `UNIQUE(tenant_id, content_hash)` together
//! with `ON CONFLICT`, so concurrent writers of the same content converge on
//! a single row without any application-level lock. `document_refs` records
//! every entity whose content landed on a row; a row is deleted only when
//! its last reference goes.
//!
//! Reads only see rows whose `dims` equals the store's dimension, so a
//! database written under another embedding model stays invisible until
//! the tenant is reindexed.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;

use knowledge_harness_core::embedding::{blob_to_vec, vec_to_blob};
use knowledge_harness_core::error::StoreError;
use knowledge_harness_core::models::{Document, DocumentMetadata, EntityType, TenantId};
use knowledge_harness_core::store::{validate_document, ScanFilter, Store, UpsertOutcome};

use crate::config::{Config, StoreConfig};
use crate::{db, migrate};

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, entity_type, entity_id, title, content, \
     content_hash, embedding, metadata_json, created_at, updated_at FROM documents";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
    max_retries: u32,
    retry_base: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, dims: usize, config: &StoreConfig) -> Self {
        Self {
            pool,
            dims,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool, config.embedding.dims, &config.store))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_base * (1 << (attempt - 1).min(6));
                    warn!(op = label, attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(StoreError::Backend(format!("{}: {}", label, e))),
            }
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn ts_from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp {}", ms)))
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StoreError> {
    let tenant: String = row.try_get("tenant_id").map_err(backend)?;
    let entity_type: String = row.try_get("entity_type").map_err(backend)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(backend)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(backend)?;
    let metadata: DocumentMetadata = serde_json::from_str(&metadata_json).map_err(backend)?;

    Ok(Document {
        id: row.try_get("id").map_err(backend)?,
        tenant_id: TenantId::new(tenant).map_err(backend)?,
        entity_type: entity_type.parse::<EntityType>().map_err(backend)?,
        entity_id: row.try_get("entity_id").map_err(backend)?,
        title: row.try_get("title").map_err(backend)?,
        content: row.try_get("content").map_err(backend)?,
        content_hash: row.try_get("content_hash").map_err(backend)?,
        embedding: blob_to_vec(&blob),
        metadata,
        created_at: ts_from_millis(row.try_get("created_at").map_err(backend)?)?,
        updated_at: ts_from_millis(row.try_get("updated_at").map_err(backend)?)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, tenant: &TenantId, doc: &Document) -> Result<UpsertOutcome, StoreError> {
        validate_document(tenant, doc, self.dims)?;

        let pool = &self.pool;
        let blob = vec_to_blob(&doc.embedding);
        let blob = &blob;
        let metadata_json = serde_json::to_string(&doc.metadata).map_err(backend)?;
        let metadata_json = &metadata_json;
        let tenant_id = tenant.as_str();

        // A row whose vector has another dimension is unusable; the
        // conflicting insert re-embeds it in place.
        let (written, id) = self
            .with_retry("upsert", move || async move {
                let mut tx = pool.begin().await?;
                let written: Option<String> = sqlx::query_scalar(
                    r#"
                    INSERT INTO documents (id, tenant_id, entity_type, entity_id, title, content,
                                           content_hash, embedding, dims, metadata_json,
                                           created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(tenant_id, content_hash) DO UPDATE SET
                        embedding = excluded.embedding,
                        dims = excluded.dims,
                        metadata_json = excluded.metadata_json,
                        updated_at = excluded.updated_at
                    WHERE documents.dims <> excluded.dims
                    RETURNING id
                    "#,
                )
                .bind(&doc.id)
                .bind(tenant_id)
                .bind(doc.entity_type.as_str())
                .bind(&doc.entity_id)
                .bind(&doc.title)
                .bind(&doc.content)
                .bind(&doc.content_hash)
                .bind(blob)
                .bind(doc.embedding.len() as i64)
                .bind(metadata_json)
                .bind(doc.created_at.timestamp_millis())
                .bind(doc.updated_at.timestamp_millis())
                .fetch_optional(&mut *tx)
                .await?;

                let id: String = match &written {
                    Some(id) => id.clone(),
                    None => {
                        sqlx::query_scalar(
                            "SELECT id FROM documents WHERE tenant_id = ? AND content_hash = ?",
                        )
                        .bind(tenant_id)
                        .bind(&doc.content_hash)
                        .fetch_one(&mut *tx)
                        .await?
                    }
                };

                sqlx::query(
                    "INSERT OR IGNORE INTO document_refs (tenant_id, document_id, entity_type, entity_id) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(tenant_id)
                .bind(&id)
                .bind(doc.entity_type.as_str())
                .bind(&doc.entity_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<_, sqlx::Error>((written.is_some(), id))
            })
            .await?;

        if written {
            Ok(UpsertOutcome::Inserted(id))
        } else {
            Ok(UpsertOutcome::AlreadyIndexed(id))
        }
    }

    async fn get(&self, tenant: &TenantId, content_hash: &str) -> Result<Option<Document>, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        let dims = self.dims as i64;
        let sql = format!(
            "{} WHERE tenant_id = ? AND content_hash = ? AND dims = ?",
            SELECT_COLUMNS
        );
        let sql = sql.as_str();

        let row = self
            .with_retry("get", move || async move {
                sqlx::query(sql)
                    .bind(tenant_id)
                    .bind(content_hash)
                    .bind(dims)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn delete_all_for_tenant(&self, tenant: &TenantId) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        self.with_retry("delete_all_for_tenant", move || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM document_refs WHERE tenant_id = ?")
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
            let removed = sqlx::query("DELETE FROM documents WHERE tenant_id = ?")
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok::<_, sqlx::Error>(removed)
        })
        .await
    }

    async fn delete_for_entity(
        &self,
        tenant: &TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        self.with_retry("delete_for_entity", move || async move {
            let mut tx = pool.begin().await?;
            let mut held: Vec<String> = sqlx::query_scalar(
                "DELETE FROM document_refs WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? \
                 RETURNING document_id",
            )
            .bind(tenant_id)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_all(&mut *tx)
            .await?;
            held.sort();
            held.dedup();

            let mut removed = 0u64;
            for id in &held {
                let survivors: Vec<(String, String)> = sqlx::query_as(
                    "SELECT entity_type, entity_id FROM document_refs WHERE tenant_id = ? AND document_id = ?",
                )
                .bind(tenant_id)
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

                if survivors.is_empty() {
                    removed += sqlx::query("DELETE FROM documents WHERE tenant_id = ? AND id = ?")
                        .bind(tenant_id)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                    continue;
                }

                let heir = survivors
                    .into_iter()
                    .filter_map(|(t, e)| t.parse::<EntityType>().ok().map(|t| (t, e)))
                    .min();
                if let Some((heir_type, heir_id)) = heir {
                    sqlx::query(
                        "UPDATE documents SET entity_type = ?, entity_id = ? \
                         WHERE tenant_id = ? AND id = ? AND entity_type = ? AND entity_id = ?",
                    )
                    .bind(heir_type.as_str())
                    .bind(&heir_id)
                    .bind(tenant_id)
                    .bind(id)
                    .bind(entity_type.as_str())
                    .bind(entity_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            tx.commit().await?;
            Ok::<_, sqlx::Error>(removed)
        })
        .await
    }

    async fn entity_refs(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<(EntityType, String)>, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        let rows: Vec<(String, String)> = self
            .with_retry("entity_refs", move || async move {
                sqlx::query_as(
                    "SELECT entity_type, entity_id FROM document_refs WHERE tenant_id = ? AND document_id = ?",
                )
                .bind(tenant_id)
                .bind(document_id)
                .fetch_all(pool)
                .await
            })
            .await?;

        let mut refs = rows
            .into_iter()
            .map(|(t, e)| Ok::<_, StoreError>((t.parse::<EntityType>().map_err(backend)?, e)))
            .collect::<Result<Vec<_>, _>>()?;
        refs.sort();
        Ok(refs)
    }

    async fn scan(&self, tenant: &TenantId, filter: &ScanFilter) -> Result<Vec<Document>, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        let dims = self.dims as i64;

        let rows = self
            .with_retry("scan", move || async move {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
                qb.push(" WHERE tenant_id = ").push_bind(tenant_id);
                qb.push(" AND dims = ").push_bind(dims);

                if !filter.entity_types.is_empty() {
                    qb.push(" AND entity_type IN (");
                    let mut separated = qb.separated(", ");
                    for t in &filter.entity_types {
                        separated.push_bind(t.as_str());
                    }
                    separated.push_unseparated(")");
                }
                if let Some(since) = filter.updated_since {
                    qb.push(" AND updated_at >= ").push_bind(since.timestamp_millis());
                }

                qb.build().fetch_all(pool).await
            })
            .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn count_by_type(&self, tenant: &TenantId) -> Result<BTreeMap<EntityType, u64>, StoreError> {
        let pool = &self.pool;
        let tenant_id = tenant.as_str();
        let dims = self.dims as i64;
        let rows: Vec<(String, i64)> = self
            .with_retry("count_by_type", move || async move {
                sqlx::query_as(
                    "SELECT entity_type, COUNT(*) FROM documents WHERE tenant_id = ? AND dims = ? \
                     GROUP BY entity_type",
                )
                .bind(tenant_id)
                .bind(dims)
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.into_iter()
            .map(|(t, n)| Ok::<_, StoreError>((t.parse::<EntityType>().map_err(backend)?, n.max(0) as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_harness_core::models::{NormalizedContent, SourceRecord};
    use serde_json::json;
    use tempfile::TempDir;

    const DIMS: usize = 4;

    async fn open(tmp: &TempDir) -> SqliteStore {
        open_with_dims(tmp, DIMS).await
    }

    async fn open_with_dims(tmp: &TempDir, dims: usize) -> SqliteStore {
        let mut config = Config::minimal(tmp.path().join("kh.sqlite"));
        config.embedding.dims = dims;
        SqliteStore::open(&config).await.unwrap()
    }

    fn t(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn doc(tenant: &str, entity_type: EntityType, id: &str, content: &str) -> Document {
        let record = SourceRecord::new(entity_type, id, json!({}));
        Document::new(
            t(tenant),
            &record,
            NormalizedContent {
                title: format!("{} title", id),
                content: content.to_string(),
                metadata: DocumentMetadata {
                    source: "task-index".to_string(),
                    importance: 4,
                    priority: Some("HIGH".to_string()),
                    ..Default::default()
                },
            },
            vec![0.5, 0.5, 0.5, 0.5],
        )
    }

    #[tokio::test]
    async fn test_roundtrip_and_dedup() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        let original = doc("t1", EntityType::Task, "a", "Task: Call client ABC");
        let first = store.upsert(&t("t1"), &original).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted(original.id.clone()));

        let dup = doc("t1", EntityType::Task, "b", "  task: call   client abc");
        let second = store.upsert(&t("t1"), &dup).await.unwrap();
        assert_eq!(second, UpsertOutcome::AlreadyIndexed(original.id.clone()));

        let stored = store.get(&t("t1"), &original.content_hash).await.unwrap().unwrap();
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.embedding, original.embedding);
        assert_eq!(stored.metadata, original.metadata);
        assert_eq!(stored.entity_type, EntityType::Task);
        assert_eq!(
            stored.updated_at.timestamp_millis(),
            original.updated_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        let a = doc("t1", EntityType::Task, "a", "Task: Call client ABC");
        let b = doc("t2", EntityType::Task, "a", "Task: Call client ABC");
        store.upsert(&t("t1"), &a).await.unwrap();
        assert!(matches!(
            store.upsert(&t("t2"), &b).await.unwrap(),
            UpsertOutcome::Inserted(_)
        ));

        assert!(store.get(&t("t3"), &a.content_hash).await.unwrap().is_none());
        let scanned = store.scan(&t("t2"), &ScanFilter::default()).await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].tenant_id, t("t2"));

        assert_eq!(store.delete_all_for_tenant(&t("t1")).await.unwrap(), 1);
        assert_eq!(store.scan(&t("t2"), &ScanFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_filters_and_counts() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        store.upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: one thing")).await.unwrap();
        store.upsert(&t("t1"), &doc("t1", EntityType::Deal, "d", "Deal: big one")).await.unwrap();
        store.upsert(&t("t1"), &doc("t1", EntityType::Lead, "l", "Lead: warm one")).await.unwrap();

        let filter = ScanFilter {
            entity_types: vec![EntityType::Deal, EntityType::Lead],
            updated_since: None,
        };
        assert_eq!(store.scan(&t("t1"), &filter).await.unwrap().len(), 2);

        let future = ScanFilter {
            entity_types: vec![],
            updated_since: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        assert!(store.scan(&t("t1"), &future).await.unwrap().is_empty());

        let counts = store.count_by_type(&t("t1")).await.unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[&EntityType::Deal], 1);
    }

    #[tokio::test]
    async fn test_delete_for_entity() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        store.upsert(&t("t1"), &doc("t1", EntityType::Task, "a", "Task: one thing")).await.unwrap();
        store.upsert(&t("t1"), &doc("t1", EntityType::Task, "b", "Task: other thing")).await.unwrap();

        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 1);
        assert_eq!(store.delete_for_entity(&t("t2"), EntityType::Task, "b").await.unwrap(), 0);
        let left = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entity_id, "b");
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let mut bad = doc("t1", EntityType::Task, "a", "Task: one thing");
        bad.embedding = vec![1.0; DIMS + 1];
        assert_eq!(
            store.upsert(&t("t1"), &bad).await.unwrap_err(),
            StoreError::DimensionMismatch { expected: DIMS, actual: DIMS + 1 }
        );
    }

    #[tokio::test]
    async fn test_collapsed_document_outlives_one_entity() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        let a = doc("t1", EntityType::Task, "a", "Task: Call client ABC");
        store.upsert(&t("t1"), &a).await.unwrap();
        let dup = store
            .upsert(&t("t1"), &doc("t1", EntityType::Task, "b", "task: call client abc"))
            .await
            .unwrap();
        assert!(dup.is_duplicate());
        // same entity again adds nothing
        store.upsert(&t("t1"), &a).await.unwrap();
        assert_eq!(store.entity_refs(&t("t1"), &a.id).await.unwrap().len(), 2);

        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 0);
        let left = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, a.id);
        assert_eq!(left[0].entity_id, "b");

        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "b").await.unwrap(), 1);
        assert!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().is_empty());
        assert!(store.entity_refs(&t("t1"), &a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rows_of_another_dimension_are_invisible() {
        let tmp = TempDir::new().unwrap();
        let original = doc("t1", EntityType::Task, "a", "Task: Call client ABC");
        {
            let store = open(&tmp).await;
            store.upsert(&t("t1"), &original).await.unwrap();
            store.pool().close().await;
        }

        let wider = open_with_dims(&tmp, DIMS * 2).await;
        assert!(wider.scan(&t("t1"), &ScanFilter::default()).await.unwrap().is_empty());
        assert!(wider.get(&t("t1"), &original.content_hash).await.unwrap().is_none());
        assert!(wider.count_by_type(&t("t1")).await.unwrap().is_empty());

        // indexing the same content again re-embeds the stale row
        let mut fresh = doc("t1", EntityType::Task, "a", "Task: Call client ABC");
        fresh.embedding = vec![0.25; DIMS * 2];
        let outcome = wider.upsert(&t("t1"), &fresh).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted(original.id.clone()));
        let docs = wider.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].embedding.len(), DIMS * 2);
    }

    #[tokio::test]
    async fn test_schema_backfills_references_for_existing_rows() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let legacy = doc("t1", EntityType::Task, "a", "Task: one thing");
        sqlx::query(
            "INSERT INTO documents (id, tenant_id, entity_type, entity_id, title, content, content_hash, \
             embedding, dims, metadata_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', 0, 0)",
        )
        .bind(&legacy.id)
        .bind("t1")
        .bind("TASK")
        .bind("a")
        .bind(&legacy.title)
        .bind(&legacy.content)
        .bind(&legacy.content_hash)
        .bind(vec_to_blob(&legacy.embedding))
        .bind(DIMS as i64)
        .execute(store.pool())
        .await
        .unwrap();

        migrate::apply_schema(store.pool()).await.unwrap();
        assert_eq!(
            store.entity_refs(&t("t1"), &legacy.id).await.unwrap(),
            vec![(EntityType::Task, "a".to_string())]
        );
        assert_eq!(store.delete_for_entity(&t("t1"), EntityType::Task, "a").await.unwrap(), 1);
    }
}
