//! Reindex orchestration.
//!
//! A full run for one tenant goes `CLEAR → INDEX_TYPE_1 … INDEX_TYPE_N →
//! SUMMARY`: every existing document of the tenant is deleted, then each
//! registered source is listed and its records flow through
//! normalize → embed → upsert.
//!
//! Records of one type run concurrently on a [`JoinSet`], bounded by a
//! [`Semaphore`] of `indexing.concurrency` permits. Types run one after
//! another unless `indexing.parallel_types` is set. A failing record is
//! logged, counted, and skipped; only a failing CLEAR aborts the run.
//!
//! Counters are accumulated per run in a [`ReindexReport`]; nothing is
//! shared between runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use knowledge_harness_core::embedding::EmbeddingProvider;
use knowledge_harness_core::error::{EmbeddingError, NormalizeError, SourceError, StoreError};
use knowledge_harness_core::models::{Document, EntityType, SourceRecord, TenantId};
use knowledge_harness_core::normalize::NormalizerRegistry;
use knowledge_harness_core::source::{RecordSource, SourceRegistry};
use knowledge_harness_core::store::{Store, UpsertOutcome};

use crate::config::{Config, IndexingConfig};
use crate::embedding::create_provider;
use crate::source_json::json_sources;
use crate::sqlite_store::SqliteStore;

/// Why a single record could not be indexed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of indexing one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed { id: String, replaced: u64 },
    AlreadyIndexed { id: String, replaced: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReindexOptions {
    pub concurrency: usize,
    pub parallel_types: bool,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            parallel_types: false,
        }
    }
}

impl From<&IndexingConfig> for ReindexOptions {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            parallel_types: config.parallel_types,
        }
    }
}

/// Counters for one entity type within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeStats {
    pub entity_type: EntityType,
    pub total: u64,
    /// Successful records, including ones that were already indexed.
    pub indexed: u64,
    pub duplicates: u64,
    pub errors: u64,
}

impl TypeStats {
    fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            total: 0,
            indexed: 0,
            duplicates: 0,
            errors: 0,
        }
    }
}

/// Summary of one reindex run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReindexReport {
    pub tenant: TenantId,
    pub cleared: u64,
    pub total: u64,
    pub indexed: u64,
    pub duplicates: u64,
    pub errors: u64,
    pub by_type: Vec<TypeStats>,
    pub skipped_types: Vec<EntityType>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

enum TypeRun {
    Done { stats: TypeStats, cancelled: bool },
    Skipped(EntityType),
}

/// Everything a spawned record task needs, cheap to clone.
#[derive(Clone)]
struct Pipeline {
    store: Arc<dyn Store>,
    provider: Arc<dyn EmbeddingProvider>,
    normalizers: Arc<NormalizerRegistry>,
}

impl Pipeline {
    /// Normalize and embed; nothing is written.
    async fn prepare(&self, tenant: &TenantId, record: &SourceRecord) -> Result<Document, IndexError> {
        let normalized = self.normalizers.normalize(record)?;
        let embedding = self.provider.embed(&normalized.content).await?;
        Ok(Document::new(tenant.clone(), record, normalized, embedding))
    }

    async fn index_one(&self, tenant: &TenantId, record: SourceRecord) -> Result<UpsertOutcome, IndexError> {
        let doc = self.prepare(tenant, &record).await?;
        Ok(self.store.upsert(tenant, &doc).await?)
    }
}

pub struct Reindexer {
    pipeline: Pipeline,
    options: ReindexOptions,
}

impl Reindexer {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn EmbeddingProvider>,
        normalizers: NormalizerRegistry,
        options: ReindexOptions,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                store,
                provider,
                normalizers: Arc::new(normalizers),
            },
            options,
        }
    }

    /// Wire a reindexer from config: configured provider, default
    /// normalizers, indexing options.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        let provider = create_provider(&config.embedding)?;
        Ok(Self::new(
            store,
            provider,
            NormalizerRegistry::with_defaults(config.indexing.normalize_options()),
            ReindexOptions::from(&config.indexing),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.pipeline.store
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.pipeline.provider
    }

    /// Index a single record, replacing whatever the same entity produced
    /// before.
    ///
    /// The entity's old documents are released only once the new one is
    /// normalized and embedded, so a failed edit leaves them in place.
    /// `replaced` counts documents actually deleted; one still shared with
    /// another entity is kept.
    pub async fn index_record(&self, tenant: &TenantId, record: SourceRecord) -> Result<IndexOutcome, IndexError> {
        let doc = self.pipeline.prepare(tenant, &record).await?;

        let replaced = self
            .pipeline
            .store
            .delete_for_entity(tenant, record.entity_type, &record.entity_id)
            .await?;
        let outcome = self.pipeline.store.upsert(tenant, &doc).await?;
        Ok(match outcome {
            UpsertOutcome::Inserted(id) => IndexOutcome::Indexed { id, replaced },
            UpsertOutcome::AlreadyIndexed(id) => IndexOutcome::AlreadyIndexed { id, replaced },
        })
    }

    /// Release one source entity; documents no other entity shares are
    /// deleted. Returns the number deleted.
    pub async fn remove_entity(
        &self,
        tenant: &TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<u64, StoreError> {
        let removed = self
            .pipeline
            .store
            .delete_for_entity(tenant, entity_type, entity_id)
            .await?;
        info!(tenant = %tenant, %entity_type, entity_id, removed, "entity removed from index");
        Ok(removed)
    }

    /// Full rebuild of `tenant` from `sources`.
    pub async fn reindex(
        &self,
        tenant: &TenantId,
        sources: &SourceRegistry,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport, StoreError> {
        let started = Instant::now();
        info!(tenant = %tenant, types = sources.len(), "reindex started");

        let cleared = self
            .pipeline
            .store
            .delete_all_for_tenant(tenant)
            .await
            .map_err(|e| {
                error!(tenant = %tenant, error = %e, "reindex aborted: clear failed");
                e
            })?;
        info!(tenant = %tenant, cleared, "tenant cleared");

        let sources_in_order: Vec<&dyn RecordSource> = sources
            .entity_types()
            .into_iter()
            .filter_map(|t| sources.get(t))
            .collect();

        let runs: Vec<TypeRun> = if self.options.parallel_types {
            futures::future::join_all(
                sources_in_order
                    .iter()
                    .map(|source| self.index_type(tenant, *source, cancel)),
            )
            .await
        } else {
            let mut runs = Vec::with_capacity(sources_in_order.len());
            for source in &sources_in_order {
                if cancel.is_cancelled() {
                    break;
                }
                runs.push(self.index_type(tenant, *source, cancel).await);
            }
            runs
        };

        let mut report = ReindexReport {
            tenant: tenant.clone(),
            cleared,
            total: 0,
            indexed: 0,
            duplicates: 0,
            errors: 0,
            by_type: Vec::new(),
            skipped_types: Vec::new(),
            cancelled: cancel.is_cancelled(),
            elapsed_ms: 0,
        };

        for run in runs {
            match run {
                TypeRun::Done { stats, cancelled } => {
                    report.total += stats.total;
                    report.indexed += stats.indexed;
                    report.duplicates += stats.duplicates;
                    report.errors += stats.errors;
                    report.cancelled |= cancelled;
                    report.by_type.push(stats);
                }
                TypeRun::Skipped(entity_type) => report.skipped_types.push(entity_type),
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            tenant = %tenant,
            total = report.total,
            indexed = report.indexed,
            duplicates = report.duplicates,
            errors = report.errors,
            skipped = report.skipped_types.len(),
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "reindex finished"
        );
        Ok(report)
    }

    async fn index_type(
        &self,
        tenant: &TenantId,
        source: &dyn RecordSource,
        cancel: &CancellationToken,
    ) -> TypeRun {
        let entity_type = source.entity_type();

        let records = match source.list_records(tenant).await {
            Ok(records) => records,
            Err(SourceError::Unavailable(_, reason)) => {
                warn!(tenant = %tenant, %entity_type, %reason, "source unavailable, skipping type");
                return TypeRun::Skipped(entity_type);
            }
            Err(e) => {
                error!(tenant = %tenant, %entity_type, error = %e, "source failed, skipping type");
                return TypeRun::Skipped(entity_type);
            }
        };
        debug!(tenant = %tenant, %entity_type, records = records.len(), "indexing type");

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut stats = TypeStats::new(entity_type);
        let mut cancelled = false;

        for record in records {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pipeline = self.pipeline.clone();
            let tenant = tenant.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let entity_id = record.entity_id.clone();
                (entity_id, pipeline.index_one(&tenant, record).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            stats.total += 1;
            match joined {
                Ok((entity_id, Ok(outcome))) => {
                    stats.indexed += 1;
                    if outcome.is_duplicate() {
                        stats.duplicates += 1;
                        debug!(%entity_type, %entity_id, "already indexed");
                    }
                }
                Ok((entity_id, Err(e))) => {
                    stats.errors += 1;
                    warn!(tenant = %tenant, %entity_type, %entity_id, error = %e, "record skipped");
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(tenant = %tenant, %entity_type, error = %e, "record task failed");
                }
            }
        }

        info!(
            tenant = %tenant,
            %entity_type,
            total = stats.total,
            indexed = stats.indexed,
            duplicates = stats.duplicates,
            errors = stats.errors,
            "type indexed"
        );
        TypeRun::Done { stats, cancelled }
    }
}

/// Print a run summary the way the CLI shows it.
pub fn print_report(report: &ReindexReport) {
    println!("reindex {}", report.tenant);
    println!("  cleared documents: {}", report.cleared);
    println!();
    println!(
        "  {:<26} {:>7} {:>8} {:>6} {:>7}",
        "TYPE", "TOTAL", "INDEXED", "DUPES", "ERRORS"
    );
    println!("  {}", "-".repeat(58));
    for s in &report.by_type {
        println!(
            "  {:<26} {:>7} {:>8} {:>6} {:>7}",
            s.entity_type.as_str(),
            s.total,
            s.indexed,
            s.duplicates,
            s.errors
        );
    }
    println!("  {}", "-".repeat(58));
    println!(
        "  {:<26} {:>7} {:>8} {:>6} {:>7}",
        "ALL", report.total, report.indexed, report.duplicates, report.errors
    );

    if !report.skipped_types.is_empty() {
        let skipped: Vec<&str> = report.skipped_types.iter().map(|t| t.as_str()).collect();
        println!();
        println!("  skipped (no source): {}", skipped.join(", "));
    }
    println!();
    println!("  elapsed: {} ms", report.elapsed_ms);
    if report.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }
}

/// `kh reindex`: rebuild a tenant from the JSON exports under `[sources].root`.
pub async fn run_reindex(config: &Config, tenant: &TenantId, json: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let reindexer = Reindexer::from_config(config, store.clone())?;
    let sources = json_sources(&config.sources.root);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight records");
            on_signal.cancel();
        }
    });

    let report = reindexer.reindex(tenant, &sources, &cancel).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    store.pool().close().await;
    Ok(())
}

/// `kh index --file`: index one record from a JSON file.
pub async fn run_index_file(config: &Config, tenant: &TenantId, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read record file: {}", path.display()))?;
    let record: SourceRecord = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse record file: {}", path.display()))?;

    let store = Arc::new(SqliteStore::open(config).await?);
    let reindexer = Reindexer::from_config(config, store.clone())?;

    let outcome = reindexer.index_record(tenant, record).await?;
    match &outcome {
        IndexOutcome::Indexed { id, replaced } => {
            println!("indexed {} (replaced {})", id, replaced)
        }
        IndexOutcome::AlreadyIndexed { id, replaced } => {
            println!("already indexed as {} (replaced {})", id, replaced)
        }
    }

    store.pool().close().await;
    Ok(())
}

/// `kh remove`: delete one entity's documents.
pub async fn run_remove(
    config: &Config,
    tenant: &TenantId,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let reindexer = Reindexer::from_config(config, store.clone())?;
    let removed = reindexer.remove_entity(tenant, entity_type, entity_id).await?;
    println!("removed {} document(s)", removed);
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TimeoutProvider;
    use async_trait::async_trait;
    use knowledge_harness_core::embedding::HashEmbedder;
    use std::time::Duration;
    use knowledge_harness_core::normalize::NormalizeOptions;
    use knowledge_harness_core::source::InMemorySource;
    use knowledge_harness_core::store::memory::InMemoryStore;
    use knowledge_harness_core::store::ScanFilter;
    use serde_json::json;

    const DIMS: usize = 256;

    fn t(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn reindexer(store: Arc<InMemoryStore>) -> Reindexer {
        Reindexer::new(
            store,
            Arc::new(HashEmbedder::new(DIMS)),
            NormalizerRegistry::with_defaults(NormalizeOptions::default()),
            ReindexOptions::default(),
        )
    }

    fn task(id: &str, title: &str, priority: &str) -> SourceRecord {
        SourceRecord::new(
            EntityType::Task,
            id,
            json!({ "title": title, "priority": priority }),
        )
    }

    struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        fn dims(&self) -> usize {
            DIMS
        }
        async fn upsert(&self, _: &TenantId, _: &Document) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn get(&self, _: &TenantId, _: &str) -> Result<Option<Document>, StoreError> {
            Ok(None)
        }
        async fn delete_all_for_tenant(&self, _: &TenantId) -> Result<u64, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn delete_for_entity(&self, _: &TenantId, _: EntityType, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn entity_refs(&self, _: &TenantId, _: &str) -> Result<Vec<(EntityType, String)>, StoreError> {
            Ok(Vec::new())
        }
        async fn scan(&self, _: &TenantId, _: &ScanFilter) -> Result<Vec<Document>, StoreError> {
            Ok(Vec::new())
        }
        async fn count_by_type(
            &self,
            _: &TenantId,
        ) -> Result<std::collections::BTreeMap<EntityType, u64>, StoreError> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn test_duplicate_tasks_collapse() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(InMemorySource::new(EntityType::Task).with_records(
            &t("t1"),
            vec![
                task("1", "Call client ABC", "HIGH"),
                task("2", "Call client ABC", "MEDIUM"),
                task("3", "Prepare invoice", "LOW"),
            ],
        )));

        let report = reindexer(store.clone())
            .reindex(&t("t1"), &sources, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.indexed, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.errors, 0);
        assert!(!report.cancelled);
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_record_is_counted_not_fatal() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(InMemorySource::new(EntityType::Task).with_records(
            &t("t1"),
            vec![
                task("1", "Call client ABC", "HIGH"),
                SourceRecord::new(EntityType::Task, "2", json!({ "description": "no title" })),
                task("3", "Prepare invoice", "LOW"),
            ],
        )));

        let report = reindexer(store.clone())
            .reindex(&t("t1"), &sources, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.total, report.indexed + report.errors);
    }

    #[tokio::test]
    async fn test_unavailable_source_is_skipped() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(InMemorySource::new(EntityType::Deal)));
        sources.register(Box::new(
            InMemorySource::new(EntityType::Task)
                .with_records(&t("t1"), vec![task("1", "Call client ABC", "HIGH")]),
        ));

        let report = reindexer(store)
            .reindex(&t("t1"), &sources, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped_types, vec![EntityType::Deal]);
        assert_eq!(report.indexed, 1);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent_and_clears_first() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let source = InMemorySource::new(EntityType::Task).with_records(
            &t("t1"),
            vec![task("1", "Call client ABC", "HIGH"), task("3", "Prepare invoice", "LOW")],
        );
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(source));
        let reindexer = reindexer(store.clone());

        let first = reindexer.reindex(&t("t1"), &sources, &CancellationToken::new()).await.unwrap();
        let hashes = |docs: Vec<Document>| {
            let mut h: Vec<String> = docs.into_iter().map(|d| d.content_hash).collect();
            h.sort();
            h
        };
        let before = hashes(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap());

        let second = reindexer.reindex(&t("t1"), &sources, &CancellationToken::new()).await.unwrap();
        let after = hashes(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap());

        assert_eq!(before, after);
        assert_eq!(second.cleared, 2);
        assert_eq!(first.indexed, second.indexed);
        assert_eq!(second.duplicates, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(
            InMemorySource::new(EntityType::Task)
                .with_records(&t("t1"), vec![task("1", "Call client ABC", "HIGH")]),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = reindexer(store.clone()).reindex(&t("t1"), &sources, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 0);
        assert!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_types_match_sequential_totals() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(
            InMemorySource::new(EntityType::Task)
                .with_records(&t("t1"), vec![task("1", "Call client ABC", "HIGH")]),
        ));
        sources.register(Box::new(InMemorySource::new(EntityType::Company).with_records(
            &t("t1"),
            vec![SourceRecord::new(EntityType::Company, "c1", json!({ "name": "Globex Corp" }))],
        )));

        let reindexer = Reindexer::new(
            store.clone(),
            Arc::new(HashEmbedder::new(DIMS)),
            NormalizerRegistry::default(),
            ReindexOptions {
                concurrency: 2,
                parallel_types: true,
            },
        );
        let report = reindexer.reindex(&t("t1"), &sources, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(
            report.by_type.iter().map(|s| s.entity_type).collect::<Vec<_>>(),
            vec![EntityType::Task, EntityType::Company]
        );
    }

    #[tokio::test]
    async fn test_clear_failure_aborts_run() {
        let reindexer = Reindexer::new(
            Arc::new(FailingStore),
            Arc::new(HashEmbedder::new(DIMS)),
            NormalizerRegistry::default(),
            ReindexOptions::default(),
        );
        let err = reindexer
            .reindex(&t("t1"), &SourceRegistry::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Backend("down".to_string()));
    }

    #[tokio::test]
    async fn test_index_record_replaces_stale_document() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let reindexer = reindexer(store.clone());

        let first = reindexer
            .index_record(&t("t1"), task("1", "Call client ABC", "HIGH"))
            .await
            .unwrap();
        assert!(matches!(first, IndexOutcome::Indexed { replaced: 0, .. }));

        let second = reindexer
            .index_record(&t("t1"), task("1", "Call client ABC about renewal", "HIGH"))
            .await
            .unwrap();
        assert!(matches!(second, IndexOutcome::Indexed { replaced: 1, .. }));

        let docs = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].content.contains("renewal"));

        assert_eq!(reindexer.remove_entity(&t("t1"), EntityType::Task, "1").await.unwrap(), 1);
        assert!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_edit_keeps_old_document() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let reindexer = reindexer(store.clone());
        reindexer
            .index_record(&t("t1"), task("1", "Call client ABC", "HIGH"))
            .await
            .unwrap();

        let err = reindexer
            .index_record(
                &t("t1"),
                SourceRecord::new(EntityType::Task, "1", json!({ "title": "   " })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Normalize(NormalizeError::MissingField { .. })));
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 1);
    }

    /// Hash embeddings, except that documents containing `trigger` fail,
    /// stall, or cancel a token, depending on the mode.
    struct Tripwire {
        inner: HashEmbedder,
        trigger: &'static str,
        mode: TripMode,
    }

    enum TripMode {
        Fail,
        Stall,
        Cancel(CancellationToken),
    }

    impl Tripwire {
        fn new(trigger: &'static str, mode: TripMode) -> Self {
            Self {
                inner: HashEmbedder::new(DIMS),
                trigger,
                mode,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Tripwire {
        fn model_name(&self) -> &str {
            "tripwire"
        }
        fn dims(&self) -> usize {
            DIMS
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains(self.trigger) {
                match &self.mode {
                    TripMode::Fail => return Err(EmbeddingError::Provider("model rejected input".to_string())),
                    TripMode::Stall => tokio::time::sleep(Duration::from_secs(5)).await,
                    TripMode::Cancel(token) => token.cancel(),
                }
            }
            self.inner.embed(text).await
        }
    }

    fn with_provider(store: Arc<InMemoryStore>, provider: Arc<dyn EmbeddingProvider>, concurrency: usize) -> Reindexer {
        Reindexer::new(
            store,
            provider,
            NormalizerRegistry::default(),
            ReindexOptions {
                concurrency,
                parallel_types: false,
            },
        )
    }

    fn three_tasks() -> SourceRegistry {
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(InMemorySource::new(EntityType::Task).with_records(
            &t("t1"),
            vec![
                task("1", "Call client ABC", "HIGH"),
                task("2", "Prepare invoice", "LOW"),
                task("3", "Book the venue", "MEDIUM"),
            ],
        )));
        sources
    }

    #[tokio::test]
    async fn test_embedding_failure_skips_only_that_record() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let provider = Arc::new(Tripwire::new("invoice", TripMode::Fail));
        let report = with_provider(store.clone(), provider, 2)
            .reindex(&t("t1"), &three_tasks(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.by_type[0].errors, 1);
        let docs = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| !d.content.contains("invoice")));
    }

    #[tokio::test]
    async fn test_embedding_timeout_skips_only_that_record() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let provider = Arc::new(TimeoutProvider::new(
            Tripwire::new("venue", TripMode::Stall),
            Duration::from_millis(50),
        ));
        let report = with_provider(store.clone(), provider, 3)
            .reindex(&t("t1"), &three_tasks(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.indexed, 2);
        assert_eq!(report.errors, 1);
        assert!(!report.cancelled);
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_finished_records() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let cancel = CancellationToken::new();
        let provider = Arc::new(Tripwire::new("client", TripMode::Cancel(cancel.clone())));

        let mut sources = three_tasks();
        sources.register(Box::new(InMemorySource::new(EntityType::Company).with_records(
            &t("t1"),
            vec![SourceRecord::new(EntityType::Company, "c1", json!({ "name": "Globex Corp" }))],
        )));

        let report = with_provider(store.clone(), provider, 1)
            .reindex(&t("t1"), &sources, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.indexed >= 1 && report.indexed < 3, "{:?}", report);
        assert_eq!(report.errors, 0);
        // later types never start
        assert_eq!(report.by_type.len(), 1);
        assert_eq!(report.by_type[0].entity_type, EntityType::Task);

        let docs = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(docs.len() as u64, report.indexed);
        assert!(docs.iter().any(|d| d.entity_id == "1"));
    }

    #[tokio::test]
    async fn test_failed_embedding_keeps_old_document() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let reindexer = with_provider(store.clone(), Arc::new(Tripwire::new("renewal", TripMode::Fail)), 1);
        reindexer
            .index_record(&t("t1"), task("1", "Call client ABC", "HIGH"))
            .await
            .unwrap();

        let err = reindexer
            .index_record(&t("t1"), task("1", "Call client ABC about renewal", "HIGH"))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(EmbeddingError::Provider(_))));
        let docs = store.scan(&t("t1"), &ScanFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].content.contains("renewal"));
    }

    #[tokio::test]
    async fn test_editing_one_duplicate_keeps_the_shared_document() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let reindexer = reindexer(store.clone());
        reindexer
            .index_record(&t("t1"), task("a", "Call client ABC", "HIGH"))
            .await
            .unwrap();
        let dup = reindexer
            .index_record(&t("t1"), task("b", "Call client ABC", "MEDIUM"))
            .await
            .unwrap();
        assert!(matches!(dup, IndexOutcome::AlreadyIndexed { replaced: 0, .. }));

        // a moves on; b still needs the shared document
        let edited = reindexer
            .index_record(&t("t1"), task("a", "Call client XYZ", "HIGH"))
            .await
            .unwrap();
        assert!(matches!(edited, IndexOutcome::Indexed { replaced: 0, .. }));

        let mut contents: Vec<String> = store
            .scan(&t("t1"), &ScanFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|d| format!("{}={}", d.entity_id, d.content))
            .collect();
        contents.sort();
        assert_eq!(contents.len(), 2);
        assert!(contents[0].starts_with("a=") && contents[0].contains("XYZ"));
        assert!(contents[1].starts_with("b=") && contents[1].contains("ABC"));

        assert_eq!(reindexer.remove_entity(&t("t1"), EntityType::Task, "b").await.unwrap(), 1);
        assert_eq!(store.scan(&t("t1"), &ScanFilter::default()).await.unwrap().len(), 1);
    }
}
