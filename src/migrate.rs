use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::Config;
use crate::db;

/// Open the configured database and create the schema if needed.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_tenant_type ON documents(tenant_id, entity_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_tenant_entity ON documents(tenant_id, entity_type, entity_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(tenant_id, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_refs (
            tenant_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            PRIMARY KEY (tenant_id, entity_type, entity_id, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_refs_document ON document_refs(tenant_id, document_id)",
    )
    .execute(pool)
    .await?;

    // Databases created before reference tracking: every document is
    // referenced by the entity it was built from.
    let backfilled = sqlx::query(
        r#"
        INSERT OR IGNORE INTO document_refs (tenant_id, document_id, entity_type, entity_id)
        SELECT tenant_id, id, entity_type, entity_id FROM documents
        WHERE NOT EXISTS (SELECT 1 FROM document_refs LIMIT 1)
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();
    if backfilled > 0 {
        debug!(backfilled, "document references backfilled");
    }

    debug!("schema up to date");
    Ok(())
}
