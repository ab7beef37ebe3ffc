//! Per-tenant index statistics.
//!
//! A quick summary of what is indexed for one tenant: total documents,
//! per-type counts, and when the tenant was last indexed. Used by
//! `kh stats` and `GET /tenants/{tenant}/stats`.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use knowledge_harness_core::models::{EntityType, TenantId};
use knowledge_harness_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct TenantStats {
    pub tenant: TenantId,
    pub total_documents: u64,
    pub by_type: BTreeMap<EntityType, u64>,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Gather counts for `tenant` from the SQLite store.
pub async fn collect_stats(store: &SqliteStore, tenant: &TenantId) -> Result<TenantStats> {
    let by_type = store.count_by_type(tenant).await?;

    let last_ms: Option<i64> =
        sqlx::query_scalar("SELECT MAX(created_at) FROM documents WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .fetch_one(store.pool())
            .await?;

    Ok(TenantStats {
        tenant: tenant.clone(),
        total_documents: by_type.values().sum(),
        by_type,
        last_indexed_at: last_ms.and_then(DateTime::from_timestamp_millis),
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, tenant: &TenantId) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let stats = collect_stats(&store, tenant).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Knowledge Harness Tenant Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Tenant:      {}", stats.tenant);
    println!("  Documents:   {}", stats.total_documents);
    println!(
        "  Last index:  {}",
        stats
            .last_indexed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<26} {:>8}", "TYPE", "DOCS");
        println!("  {}", "-".repeat(36));
        for (entity_type, count) in &stats.by_type {
            println!("  {:<26} {:>8}", entity_type.as_str(), count);
        }
    }

    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        assert_eq!(format_ts_relative(Utc::now()), "just now");
        let two_hours = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(format_ts_relative(two_hours), "2 hours ago");
    }
}
