//! `kh search` and `kh context`: tenant-scoped retrieval from the command
//! line.
//!
//! Thin frontends over [`knowledge_harness_core::search::search`] and
//! [`knowledge_harness_core::context::get_context`]: build the request from
//! CLI flags, run it against the SQLite store with the configured provider,
//! and print either a human-readable rendering or the raw response as JSON.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};

use knowledge_harness_core::context::get_context;
use knowledge_harness_core::models::{EntityType, TenantId};
use knowledge_harness_core::search::{search, SearchRequest, SearchResponse};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::sqlite_store::SqliteStore;

/// Parse `--since`: either RFC 3339 or a plain `YYYY-MM-DD` (midnight UTC).
pub fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        Some(dt) => Ok(dt.and_utc()),
        None => bail!("Invalid --since value: {} (expected YYYY-MM-DD or RFC 3339)", raw),
    }
}

/// Parse a comma-separated `--types` list.
pub fn parse_types(raw: &str) -> Result<Vec<EntityType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EntityType>().map_err(anyhow::Error::from))
        .collect()
}

/// Search flags shared by `kh search` and `kh context`.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub query: String,
    pub types: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
    pub min_relevance: Option<f32>,
}

impl QueryArgs {
    fn into_request(self, config: &Config) -> Result<SearchRequest> {
        if !config.embedding.is_enabled() {
            bail!("Search requires embeddings. Set [embedding] provider in config.");
        }
        if let Some(m) = self.min_relevance {
            if !(0.0..=1.0).contains(&m) {
                bail!("--min-relevance must be in [0.0, 1.0]");
            }
        }
        if self.limit == Some(0) {
            bail!("--limit must be at least 1");
        }

        let mut req = SearchRequest::new(self.query);
        req.types = self.types.as_deref().map(parse_types).transpose()?;
        req.updated_since = self.since.as_deref().map(parse_since).transpose()?;
        req.limit = self.limit;
        req.min_relevance = self.min_relevance;
        Ok(req)
    }
}

pub async fn run_search(
    config: &Config,
    tenant: &TenantId,
    args: QueryArgs,
    json: bool,
) -> Result<()> {
    if args.query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let req = args.into_request(config)?;

    let store = SqliteStore::open(config).await?;
    let provider = create_provider(&config.embedding)?;
    let response = search(
        &store,
        Arc::as_ref(&provider),
        tenant,
        &req,
        &config.retrieval.search_options(),
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }

    store.pool().close().await;
    Ok(())
}

/// Print a token-budgeted context block for `args.query`.
pub async fn run_context(
    config: &Config,
    tenant: &TenantId,
    args: QueryArgs,
    max_tokens: Option<usize>,
    json: bool,
) -> Result<()> {
    if args.query.trim().is_empty() {
        println!("No context.");
        return Ok(());
    }
    if max_tokens == Some(0) {
        bail!("--max-tokens must be at least 1");
    }
    let req = args.into_request(config)?;

    let store = SqliteStore::open(config).await?;
    let provider = create_provider(&config.embedding)?;
    let context = get_context(
        &store,
        Arc::as_ref(&provider),
        tenant,
        &req,
        &config.retrieval.search_options(),
        max_tokens.unwrap_or(config.retrieval.context_max_tokens),
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&context)?);
    } else if context.text.is_empty() {
        println!("No context.");
    } else {
        print!("{}", context.text);
        eprintln!(
            "{} document(s), ~{} of {} tokens{}",
            context.sources.len(),
            context.estimated_tokens,
            context.max_tokens,
            if context.truncated { " (truncated)" } else { "" }
        );
    }

    store.pool().close().await;
    Ok(())
}

fn print_response(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.relevance,
            hit.entity_type,
            hit.title
        );
        println!(
            "    updated: {}  importance: {}",
            hit.updated_at.format("%Y-%m-%d"),
            hit.importance
        );
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    entity: {}  id: {}", hit.entity_id, hit.id);
        println!();
    }

    let groups: Vec<String> = response
        .grouped_by_type
        .iter()
        .map(|(t, hits)| format!("{}={}", t, hits.len()))
        .collect();
    println!(
        "{} result(s) in {} ms ({})",
        response.total_results,
        response.stats.search_time_ms,
        groups.join(", ")
    );
    if !response.keywords.is_empty() {
        println!("keywords: {}", response.keywords.join(" "));
    }
    if response.stats.text_fallback {
        println!("(keyword match: no semantic hit above {:.2})", response.min_relevance);
    }
}
