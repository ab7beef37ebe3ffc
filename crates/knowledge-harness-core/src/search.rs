//! Tenant-scoped semantic search.
//!
//! The core search algorithm operates entirely through the [`Store`] and
//! [`EmbeddingProvider`] traits, with no database or configuration
//! dependencies. Frontends (CLI, HTTP) build a [`SearchRequest`], pick
//! [`SearchOptions`] from their config, and delegate here.
//!
//! # Scoring Algorithm
//!
//! 1. Empty query → empty response, provider never called.
//! 2. Embed the query; its length must equal the store dimension.
//! 3. Scan the tenant's documents (type / time pre-filter). Documents whose
//!    vector length differs from the query's are not scored.
//! 4. `relevance = cos.clamp(0, 1)`: orthogonal and opposed vectors score 0.
//! 5. Drop hits below `min_relevance`.
//! 6. If nothing survives and text fallback is enabled, re-score the same
//!    documents by keyword overlap ([`text_relevance`]) and apply the same
//!    threshold.
//! 7. Sort by relevance (desc), importance (desc), updated_at (desc), id (asc).
//! 8. Truncate to `limit` and group by entity type.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{check_dims, cosine_similarity, tokenize, EmbeddingProvider};
use crate::error::SearchError;
use crate::models::{Document, DocumentMetadata, EntityType, TenantId};
use crate::store::{ScanFilter, Store};

/// Snippet length, in characters.
pub const SNIPPET_CHARS: usize = 240;
/// Maximum number of keywords echoed back.
pub const MAX_KEYWORDS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "has", "have",
    "had", "not", "but", "all", "any", "can", "our", "you", "your", "their", "about", "into",
    "over", "what", "when", "where", "which", "who", "how", "why", "will", "would", "should",
    "there", "here", "them", "they", "its", "also", "than", "then",
];

/// Limits and defaults decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub default_limit: usize,
    pub max_limit: usize,
    pub min_relevance: f32,
    /// Fall back to keyword matching when no vector hit clears the threshold.
    pub text_fallback: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 50,
            min_relevance: 0.5,
            text_fallback: true,
        }
    }
}

/// One search invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub types: Option<Vec<EntityType>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_relevance: Option<f32>,
    #[serde(default)]
    pub updated_since: Option<DateTime<Utc>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// A ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub snippet: String,
    /// Relevance in `[0.0, 1.0]`.
    pub relevance: f32,
    pub importance: u8,
    pub metadata: DocumentMetadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub by_type: BTreeMap<EntityType, usize>,
    pub search_time_ms: u64,
    /// Documents scored after the pre-filter.
    pub scanned: usize,
    /// Results came from keyword matching, not vector similarity.
    pub text_fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub keywords: Vec<String>,
    pub results: Vec<SearchHit>,
    pub grouped_by_type: BTreeMap<EntityType, Vec<SearchHit>>,
    pub total_results: usize,
    pub min_relevance: f32,
    pub stats: SearchStats,
    /// Served from a result cache rather than computed.
    pub from_cache: bool,
}

/// Map a cosine similarity in `[-1, 1]` onto `[0, 1]`.
///
/// Negative similarity clamps to 0; a threshold of 0.5 requires cos ≥ 0.5.
pub fn relevance(cosine: f32) -> f32 {
    cosine.clamp(0.0, 1.0)
}

/// Keyword-overlap relevance used when vector search finds nothing.
///
/// Per term: substring of the title +0.4, substring of the content +0.2,
/// whole title word +0.2, whole content word +0.1. The sum is divided by
/// `0.9 * terms.len()` and capped at 1.0. Any match scores at least 0.5;
/// no match scores 0.
pub fn text_relevance(title: &str, content: &str, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let title_lower = title.to_lowercase();
    let content_lower = content.to_lowercase();
    let title_words: HashSet<String> = tokenize(title).into_iter().collect();
    let content_words: HashSet<String> = tokenize(content).into_iter().collect();

    let mut score = 0.0f32;
    let mut matched = false;
    for term in terms {
        let term = term.to_lowercase();
        if title_lower.contains(&term) {
            score += 0.4;
            matched = true;
        }
        if content_lower.contains(&term) {
            score += 0.2;
            matched = true;
        }
        if title_words.contains(&term) {
            score += 0.2;
        }
        if content_words.contains(&term) {
            score += 0.1;
        }
    }

    if !matched {
        return 0.0;
    }
    let normalized = (score / (terms.len() as f32 * 0.9)).min(1.0);
    normalized.max(0.5)
}

/// Lowercased query terms of at least three characters, stop words
/// removed, de-duplicated in first-seen order.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| t.chars().count() >= 3 && !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_KEYWORDS)
        .collect()
}

/// Relevance (desc), importance (desc), updated_at (desc), id (asc).
fn compare_ranked(a: &(Document, f32), b: &(Document, f32)) -> Ordering {
    let ((da, ra), (db, rb)) = (a, b);
    rb.partial_cmp(ra)
        .unwrap_or(Ordering::Equal)
        .then_with(|| db.metadata.importance.cmp(&da.metadata.importance))
        .then_with(|| db.updated_at.cmp(&da.updated_at))
        .then_with(|| da.id.cmp(&db.id))
}

fn to_hit(doc: Document, relevance: f32) -> SearchHit {
    SearchHit {
        snippet: doc.content.chars().take(SNIPPET_CHARS).collect(),
        importance: doc.metadata.importance,
        id: doc.id,
        entity_type: doc.entity_type,
        entity_id: doc.entity_id,
        title: doc.title,
        relevance,
        metadata: doc.metadata,
        updated_at: doc.updated_at,
    }
}

/// Documents that cleared the threshold, best first, with their scores.
pub(crate) struct Ranked {
    pub docs: Vec<(Document, f32)>,
    pub keywords: Vec<String>,
    pub scanned: usize,
    pub text_fallback: bool,
}

/// Steps 2 to 7 of the scoring algorithm, on a non-empty trimmed query.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn rank<S, P>(
    store: &S,
    provider: &P,
    tenant: &TenantId,
    query: &str,
    req: &SearchRequest,
    min_relevance: f32,
    limit: usize,
    opts: &SearchOptions,
) -> Result<Ranked, SearchError>
where
    S: Store + ?Sized,
    P: EmbeddingProvider + ?Sized,
{
    let query_vec = provider.embed_query(query).await?;
    check_dims(store.dims(), &query_vec)?;
    let keywords = extract_keywords(query);

    let filter = ScanFilter {
        entity_types: req.types.clone().unwrap_or_default(),
        updated_since: req.updated_since,
    };
    let candidates: Vec<Document> = store
        .scan(tenant, &filter)
        .await?
        .into_iter()
        .filter(|d| &d.tenant_id == tenant && d.embedding.len() == query_vec.len())
        .collect();
    let scanned = candidates.len();

    let mut scores: Vec<f32> = candidates
        .iter()
        .map(|d| relevance(cosine_similarity(&query_vec, &d.embedding)))
        .collect();

    let mut text_fallback = false;
    if opts.text_fallback && !keywords.is_empty() && !scores.iter().any(|s| *s >= min_relevance) {
        let text_scores: Vec<f32> = candidates
            .iter()
            .map(|d| text_relevance(&d.title, &d.content, &keywords))
            .collect();
        if text_scores.iter().any(|s| *s > 0.0 && *s >= min_relevance) {
            scores = text_scores;
            text_fallback = true;
        }
    }

    let mut docs: Vec<(Document, f32)> = candidates
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| *score >= min_relevance && (!text_fallback || *score > 0.0))
        .collect();
    docs.sort_by(compare_ranked);
    docs.truncate(limit);

    Ok(Ranked {
        docs,
        keywords,
        scanned,
        text_fallback,
    })
}

/// Effective threshold: the request's, else the configured one, in `[0, 1]`.
pub(crate) fn effective_min_relevance(req: &SearchRequest, opts: &SearchOptions) -> f32 {
    req.min_relevance
        .unwrap_or(opts.min_relevance)
        .clamp(0.0, 1.0)
}

/// Run a semantic search for one tenant.
///
/// All-or-nothing: a provider or store failure returns an error, never a
/// partial result list.
pub async fn search<S, P>(
    store: &S,
    provider: &P,
    tenant: &TenantId,
    req: &SearchRequest,
    opts: &SearchOptions,
) -> Result<SearchResponse, SearchError>
where
    S: Store + ?Sized,
    P: EmbeddingProvider + ?Sized,
{
    let min_relevance = effective_min_relevance(req, opts);
    let query = req.query.trim();

    if query.is_empty() {
        return Ok(SearchResponse {
            query: req.query.clone(),
            min_relevance,
            ..Default::default()
        });
    }

    let limit = req
        .limit
        .unwrap_or(opts.default_limit)
        .clamp(1, opts.max_limit.max(1));

    let started = Instant::now();
    let ranked = rank(store, provider, tenant, query, req, min_relevance, limit, opts).await?;
    let hits: Vec<SearchHit> = ranked
        .docs
        .into_iter()
        .map(|(doc, score)| to_hit(doc, score))
        .collect();

    let mut grouped_by_type: BTreeMap<EntityType, Vec<SearchHit>> = BTreeMap::new();
    for hit in &hits {
        grouped_by_type
            .entry(hit.entity_type)
            .or_default()
            .push(hit.clone());
    }
    let by_type = grouped_by_type
        .iter()
        .map(|(t, hits)| (*t, hits.len()))
        .collect();
    let search_time_ms = started.elapsed().as_millis() as u64;

    Ok(SearchResponse {
        query: req.query.clone(),
        keywords: ranked.keywords,
        total_results: hits.len(),
        results: hits,
        grouped_by_type,
        min_relevance,
        stats: SearchStats {
            by_type,
            search_time_ms,
            scanned: ranked.scanned,
            text_fallback: ranked.text_fallback,
        },
        from_cache: false,
    })
}
