//! Knowledge context assembly for retrieval-augmented prompts.
//!
//! [`get_context`] runs the ranking of [`search`](crate::search::search)
//! and concatenates the full content of the best documents into one text
//! block, stopping before the estimated token count would exceed the
//! budget:
//!
//! ```text
//! === Knowledge context ===
//!
//! [TASK] (relevance: 87%)
//! Task: Call client ABC
//!
//! ---
//!
//! ```

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::SearchError;
use crate::models::{EntityType, TenantId};
use crate::search::{effective_min_relevance, rank, SearchOptions, SearchRequest};
use crate::store::Store;

pub const CONTEXT_HEADER: &str = "=== Knowledge context ===";
/// Candidates ranked when the request carries no limit.
pub const DEFAULT_CONTEXT_RESULTS: usize = 15;
/// Token budget when the caller does not pick one.
pub const DEFAULT_MAX_TOKENS: usize = 3000;

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// One document included in the context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSource {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub relevance: f32,
    pub tokens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KnowledgeContext {
    pub query: String,
    /// Empty when nothing matched.
    pub text: String,
    pub sources: Vec<ContextSource>,
    /// Sum of the included documents' estimates. The header and separators
    /// are not counted.
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    /// A ranked document was left out because it did not fit.
    pub truncated: bool,
}

/// Build a context block for `req.query` within `max_tokens`.
///
/// Documents are taken in rank order; the first one that does not fit ends
/// the block.
pub async fn get_context<S, P>(
    store: &S,
    provider: &P,
    tenant: &TenantId,
    req: &SearchRequest,
    opts: &SearchOptions,
    max_tokens: usize,
) -> Result<KnowledgeContext, SearchError>
where
    S: Store + ?Sized,
    P: EmbeddingProvider + ?Sized,
{
    let mut context = KnowledgeContext {
        query: req.query.clone(),
        max_tokens,
        ..Default::default()
    };
    let query = req.query.trim();
    if query.is_empty() {
        return Ok(context);
    }

    let min_relevance = effective_min_relevance(req, opts);
    let limit = req
        .limit
        .unwrap_or(DEFAULT_CONTEXT_RESULTS)
        .clamp(1, opts.max_limit.max(1));
    let ranked = rank(store, provider, tenant, query, req, min_relevance, limit, opts).await?;
    if ranked.docs.is_empty() {
        return Ok(context);
    }

    let mut text = format!("{}\n\n", CONTEXT_HEADER);
    for (doc, score) in ranked.docs {
        let tokens = estimate_tokens(&doc.content);
        if context.estimated_tokens + tokens > max_tokens {
            context.truncated = true;
            break;
        }
        text.push_str(&format!(
            "[{}] (relevance: {}%)\n{}\n\n---\n\n",
            doc.entity_type,
            (score * 100.0).round() as u32,
            doc.content
        ));
        context.estimated_tokens += tokens;
        context.sources.push(ContextSource {
            id: doc.id,
            entity_type: doc.entity_type,
            entity_id: doc.entity_id,
            title: doc.title,
            relevance: score,
            tokens,
        });
    }

    if !context.sources.is_empty() {
        context.text = text;
    }
    Ok(context)
}
