//! Error types for the indexing and retrieval engine.
//!
//! Each component has its own error enum so that batch callers (the
//! reindex orchestrator) can count and skip per-record failures while
//! read callers (search) can surface a typed, all-or-nothing failure.

use thiserror::Error;

use crate::models::EntityType;

/// Errors raised while turning a source record into indexable text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    /// No normalizer strategy is registered for this entity type.
    #[error("no normalizer registered for entity type {0}")]
    UnsupportedType(EntityType),

    /// A mandatory field (usually the title) is absent or blank.
    #[error("{entity_type} {entity_id}: missing required field `{field}`")]
    MissingField {
        entity_type: EntityType,
        entity_id: String,
        field: String,
    },

    /// The normalized content is under the minimum indexable length.
    #[error("{entity_type} {entity_id}: content too short ({len} < {min} chars)")]
    ContentTooShort {
        entity_type: EntityType,
        entity_id: String,
        len: usize,
        min: usize,
    },
}

/// Errors raised by an embedding provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    /// Input text is empty after trimming.
    #[error("cannot embed empty text")]
    EmptyInput,

    /// The provider is disabled or not reachable.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The provider did not answer within the caller's deadline.
    #[error("embedding call timed out after {0} ms")]
    Timeout(u64),

    /// The provider answered with a vector of the wrong length.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Any other provider failure (bad response, exhausted retries).
    #[error("embedding provider failed: {0}")]
    Provider(String),
}

impl EmbeddingError {
    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Timeout(_) | EmbeddingError::Unavailable(_)
        )
    }
}

/// Errors raised by a [`Store`](crate::store::Store) backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Embedding length differs from the store's configured dimension.
    #[error("vector dimension mismatch: store expects {expected}, document has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The vector contains NaN or infinite components.
    #[error("vector contains non-finite values")]
    InvalidVector,

    /// The document's tenant does not match the tenant of the call.
    #[error("document belongs to tenant {document}, not {requested}")]
    TenantMismatch { requested: String, document: String },

    /// The supplied content hash does not match the content.
    #[error("content hash mismatch: supplied {supplied}, computed {computed}")]
    HashMismatch { supplied: String, computed: String },

    /// Backend failure that persisted after bounded retries.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised by a source collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The collection does not exist for this tenant; the type is skipped.
    #[error("source for {0} is unavailable: {1}")]
    Unavailable(EntityType, String),

    /// The collection exists but could not be read.
    #[error("source for {0} failed: {1}")]
    Failed(EntityType, String),
}

/// Errors surfaced by a search call. Searches never return partial results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("document scan failed: {0}")]
    Store(#[from] StoreError),
}
