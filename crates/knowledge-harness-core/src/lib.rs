//! # Knowledge Harness Core
//!
//! Engine-level logic for Knowledge Harness: the tenant-scoped data model,
//! per-entity content normalization, content-addressed hashing, the store
//! and embedding provider traits, source collaborator traits, the
//! exact-scan semantic search algorithm with its keyword fallback, and
//! token-budgeted context assembly.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Persistence backends, hosted embedding providers, and the reindex
//! orchestrator live in the `knowledge-harness` app crate.

pub mod context;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod models;
pub mod normalize;
pub mod search;
pub mod source;
pub mod store;
