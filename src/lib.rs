//! # Knowledge Harness
//!
//! Multi-tenant semantic indexing and retrieval over business records
//! (tasks, messages, contacts, deals, GTD items, ...).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────────────────┐   ┌──────────┐
//! │   Sources   │──▶│ Normalize → Embed →    │──▶│  SQLite  │
//! │ JSON export │   │ Upsert (dedup by hash) │   │ documents│
//! └─────────────┘   └────────────────────────┘   └────┬─────┘
//!                                                     │
//!                              ┌──────────────────────┤
//!                              ▼                      ▼
//!                         ┌──────────┐          ┌──────────┐
//!                         │   CLI    │          │   HTTP   │
//!                         │   (kh)   │          │  (axum)  │
//!                         └──────────┘          └──────────┘
//! ```
//!
//! The indexing and search algorithms live in `knowledge-harness-core`
//! behind the `Store`, `EmbeddingProvider` and `RecordSource` traits. This
//! crate supplies the SQLite store, HTTP embedding providers, file-backed
//! sources, configuration, and the two frontends.
//!
//! ## Quick Start
//!
//! ```bash
//! kh init
//! kh reindex --tenant acme
//! kh search --tenant acme "call the client about renewal"
//! kh serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | `Store` implementation on SQLite |
//! | [`embedding`] | Provider factory, HTTP providers, timeouts |
//! | [`source_json`] | JSON export files as record sources |
//! | [`reindex`] | Full and single-record indexing |
//! | [`search`] | `kh search` and `kh context` frontends |
//! | [`cache`] | Per-tenant search result cache for the server |
//! | [`stats`] | Per-tenant counts |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod logging;
pub mod migrate;
pub mod reindex;
pub mod search;
pub mod server;
pub mod source_json;
pub mod sqlite_store;
pub mod stats;
