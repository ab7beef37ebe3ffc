//! # Knowledge Harness CLI (`kh`)
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the SQLite database and schema |
//! | `kh reindex --tenant <id>` | Rebuild a tenant's index from its JSON exports |
//! | `kh index --tenant <id> --file <path>` | Index or replace one record |
//! | `kh remove --tenant <id> --type <t> --id <id>` | Drop one entity from the index |
//! | `kh search --tenant <id> "<query>"` | Semantic search |
//! | `kh context --tenant <id> "<query>"` | Token-budgeted knowledge context |
//! | `kh stats --tenant <id>` | Per-type document counts |
//! | `kh serve` | Start the HTTP API |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use knowledge_harness::{config, logging, migrate, reindex, search, server, stats};
use knowledge_harness_core::models::{EntityType, TenantId};

/// Knowledge Harness: multi-tenant semantic indexing and retrieval over
/// business records.
#[derive(Parser)]
#[command(name = "kh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Clear a tenant and rebuild its index from `[sources].root`.
    Reindex {
        #[arg(long)]
        tenant: String,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Index one record from a JSON file, replacing the entity's old
    /// documents.
    Index {
        #[arg(long)]
        tenant: String,

        /// File holding one serialized source record.
        #[arg(long)]
        file: PathBuf,
    },

    /// Remove every document of one entity.
    Remove {
        #[arg(long)]
        tenant: String,

        /// Entity type, e.g. `task` or `inbox_item`.
        #[arg(long = "type")]
        entity_type: EntityType,

        #[arg(long)]
        id: String,
    },

    /// Semantic search within a tenant.
    Search {
        query: String,

        #[arg(long)]
        tenant: String,

        /// Comma-separated entity types to restrict to.
        #[arg(long)]
        types: Option<String>,

        /// Only documents updated on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        min_relevance: Option<f32>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Assemble a knowledge context block for a prompt.
    Context {
        query: String,

        #[arg(long)]
        tenant: String,

        /// Comma-separated entity types to restrict to.
        #[arg(long)]
        types: Option<String>,

        /// Only documents updated on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        min_relevance: Option<f32>,

        /// Token budget; defaults to `[retrieval].context_max_tokens`.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Print the full context as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show per-type document counts.
    Stats {
        #[arg(long)]
        tenant: String,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn tenant_arg(raw: &str) -> anyhow::Result<TenantId> {
    Ok(TenantId::new(raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Reindex { tenant, json } => {
            reindex::run_reindex(&cfg, &tenant_arg(&tenant)?, json).await?;
        }
        Commands::Index { tenant, file } => {
            reindex::run_index_file(&cfg, &tenant_arg(&tenant)?, &file).await?;
        }
        Commands::Remove {
            tenant,
            entity_type,
            id,
        } => {
            reindex::run_remove(&cfg, &tenant_arg(&tenant)?, entity_type, &id).await?;
        }
        Commands::Search {
            query,
            tenant,
            types,
            since,
            limit,
            min_relevance,
            json,
        } => {
            let args = search::QueryArgs {
                query,
                types,
                since,
                limit,
                min_relevance,
            };
            search::run_search(&cfg, &tenant_arg(&tenant)?, args, json).await?;
        }
        Commands::Context {
            query,
            tenant,
            types,
            since,
            limit,
            min_relevance,
            max_tokens,
            json,
        } => {
            let args = search::QueryArgs {
                query,
                types,
                since,
                limit,
                min_relevance,
            };
            search::run_context(&cfg, &tenant_arg(&tenant)?, args, max_tokens, json).await?;
        }
        Commands::Stats { tenant } => {
            stats::run_stats(&cfg, &tenant_arg(&tenant)?).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
