//! # Book Memo CLI (`bookmemo`)
//!
//! Hosts the REST server and a few administrative commands that work
//! directly on the data directory.
//!
//! ## Usage
//!
//! ```bash
//! bookmemo --config ./config/bookmemo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bookmemo init` | Create the data directory and empty documents |
//! | `bookmemo serve` | Start the REST server |
//! | `bookmemo search "<query>"` | Cached catalog search |
//! | `bookmemo cache clear` | Invalidate cached searches |
//! | `bookmemo users` | List accounts |
//! | `bookmemo memos <book_id>` | Show a book's shared memos |
//!
//! A missing config file is not an error: every setting has a default and
//! the environment overrides still apply.

use std::path::{Path, PathBuf};

use bookmemo::{auth, config, public_memos, search, server, storage};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Book Memo: book search, personal shelves and shared reading memos.
#[derive(Parser)]
#[command(
    name = "bookmemo",
    about = "Book Memo: book search, personal shelves and shared reading memos",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/bookmemo.toml`.
    #[arg(long, global = true, default_value = "./config/bookmemo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and any missing documents.
    ///
    /// Existing documents are left untouched, so this is safe to rerun.
    Init,

    /// Start the REST server.
    Serve,

    /// Search the catalog through the server-side cache.
    Search {
        /// The search query string.
        query: String,

        /// Cache scope; omit for the guest scope.
        #[arg(long)]
        user: Option<String>,

        /// Bypass the cache and refresh the entry.
        #[arg(long)]
        skip_cache: bool,

        /// Maximum number of results (capped at 40).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage the search cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List accounts.
    Users,

    /// Show the shared memos for a book.
    Memos {
        /// Book id.
        book_id: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove cached searches.
    ///
    /// With `--user` only that user's scope is touched; with `--query`
    /// only that query is removed. With neither, everything goes.
    Clear {
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        query: Option<String>,
    },
}

fn load(path: &Path) -> anyhow::Result<config::Config> {
    if path.exists() {
        return config::load_config(path);
    }
    tracing::debug!(path = %path.display(), "config file not found, using defaults");
    let mut cfg = config::Config::minimal();
    config::apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    config::validate(&cfg)?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bookmemo=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            storage::run_init(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Search {
            query,
            user,
            skip_cache,
            limit,
        } => {
            search::run_search(&cfg, &query, user, skip_cache, limit).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear { user, query } => {
                search::run_clear_cache(&cfg, user.as_deref(), query.as_deref()).await?;
            }
        },
        Commands::Users => {
            auth::run_list_users(&cfg).await?;
        }
        Commands::Memos { book_id } => {
            public_memos::run_show_memos(&cfg, &book_id).await?;
        }
    }

    Ok(())
}
