//! LedgerSync CLI
//!
//! Command-line tools for inspecting and driving a local sync store.
//!
//! # Commands
//!
//! - `status` - Show the aggregated sync status
//! - `pending` - List queued local changes
//! - `conflicts` - List unresolved conflicts
//! - `enqueue` - Queue a local write
//! - `resolve` - Resolve a conflict
//! - `sync` - Run one sync cycle against a server
//! - `compact` - Rewrite the commit log as a snapshot

mod commands;

use clap::{Parser, Subcommand};
use commands::inspect::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LedgerSync command-line tools.
#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the aggregated sync status
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued local changes
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List unresolved conflicts
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Queue a local write
    Enqueue {
        /// Entity type, e.g. `transaction`
        entity_type: String,

        /// Entity identifier
        entity_id: String,

        /// Operation (create, update, delete)
        operation: String,

        /// JSON payload; omitted for deletes
        payload: Option<String>,
    },

    /// Resolve a conflict
    Resolve {
        /// Conflict identifier
        conflict_id: String,

        /// Resolution (local, server, merge)
        resolution: String,
    },

    /// Run one sync cycle
    Sync {
        /// Server base URL, or `loopback` for an in-process server
        #[arg(short, long)]
        server: String,

        /// Bearer token sent with every request
        #[arg(short, long)]
        token: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Rewrite the commit log as a snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::inspect::status(&path, Format::parse(&format)?)?;
        }
        Commands::Pending { format } => {
            let path = cli.path.ok_or("Store path required for pending")?;
            commands::inspect::pending(&path, Format::parse(&format)?)?;
        }
        Commands::Conflicts { format } => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            commands::inspect::conflicts(&path, Format::parse(&format)?)?;
        }
        Commands::Enqueue {
            entity_type,
            entity_id,
            operation,
            payload,
        } => {
            let path = cli.path.ok_or("Store path required for enqueue")?;
            commands::enqueue::run(
                &path,
                &entity_type,
                &entity_id,
                &operation,
                payload.as_deref(),
            )?;
        }
        Commands::Resolve {
            conflict_id,
            resolution,
        } => {
            let path = cli.path.ok_or("Store path required for resolve")?;
            commands::resolve::run(&path, &conflict_id, &resolution)?;
        }
        Commands::Sync {
            server,
            token,
            timeout,
        } => {
            let path = cli.path.ok_or("Store path required for sync")?;
            commands::sync::run(&path, &server, token.as_deref(), timeout).await?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("LedgerSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
