//! fhirsync CLI
//!
//! Command-line tools for inspecting the durable state of a fhirsync engine.
//!
//! # Commands
//!
//! - `inspect-cache` - Decode a cached resource payload
//! - `parse-id` - Parse a composite resource id
//! - `dump-ledger` - List dedup ledger entries
//! - `dump-staging` - List staged inbound payloads
//! - `verify` - Check record log integrity
//! - `compact` - Rewrite record logs with live records only
//! - `check-config` - Validate an engine configuration file

mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Offline tools for a fhirsync engine's state directory.
#[derive(Parser)]
#[command(name = "fhirsync", author, version, about, long_about = None)]
struct Cli {
    /// Engine state directory holding ledger.log and staging.log
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Log at debug level
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the listing commands.
#[derive(Args)]
struct ListArgs {
    /// Stop after this many entries
    #[arg(short, long)]
    limit: Option<usize>,

    /// Key prefix to filter on, e.g. a configuration id
    #[arg(long, default_value = "")]
    prefix: String,

    #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
    format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a payload as stored in the resource cache
    InspectCache {
        file: PathBuf,
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },

    /// Split a composite id such as te-abc123 into type and id
    ParseId {
        value: String,
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },

    /// List what the dedup ledger has recorded
    DumpLedger(ListArgs),

    /// List inbound payloads waiting in staging
    DumpStaging(ListArgs),

    /// Scan the record logs for torn or corrupt records
    Verify {
        #[arg(short, long)]
        ledger: bool,
        #[arg(short, long)]
        staging: bool,
        /// Both logs; the default when neither is named
        #[arg(short, long)]
        all: bool,
    },

    /// Drop superseded and deleted records from the logs
    Compact {
        /// Report sizes without rewriting anything
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Load and validate an engine configuration file
    CheckConfig { file: PathBuf },

    /// Print CLI and engine versions
    Version,
}

fn state_dir(path: Option<PathBuf>, command: &str) -> Result<PathBuf, String> {
    path.ok_or_else(|| format!("{command} needs --path pointing at the engine state directory"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = cli.path;
    match cli.command {
        Commands::InspectCache { file, format } => commands::inspect_cache::run(&file, &format)?,
        Commands::ParseId { value, format } => commands::parse_id::run(&value, &format)?,
        Commands::DumpLedger(list) => commands::dump_ledger::run(
            &state_dir(path, "dump-ledger")?,
            list.limit,
            &list.prefix,
            &list.format,
        )?,
        Commands::DumpStaging(list) => commands::dump_staging::run(
            &state_dir(path, "dump-staging")?,
            list.limit,
            &list.prefix,
            &list.format,
        )?,
        Commands::Verify { ledger, staging, all } => {
            let both = all || !(ledger || staging);
            commands::verify::run(&state_dir(path, "verify")?, ledger || both, staging || both)?;
        }
        Commands::Compact { dry_run } => {
            commands::compact::run(&state_dir(path, "compact")?, dry_run)?;
        }
        Commands::CheckConfig { file } => commands::check_config::run(&file)?,
        Commands::Version => {
            println!("fhirsync {} (engine {})", env!("CARGO_PKG_VERSION"), fhirsync_engine::VERSION);
        }
    }

    Ok(())
}
