//! CloudSync CLI
//!
//! Command-line tools for CloudSync token stores.
//!
//! # Commands
//!
//! - `tokens` - List stored change tokens and subscription flags
//! - `reset` - Clear change tokens to force a refetch
//! - `demo` - Run a full sync cycle against an in-memory cloud

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CloudSync command-line tools.
#[derive(Parser)]
#[command(name = "cloudsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the token store file
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored change tokens and subscription flags
    Tokens {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear change tokens so the next fetch starts over
    Reset {
        /// Only clear this zone's token
        #[arg(short, long)]
        zone: Option<String>,

        /// Also clear cached subscription flags
        #[arg(long)]
        subscriptions: bool,
    },

    /// Run provisioning and a fetch cycle against an in-memory cloud
    Demo {
        /// Number of zones
        #[arg(long, default_value = "2")]
        zones: usize,

        /// Number of records per zone
        #[arg(long, default_value = "10")]
        records: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Tokens { format } => {
            let store = cli.store.ok_or("Token store path required for tokens")?;
            commands::tokens::run(&store, &format)?;
        }
        Commands::Reset {
            zone,
            subscriptions,
        } => {
            let store = cli.store.ok_or("Token store path required for reset")?;
            commands::reset::run(&store, zone.as_deref(), subscriptions)?;
        }
        Commands::Demo { zones, records } => {
            commands::demo::run(zones, records, cli.store.as_deref())?;
        }
        Commands::Version => {
            println!("CloudSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
