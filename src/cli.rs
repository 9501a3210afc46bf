use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "engine-supervisor",
    about = "Launch a query engine and diagnose its startup failures",
    version
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch the engine and wait for it to exit
    Run {
        #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Identity owning the working directory (defaults to $USER)
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Print the engine command line
    Describe {
        #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// List engine log files in the working directory
    Logs {
        #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(short, long)]
        identity: Option<String>,
    },
}

/// `explicit`, else `$USER`, else `anonymous`.
pub fn resolve_identity(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}
