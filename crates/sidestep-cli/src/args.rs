//! Command-line arguments

use clap::{Parser, Subcommand, ValueEnum};

/// Userspace NFQUEUE packet mangler for SNI-targeted DPI evasion
#[derive(Debug, Parser)]
#[command(name = "sidestep", version, about)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "/etc/sidestep/config.json")]
    pub config: String,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Errors only
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per record
    Json,
    /// Terse single-line format
    Compact,
}

/// What to do
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bind the kernel queue and mangle matching traffic
    Run,
    /// Search for a working evasion against a domain, then install it
    Discover {
        /// Domain or URL to unblock
        target: String,
        /// Persist the winning configuration back to the config file
        #[arg(long)]
        save: bool,
    },
    /// Print the effective configuration after defaults and migration
    ShowConfig,
}
