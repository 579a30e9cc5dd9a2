use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Path to a TOML config file. If omitted, the gateway starts with no functions, models,
    /// or tools configured.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Loads and validates `--config-file` without binding a socket, then exits.
    Validate,
}

/// Process exit codes for `--command validate` and startup failures.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_USAGE_ERROR: i32 = 64;
pub const EXIT_INTERNAL_ERROR: i32 = 70;
