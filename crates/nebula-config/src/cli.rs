//! Command-line argument parsing for the texture streamer.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Streaming command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-streaming", about = "Nebula texture streaming")]
pub struct CliArgs {
    /// Streaming pool capacity in megabytes.
    #[arg(long)]
    pub pool_size_mb: Option<u32>,

    /// Disable loading (trimming still runs).
    #[arg(long)]
    pub suppress_streaming: Option<bool>,

    /// Plan on the background worker instead of inline.
    #[arg(long)]
    pub job_update: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(size) = args.pool_size_mb {
            self.streaming.pool_size_mb = size;
        }
        if let Some(suppress) = args.suppress_streaming {
            self.streaming.suppress = suppress;
        }
        if let Some(job) = args.job_update {
            self.streaming.job_update = job;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
