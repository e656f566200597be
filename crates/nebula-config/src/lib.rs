//! Configuration system for the Nebula texture streamer.
//!
//! Provides runtime-configurable streaming settings that persist to disk as RON
//! files. Supports CLI overrides via clap, hot-reload detection, and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, StreamingConfig, default_config_dir};
pub use error::ConfigError;
