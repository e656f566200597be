//! Structured logging and tracing for the texture streamer.
//!
//! Installs a `tracing` subscriber with console output, an optional JSON file
//! log in debug builds, and an `EnvFilter` assembled from the configuration.
//! The planner logs under the `nebula_texture_streaming` target, which can be
//! raised independently of the global level via `debug.streaming_log_level`.

use std::path::Path;

use nebula_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Base filter used when neither `RUST_LOG` nor the config provide one.
const DEFAULT_FILTER: &str = "info";

/// Target the streaming planner logs under.
const STREAMING_TARGET: &str = "nebula_texture_streaming";

/// Errors from subscriber installation.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Another global subscriber was installed first.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,

    /// The JSON log file could not be created.
    #[error("failed to create log file in {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Build the filter directive string from an optional config.
///
/// The global level comes from `debug.log_level` (default `info`); a non-empty
/// `debug.streaming_log_level` adds a directive for the planner target.
pub fn filter_directives(config: Option<&Config>) -> String {
    let Some(config) = config else {
        return DEFAULT_FILTER.to_string();
    };
    let mut directives = if config.debug.log_level.is_empty() {
        DEFAULT_FILTER.to_string()
    } else {
        config.debug.log_level.clone()
    };
    if !config.debug.streaming_log_level.is_empty() {
        directives.push(',');
        directives.push_str(STREAMING_TARGET);
        directives.push('=');
        directives.push_str(&config.debug.streaming_log_level);
    }
    directives
}

/// Initialize the tracing subscriber, returning an error instead of panicking.
///
/// * `log_dir` - directory for the JSON log (`streaming.log`), debug builds only
/// * `debug_build` - enables the JSON file layer
/// * `config` - source of the filter directives; `RUST_LOG` takes precedence
pub fn try_init_logging(
    log_dir: Option<&Path>,
    debug_build: bool,
    config: Option<&Config>,
) -> Result<(), LogError> {
    let directives = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true) // the planning worker is named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build && let Some(log_dir) = log_dir {
        let log_file = std::fs::create_dir_all(log_dir)
            .and_then(|()| std::fs::File::create(log_dir.join("streaming.log")))
            .map_err(|source| LogError::LogFile {
                path: log_dir.display().to_string(),
                source,
            })?;
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        return subscriber
            .with(file_layer)
            .try_init()
            .map_err(|_| LogError::AlreadyInstalled);
    }

    subscriber.try_init().map_err(|_| LogError::AlreadyInstalled)
}

/// Initialize logging, reporting (not failing on) a second installation.
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    if let Err(err) = try_init_logging(log_dir, debug_build, config) {
        eprintln!("nebula-log: {err}");
    }
}
