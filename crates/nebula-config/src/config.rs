//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level streamer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Texture streaming settings.
    pub streaming: StreamingConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Texture streaming configuration, read once per planning cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Physical capacity of the streaming pool in megabytes.
    pub pool_size_mb: u32,
    /// Disable all loading. Trimming and eviction keep running.
    pub suppress: bool,
    /// Run planning on the background worker. `false` plans inline on the calling thread.
    pub job_update: bool,
    /// Maximum number of loads submitted per cycle.
    pub max_requested_jobs: u32,
    /// Maximum megabytes of loads submitted per cycle.
    pub max_requested_mb: f32,
    /// Size of the in-flight streaming task slot pool.
    pub max_in_flight: u32,
    /// Single mips larger than this (in KB) are postponed unless urgent.
    pub postpone_threshold_kb: u32,
    /// Only mips finer than this index are candidates for postponing.
    pub postpone_threshold_mip: u8,
    /// Initial prestream phase: mip 0 is always deferred by one level.
    pub prestream: bool,
    /// Minimum streamable mip floor.
    pub min_mip: u8,
    /// Console platform: the GC ceiling is the plain memory limit.
    pub console_gc: bool,
    /// Number of applies the per-cycle caps stay lifted after a flush request.
    pub flush_frames: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Extra directive for the streaming planner target (empty = inherit).
    pub streaming_log_level: String,
    /// Warn when the planner reports a sustained budget overflow.
    pub warn_on_overflow: bool,
}

// --- Default implementations ---

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            pool_size_mb: 512,
            suppress: false,
            job_update: true,
            max_requested_jobs: 64,
            max_requested_mb: 16.0,
            max_in_flight: 128,
            postpone_threshold_kb: 1024,
            postpone_threshold_mip: 1,
            prestream: false,
            min_mip: 0,
            console_gc: false,
            flush_frames: 8,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            streaming_log_level: String::new(),
            warn_on_overflow: true,
        }
    }
}

impl StreamingConfig {
    /// Pool capacity in bytes.
    #[must_use]
    pub fn pool_size_bytes(&self) -> u64 {
        u64::from(self.pool_size_mb) * 1024 * 1024
    }

    /// Per-cycle submitted byte cap.
    #[must_use]
    pub fn max_requested_bytes(&self) -> u64 {
        (f64::from(self.max_requested_mb.max(0.0)) * 1024.0 * 1024.0) as u64
    }

    /// Postpone threshold in bytes.
    #[must_use]
    pub fn postpone_threshold_bytes(&self) -> u64 {
        u64::from(self.postpone_threshold_kb) * 1024
    }

    /// Reject settings that would stall streaming entirely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_in_flight",
                reason: "at least one streaming slot is required",
            });
        }
        if !self.max_requested_mb.is_finite() || self.max_requested_mb < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "max_requested_mb",
                reason: "must be a finite, non-negative size",
            });
        }
        Ok(())
    }
}

/// Platform config directory for the streamer (`<config_dir>/nebula`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nebula"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.streaming.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.streaming.validate()?;

        if &new_config != self {
            log::info!("Streaming config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
