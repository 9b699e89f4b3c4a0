//! # twincache-config
//!
//! Configuration management for twincache.
//!
//! Loads configuration from:
//! 1. `~/.twincache/config.toml` (global)
//! 2. `.twincache/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Page size used when none (or an invalid one) is configured.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted from configuration.
pub const MIN_PAGE_SIZE: usize = 512;

/// Project-local config location, relative to the working directory.
pub const PROJECT_CONFIG_PATH: &str = ".twincache/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub writeback: WritebackConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.twincache/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_from(&global_path)?;
            }
        }

        // 2. Project config overrides global
        let project_path = Path::new(PROJECT_CONFIG_PATH);
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_from(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment
        config.apply_env_overrides();
        config.cache.page_size = config.cache.effective_page_size();

        Ok(config)
    }

    /// Parse a single config file without merging or env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.twincache/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".twincache/config.toml"))
    }

    /// Merge a project config over this one. Only values that differ from
    /// the defaults replace the current ones.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.cache.page_size != defaults.cache.page_size {
            self.cache.page_size = other.cache.page_size;
        }
        if other.cache.max_readahead_pages != defaults.cache.max_readahead_pages {
            self.cache.max_readahead_pages = other.cache.max_readahead_pages;
        }
        if other.writeback.stop_on_error != defaults.writeback.stop_on_error {
            self.writeback.stop_on_error = other.writeback.stop_on_error;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("TWINCACHE_PAGE_SIZE") {
            match size.parse() {
                Ok(n) => self.cache.page_size = n,
                Err(_) => warn!(value = %size, "Ignoring unparsable TWINCACHE_PAGE_SIZE"),
            }
        }
        if let Ok(pages) = std::env::var("TWINCACHE_READAHEAD_PAGES") {
            if let Ok(n) = pages.parse() {
                self.cache.max_readahead_pages = n;
            }
        }
        if let Ok(level) = std::env::var("TWINCACHE_LOG") {
            self.logging.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Page cache geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes per cache page (power of two, >= 512)
    pub page_size: usize,
    /// Largest batch handed to the engine in a single readahead fill
    pub max_readahead_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_readahead_pages: 32,
        }
    }
}

impl CacheConfig {
    /// The configured page size, or the default if it is not a usable value.
    pub fn effective_page_size(&self) -> usize {
        if self.page_size >= MIN_PAGE_SIZE && self.page_size.is_power_of_two() {
            self.page_size
        } else {
            warn!(
                page_size = self.page_size,
                "Invalid page size, falling back to {}", DEFAULT_PAGE_SIZE
            );
            DEFAULT_PAGE_SIZE
        }
    }

    /// Readahead batch limit, never zero.
    pub fn effective_readahead(&self) -> usize {
        self.max_readahead_pages.max(1)
    }
}

/// Writeback policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Stop a writeback pass at the first page that fails to flush
    pub stop_on_error: bool,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            stop_on_error: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> logging::LogLevel {
        self.level.parse().unwrap_or(logging::LogLevel::Warn)
    }
}
