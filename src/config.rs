//! Configuration management with YAML support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SyncError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff policy for busy/locked store writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Log tree watching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_root")]
    pub root: String,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// How long a file must stay unmodified before it is read
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns matched against file names
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,

    #[serde(default = "default_startup_retry_delay_ms")]
    pub startup_retry_delay_ms: u64,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Log file, appended to. Logs go to stderr when unset.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default value functions
fn default_database_path() -> String {
    "~/.local/share/tracemirror/mirror.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_watch_root() -> String {
    "~/.claude/projects".to_string()
}

fn default_max_depth() -> usize {
    3
}

fn default_quiescence_ms() -> u64 {
    500
}

fn default_extensions() -> Vec<String> {
    vec!["jsonl".to_string()]
}

fn default_ignore() -> Vec<String> {
    ["*.tmp", "*.swp", "*~", "*.part"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_health_interval_secs() -> u64 {
    15
}

fn default_startup_retries() -> u32 {
    3
}

fn default_startup_retry_delay_ms() -> u64 {
    500
}

fn default_state_dir() -> String {
    dirs::state_dir()
        .map(|d| d.join("tracemirror").to_string_lossy().to_string())
        .unwrap_or_else(|| "~/.local/state/tracemirror".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: default_watch_root(),
            max_depth: default_max_depth(),
            quiescence_ms: default_quiescence_ms(),
            extensions: default_extensions(),
            ignore: default_ignore(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            startup_retries: default_startup_retries(),
            startup_retry_delay_ms: default_startup_retry_delay_ms(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let millis = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

impl WatchConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./tracemirror.yaml (current directory)
    /// 3. ~/.config/tracemirror/tracemirror.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "tracemirror.yaml".to_string(),
            shellexpand::tilde("~/.config/tracemirror/tracemirror.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("Failed to read config {}", search_path))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", search_path))?;
                config.validate()?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.engine.workers == 0 {
            return Err(SyncError::Config("engine.workers must be at least 1".into()));
        }
        if self.database.retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "database.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.watch.extensions.is_empty() {
            return Err(SyncError::Config("watch.extensions must not be empty".into()));
        }
        if self.watch.channel_capacity == 0 {
            return Err(SyncError::Config(
                "watch.channel_capacity must be at least 1".into(),
            ));
        }
        for pattern in &self.watch.ignore {
            glob::Pattern::new(pattern).map_err(|e| {
                SyncError::Config(format!("invalid ignore pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        expand(&self.database.path)
    }

    pub fn watch_root(&self) -> PathBuf {
        expand(&self.watch.root)
    }

    pub fn state_dir(&self) -> PathBuf {
        expand(&self.engine.state_dir)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging.file.as_deref().map(expand)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
