//! Engine configuration loading
//!
//! Resolution priority for every field:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`INTERPD_*`)
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// HTTP bind address
    pub bind_addr: String,
    /// Pool batch tick period in seconds
    pub pool_tick_secs: u64,
    /// Load monitor evaluation period in seconds (minimum 60)
    pub monitor_tick_secs: u64,
    /// Bounded wait for the global capacity lock, milliseconds
    pub lock_wait_ms: u64,
    /// Commit attempts per candidate
    pub commit_retries: u32,
    /// Base backoff delay between commit attempts, milliseconds
    pub commit_backoff_ms: u64,
    /// Minutes after which a `processing` pool entry counts as stuck
    pub pool_stale_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("interpd.db"),
            bind_addr: "127.0.0.1:5810".to_string(),
            pool_tick_secs: 60,
            monitor_tick_secs: 300,
            lock_wait_ms: 5_000,
            commit_retries: 3,
            commit_backoff_ms: 100,
            pool_stale_minutes: 10,
        }
    }
}

/// Optional overrides as they appear in a TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub pool_tick_secs: Option<u64>,
    pub monitor_tick_secs: Option<u64>,
    pub lock_wait_ms: Option<u64>,
    pub commit_retries: Option<u32>,
    pub commit_backoff_ms: Option<u64>,
    pub pool_stale_minutes: Option<i64>,
}

impl EngineConfig {
    /// Resolve configuration from CLI arguments, environment, and an
    /// optional TOML file, then validate the result.
    pub fn load(
        cli_db_path: Option<&Path>,
        cli_bind_addr: Option<&str>,
        config_file: Option<&Path>,
    ) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(path) = config_file {
            let file = read_config_file(path)?;
            cfg.apply_file(file);
        }
        cfg.apply_env();

        // CLI wins over everything
        if let Some(path) = cli_db_path {
            cfg.db_path = path.to_path_buf();
        }
        if let Some(addr) = cli_bind_addr {
            cfg.bind_addr = addr.to_string();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.pool_tick_secs {
            self.pool_tick_secs = v;
        }
        if let Some(v) = file.monitor_tick_secs {
            self.monitor_tick_secs = v;
        }
        if let Some(v) = file.lock_wait_ms {
            self.lock_wait_ms = v;
        }
        if let Some(v) = file.commit_retries {
            self.commit_retries = v;
        }
        if let Some(v) = file.commit_backoff_ms {
            self.commit_backoff_ms = v;
        }
        if let Some(v) = file.pool_stale_minutes {
            self.pool_stale_minutes = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("INTERPD_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INTERPD_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_parse::<u64>("INTERPD_POOL_TICK_SECS") {
            self.pool_tick_secs = v;
        }
        if let Some(v) = env_parse::<u64>("INTERPD_MONITOR_TICK_SECS") {
            self.monitor_tick_secs = v;
        }
        if let Some(v) = env_parse::<u64>("INTERPD_LOCK_WAIT_MS") {
            self.lock_wait_ms = v;
        }
        if let Some(v) = env_parse::<u32>("INTERPD_COMMIT_RETRIES") {
            self.commit_retries = v;
        }
        if let Some(v) = env_parse::<u64>("INTERPD_COMMIT_BACKOFF_MS") {
            self.commit_backoff_ms = v;
        }
        if let Some(v) = env_parse::<i64>("INTERPD_POOL_STALE_MINUTES") {
            self.pool_stale_minutes = v;
        }
    }

    /// Field-level validation, all failures reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.monitor_tick_secs < 60 {
            problems.push(format!(
                "monitor_tick_secs must be >= 60 (got {})",
                self.monitor_tick_secs
            ));
        }
        if self.pool_tick_secs == 0 {
            problems.push("pool_tick_secs must be > 0".to_string());
        }
        if self.commit_retries == 0 {
            problems.push("commit_retries must be > 0".to_string());
        }
        if self.lock_wait_ms == 0 {
            problems.push("lock_wait_ms must be > 0".to_string());
        }
        if self.pool_stale_minutes <= 0 {
            problems.push(format!(
                "pool_stale_minutes must be > 0 (got {})",
                self.pool_stale_minutes
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
}
