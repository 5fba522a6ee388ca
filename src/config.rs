use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{hlog_debug, Error, Result};

/// Default scheduler tick between loop iterations, in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 500;
/// Default window after which a silent agent is considered stale.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 300;
/// Default number of queued messages delivered per channel per drain cycle.
pub const DEFAULT_DRAIN_BATCH: usize = 8;
/// Default duration of a downstream pause triggered by a critique failure.
pub const DEFAULT_PAUSE_SECS: u64 = 120;
/// Default ceiling on concurrently registered agents.
pub const DEFAULT_MAX_AGENTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Token budget for a run; overrides the completion service's own limit.
    pub budget_limit: Option<u64>,
    pub workspace_dir: Option<String>,
    /// Agent command line; defaults to `claude`.
    pub command: Option<String>,
    pub max_agents: Option<usize>,
    pub tick_ms: Option<u64>,
    pub heartbeat_secs: Option<u64>,
    pub drain_batch: Option<usize>,
    pub pause_secs: Option<u64>,
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn state_dir() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("state"))
    }

    pub fn workspaces_dir() -> Result<PathBuf> {
        let config = Self::load()?;
        match config.workspace_dir {
            Some(dir) => Ok(expand_tilde(&dir)),
            None => Ok(Self::hive_dir()?.join("workspaces")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents.unwrap_or(DEFAULT_MAX_AGENTS)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.unwrap_or(DEFAULT_TICK_MS))
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS))
    }

    pub fn drain_batch(&self) -> usize {
        self.drain_batch.unwrap_or(DEFAULT_DRAIN_BATCH)
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs(self.pause_secs.unwrap_or(DEFAULT_PAUSE_SECS))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        hlog_debug!(
            "Config loaded: budget_limit={:?}, workspace_dir={:?}, command={:?}",
            config.budget_limit,
            config.workspace_dir,
            config.command
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        hlog_debug!("Config::save hive_dir={}", hive_dir.display());
        if !hive_dir.exists() {
            hlog_debug!("Creating hive directory");
            fs::create_dir_all(&hive_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        let workspaces_dir = Self::workspaces_dir()?;
        let state_dir = Self::state_dir()?;
        hlog_debug!(
            "Config::ensure_dirs hive={} workspaces={}",
            hive_dir.display(),
            workspaces_dir.display()
        );
        if !hive_dir.exists() {
            hlog_debug!("Creating hive directory: {}", hive_dir.display());
            fs::create_dir_all(&hive_dir)?;
        }
        if !workspaces_dir.exists() {
            hlog_debug!("Creating workspaces directory: {}", workspaces_dir.display());
            fs::create_dir_all(&workspaces_dir)?;
        }
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
