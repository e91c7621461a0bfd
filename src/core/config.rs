//! Project configuration (`.gitgov/config.toml`).
//!
//! A missing file is not an error: every value has a default, so a freshly
//! bootstrapped working copy behaves the same as a configured one.

use crate::core::error::GitgovError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.toml";
pub const ACTOR_ENV: &str = "GITGOV_ACTOR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitgovConfig {
    pub project_name: String,
    pub current_actor: Option<String>,
    pub index: IndexConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Days an active-like task may go without activity before it counts as stalled.
    pub staleness_window_days: u64,
    /// Health score below which a task is at risk.
    pub at_risk_threshold: u32,
    pub activity_history_limit: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            staleness_window_days: 7,
            at_risk_threshold: 50,
            activity_history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub state_branch: String,
    pub remote: String,
    pub push_max_attempts: u32,
    /// Linear backoff unit between push attempts.
    pub push_backoff_ms: u64,
    pub git_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_branch: "gitgov-state".to_string(),
            remote: "origin".to_string(),
            push_max_attempts: 3,
            push_backoff_ms: 250,
            git_timeout_secs: 60,
        }
    }
}

impl GitgovConfig {
    /// Actor id from `GITGOV_ACTOR`, falling back to `current_actor`.
    pub fn resolve_current_actor(&self) -> Option<String> {
        std::env::var(ACTOR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.current_actor.clone())
    }
}

pub fn load_config(gitgov_dir: &Path) -> Result<GitgovConfig, GitgovError> {
    let path = gitgov_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(GitgovConfig::default());
    }
    let content = fs::read_to_string(&path)?;
    let config: GitgovConfig = toml::from_str(&content)?;
    Ok(config)
}

pub fn save_config(gitgov_dir: &Path, config: &GitgovConfig) -> Result<(), GitgovError> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| GitgovError::ValidationError(format!("config serialization: {}", e)))?;
    fs::create_dir_all(gitgov_dir)?;
    fs::write(gitgov_dir.join(CONFIG_FILE), rendered)?;
    Ok(())
}
