use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

use crate::batch::FetchConfig;
use crate::priority::PriorityPolicy;
use crate::reconcile::BackoffPolicy;

pub struct Config;

impl Config {
    /// Get the data directory path
    fn data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "starwatch", "starwatch")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    /// Database path: explicit override, else the platform data directory
    pub fn db_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
        match override_path {
            Some(path) => Ok(path),
            None => Ok(Self::data_dir()?.join("starwatch.db")),
        }
    }

    /// Get GitHub token from environment or gh CLI config
    pub fn github_token() -> Option<String> {
        for var in ["GITHUB_TOKEN", "GH_TOKEN"] {
            if let Ok(token) = std::env::var(var) {
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Knobs for one collection run
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Runs stop before fetching when the probe reports fewer calls than this
    pub min_budget_floor: u32,
    /// Calls held back from the selector's budget
    pub budget_reserve: u32,
    /// Limit used when the trigger does not supply one
    pub default_limit: usize,
    pub fetch: FetchConfig,
    pub priority: PriorityPolicy,
    pub backoff: BackoffPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            min_budget_floor: 50,
            budget_reserve: 10,
            default_limit: 5000,
            fetch: FetchConfig::default(),
            priority: PriorityPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl CollectorConfig {
    pub fn with_overrides(
        min_budget_floor: Option<u32>,
        chunk_size: Option<usize>,
        inter_chunk_delay_ms: Option<u64>,
    ) -> Self {
        let mut config = Self::default();
        if let Some(floor) = min_budget_floor {
            config.min_budget_floor = floor;
        }
        if let Some(size) = chunk_size {
            // GitHub rejects queries with more than 100 aliased lookups
            config.fetch.chunk_size = size.clamp(1, 100);
        }
        if let Some(ms) = inter_chunk_delay_ms {
            config.fetch.inter_chunk_delay = Duration::from_millis(ms);
        }
        config
    }
}
