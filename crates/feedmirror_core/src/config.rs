/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache_store::MAX_ITEMS_PER_ACCOUNT;
use crate::rate_limiter::DEFAULT_BASE_CAPACITY;
use crate::scheduler::DEFAULT_MAX_PER_ROUND;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SyncConfig {
    pub round_interval_secs: Option<u64>,
    pub refill_interval_secs: Option<u64>,
    pub max_per_round: Option<usize>,
    pub page_size: Option<u32>,
    pub bucket_base_capacity: Option<i64>,
    /// Pause between two successful fetches of one round. Derived from the
    /// round interval when unset.
    pub call_gap_ms: Option<u64>,
    pub max_items_per_account: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            round_interval_secs: Some(60),
            refill_interval_secs: Some(60),
            max_per_round: Some(DEFAULT_MAX_PER_ROUND),
            page_size: Some(20),
            bucket_base_capacity: Some(DEFAULT_BASE_CAPACITY),
            call_gap_ms: None,
            max_items_per_account: Some(MAX_ITEMS_PER_ACCOUNT),
        }
    }
}

impl SyncConfig {
    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.round_interval_secs.unwrap_or(60).clamp(10, 3600))
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_secs.unwrap_or(60).clamp(10, 3600))
    }

    pub fn max_per_round(&self) -> usize {
        self.max_per_round.unwrap_or(DEFAULT_MAX_PER_ROUND).clamp(1, 50)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(20).clamp(1, 200)
    }

    pub fn bucket_base_capacity(&self) -> i64 {
        self.bucket_base_capacity.unwrap_or(DEFAULT_BASE_CAPACITY).max(1)
    }

    pub fn max_items_per_account(&self) -> u32 {
        self.max_items_per_account.unwrap_or(MAX_ITEMS_PER_ACCOUNT).max(1)
    }

    /// Spreads a full batch over the round period, keeping one slot free.
    pub fn call_gap(&self) -> Duration {
        if let Some(ms) = self.call_gap_ms {
            return Duration::from_millis(ms);
        }
        let slots = self.max_per_round() as u32 + 1;
        self.round_interval() / slots
    }
}

/// Top-level document read by the service binary.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceConfig {
    pub api_base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_timeout_secs: Option<u64>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

impl ServiceConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: ServiceConfig = serde_json::from_str(text).context("parse config json")?;
        if cfg.api_base_url.trim().is_empty() {
            anyhow::bail!("missing api_base_url");
        }
        Ok(cfg)
    }

    pub fn sync(&self) -> SyncConfig {
        self.sync.clone().unwrap_or_default()
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs.unwrap_or(30).clamp(1, 300))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(d) => Ok(PathBuf::from(d)),
            None => default_data_dir(),
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("FEEDMIRROR_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "feedmirror", "FeedMirror")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
