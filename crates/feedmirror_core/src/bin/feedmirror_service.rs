/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use feedmirror_core::api::HttpTimelineApi;
use feedmirror_core::cache_store::CacheStore;
use feedmirror_core::clock::SystemClock;
use feedmirror_core::config::ServiceConfig;
use feedmirror_core::engine::SyncEngine;
use feedmirror_core::kv::SqliteKv;
use feedmirror_core::worker::start_sync_worker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn default_config_path() -> Result<PathBuf> {
    if cfg!(target_os = "windows") {
        let base = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(base).join("FeedMirror").join("config.json"));
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Ok(PathBuf::from(home).join(".config").join("feedmirror").join("config.json"))
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("FEEDMIRROR_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg_path = parse_config_path()?;
    info!("feedmirror service starting");
    info!("config: {}", cfg_path.display());

    let text = std::fs::read_to_string(&cfg_path)
        .with_context(|| format!("read config: {}", cfg_path.display()))?;
    let cfg = ServiceConfig::from_json(&text)?;
    let sync = cfg.sync();

    let data_dir = cfg.data_dir()?;
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir: {}", data_dir.display()))?;
    let kv = Arc::new(SqliteKv::open(data_dir.join("state.db"))?);
    let cache = CacheStore::open_with_cap(data_dir.join("cache.db"), sync.max_items_per_account())?;
    let api = Arc::new(HttpTimelineApi::new(
        &cfg.api_base_url,
        cfg.api_token.clone(),
        cfg.api_timeout(),
    )?);

    let mut engine = SyncEngine::open(&sync, kv, cache, api, Arc::new(SystemClock))?;
    if engine.bootstrap(cfg.accounts.clone())? {
        info!("empty cache, bootstrapping {} accounts", engine.accounts().len());
    }
    for id in engine.accounts() {
        debug!("{}", engine.cursor_status(id));
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = start_sync_worker(engine, sync.round_interval(), sync.refill_interval(), shutdown_rx);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let engine = worker.await.context("join sync worker")?;
    for id in engine.accounts() {
        debug!("{}", engine.cursor_status(id));
    }
    info!("feedmirror service stopped");
    Ok(())
}
