/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;

/// Drives the engine from two timers: one round per `round_interval`, one
/// base refill per `refill_interval`. A [`crate::engine::SyncHandle`] request
/// wakes the loop early, but only the immediate queue is served then; rotation
/// rounds stay on the round timer.
pub fn start_sync_worker(
    mut engine: SyncEngine,
    round_interval: Duration,
    refill_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<SyncEngine> {
    tokio::spawn(async move {
        let notify = engine.notifier();
        let mut round_tick = tokio::time::interval(round_interval);
        round_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refill_tick = tokio::time::interval(refill_interval);
        refill_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first refill tick fires immediately; the bucket starts full anyway.
        refill_tick.tick().await;

        info!(
            round_secs = round_interval.as_secs(),
            refill_secs = refill_interval.as_secs(),
            "sync worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = refill_tick.tick() => {
                    if let Err(e) = engine.refill() {
                        warn!("rate limiter refill failed: {e:#}");
                    }
                }
                _ = round_tick.tick() => {
                    let report = engine.run_round().await;
                    debug!(outcome = ?report.outcome, batch = report.batch.len(), "sync round done");
                }
                _ = notify.notified() => {
                    let report = engine.run_immediate_round().await;
                    debug!(outcome = ?report.outcome, batch = report.batch.len(), "request round done");
                }
            }
        }

        info!("sync worker stopped");
        engine
    })
}
