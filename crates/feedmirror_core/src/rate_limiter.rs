/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::kv::{load_json, store_json, KvStore};

pub const DEFAULT_BASE_CAPACITY: i64 = 12;
pub const COOLDOWN_MS: i64 = 4 * 60 * 1000;

const STATE_KEY: &str = "rate_limiter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub tokens: i64,
    pub capacity: i64,
    #[serde(default)]
    pub cooldown_until_ms: i64,
}

/// Token bucket shared by all timer-driven fetches.
///
/// The remote limit is never observed directly; the bucket only approximates
/// it and backs off for [`COOLDOWN_MS`] whenever the remote rejects a call.
/// User-triggered consumption ignores the cooldown and may drive the bucket
/// into debt.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    base_capacity: i64,
    state: RateLimiterState,
}

impl RateLimiter {
    pub fn load(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, base_capacity: i64) -> Result<Self> {
        let base_capacity = base_capacity.max(1);
        let capacity = base_capacity.saturating_mul(2);
        let state = match load_json::<RateLimiterState>(kv.as_ref(), STATE_KEY)? {
            Some(mut s) => {
                s.capacity = capacity;
                s.tokens = s.tokens.min(capacity);
                s
            }
            None => RateLimiterState {
                tokens: capacity,
                capacity,
                cooldown_until_ms: 0,
            },
        };
        Ok(Self {
            kv,
            clock,
            base_capacity,
            state,
        })
    }

    pub fn state(&self) -> RateLimiterState {
        self.state
    }

    pub fn tokens(&self) -> i64 {
        self.state.tokens
    }

    pub fn base_capacity(&self) -> i64 {
        self.base_capacity
    }

    pub fn in_cooldown(&self) -> bool {
        self.clock.now_ms() < self.state.cooldown_until_ms
    }

    pub fn refill(&mut self, amount: i64) -> Result<()> {
        self.state.tokens = self.state.tokens.saturating_add(amount.max(0)).min(self.state.capacity);
        debug!(tokens = self.state.tokens, "rate limiter refilled");
        self.save()
    }

    pub fn refill_base(&mut self) -> Result<()> {
        self.refill(self.base_capacity)
    }

    /// Foreground consumption: never refused.
    pub fn consume_for_user(&mut self) -> Result<()> {
        self.state.tokens = self.state.tokens.saturating_sub(1);
        self.save()
    }

    /// Takes `n` tokens for a scheduled batch, or leaves the bucket untouched
    /// and returns false while cooling down or short on tokens.
    pub fn try_consume_for_batch(&mut self, n: usize) -> Result<bool> {
        let n = n as i64;
        if self.in_cooldown() {
            debug!(until = self.state.cooldown_until_ms, "rate limiter cooling down");
            return Ok(false);
        }
        if self.state.tokens < n {
            debug!(tokens = self.state.tokens, wanted = n, "rate limiter short on tokens");
            return Ok(false);
        }
        self.state.tokens -= n;
        self.save()?;
        Ok(true)
    }

    pub fn penalize(&mut self) -> Result<()> {
        self.state.cooldown_until_ms = self.clock.now_ms().saturating_add(COOLDOWN_MS);
        warn!(until = self.state.cooldown_until_ms, "remote rate limit hit, cooling down");
        self.save()
    }

    fn save(&self) -> Result<()> {
        store_json(self.kv.as_ref(), STATE_KEY, &self.state)
    }
}
