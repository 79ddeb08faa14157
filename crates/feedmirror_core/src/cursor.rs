/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::kv::KvStore;

pub const MAX_FAILURES: u32 = 5;
pub const SHORT_WAIT_MS: i64 = 40 * 1000;
pub const LONG_WAIT_MS: i64 = 20 * 60 * 1000;
pub const HISTORY_WAIT_MS: i64 = 5 * 60 * 1000;

const CURSOR_KEY_PREFIX: &str = "cursor:";

/// Pagination position and fetch windows for one tracked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub account_id: String,
    #[serde(default)]
    pub top_cursor: Option<String>,
    #[serde(default)]
    pub bottom_cursor: Option<String>,
    #[serde(default)]
    pub next_newest_fetch_at_ms: i64,
    #[serde(default)]
    pub next_history_fetch_at_ms: i64,
    #[serde(default)]
    pub cache_enough: bool,
    #[serde(default)]
    pub failure_count: u32,
}

impl Cursor {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            top_cursor: None,
            bottom_cursor: None,
            next_newest_fetch_at_ms: 0,
            next_history_fetch_at_ms: 0,
            cache_enough: false,
            failure_count: 0,
        }
    }

    pub fn network_valid(&self) -> bool {
        self.failure_count < MAX_FAILURES
    }

    pub fn can_fetch_new(&self, now_ms: i64) -> bool {
        now_ms > self.next_newest_fetch_at_ms && self.network_valid()
    }

    pub fn need_fetch_old(&self, now_ms: i64) -> bool {
        now_ms >= self.next_history_fetch_at_ms
            && !self.cache_enough
            && self.bottom_cursor.is_some()
            && self.network_valid()
    }

    /// Records a successful newest-page fetch. `None` for `new_top` means the
    /// remote had nothing newer, so the account is parked for the long wait.
    pub fn advance_newest(&mut self, now_ms: i64, new_top: Option<String>, bottom_if_unset: Option<String>) {
        self.failure_count = 0;
        if self.bottom_cursor.is_none() {
            self.bottom_cursor = bottom_if_unset;
        }
        match new_top {
            Some(top) => {
                self.top_cursor = Some(top);
                self.next_newest_fetch_at_ms = now_ms.saturating_add(SHORT_WAIT_MS);
            }
            None => {
                self.next_newest_fetch_at_ms = now_ms.saturating_add(LONG_WAIT_MS);
            }
        }
    }

    /// Records a successful history-page fetch. The previous bottom token is
    /// kept when none is returned; the account is then marked as having
    /// enough cache so no further backfill gets scheduled.
    pub fn advance_history(&mut self, now_ms: i64, new_bottom: Option<String>) {
        self.failure_count = 0;
        match new_bottom {
            Some(bottom) => {
                self.bottom_cursor = Some(bottom);
                self.next_history_fetch_at_ms = now_ms.saturating_add(HISTORY_WAIT_MS);
            }
            None => {
                self.cache_enough = true;
            }
        }
    }

    pub fn mark_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    pub fn reset_for_bootstrap(&mut self) {
        self.failure_count = 0;
        self.top_cursor = None;
        self.bottom_cursor = None;
        self.cache_enough = false;
        self.next_newest_fetch_at_ms = 0;
        self.next_history_fetch_at_ms = 0;
    }

    pub fn status(&self, now_ms: i64) -> CursorStatus {
        CursorStatus {
            account_id: self.account_id.clone(),
            top_cursor: self.top_cursor.clone(),
            bottom_cursor: self.bottom_cursor.clone(),
            can_fetch_new: self.can_fetch_new(now_ms),
            need_fetch_old: self.need_fetch_old(now_ms),
            cache_enough: self.cache_enough,
            failure_count: self.failure_count,
            network_valid: self.network_valid(),
            next_newest_in_secs: secs_until(now_ms, self.next_newest_fetch_at_ms),
            next_history_in_secs: secs_until(now_ms, self.next_history_fetch_at_ms),
        }
    }
}

fn secs_until(now_ms: i64, at_ms: i64) -> u64 {
    (at_ms.saturating_sub(now_ms).max(0) / 1000) as u64
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorStatus {
    pub account_id: String,
    pub top_cursor: Option<String>,
    pub bottom_cursor: Option<String>,
    pub can_fetch_new: bool,
    pub need_fetch_old: bool,
    pub cache_enough: bool,
    pub failure_count: u32,
    pub network_valid: bool,
    pub next_newest_in_secs: u64,
    pub next_history_in_secs: u64,
}

impl fmt::Display for CursorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = |s: u64| if s == 0 { "ready".to_string() } else { format!("{s}s") };
        write!(
            f,
            "{} top={} bottom={} new={} old={} enough={} failures={} newest_in={} history_in={}",
            self.account_id,
            self.top_cursor.as_deref().unwrap_or("null"),
            self.bottom_cursor.as_deref().unwrap_or("null"),
            self.can_fetch_new,
            self.need_fetch_old,
            self.cache_enough,
            self.failure_count,
            ready(self.next_newest_in_secs),
            ready(self.next_history_in_secs),
        )
    }
}

/// All cursors, loaded once and written back in batches.
pub struct CursorStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    cursors: HashMap<String, Cursor>,
    dirty: BTreeSet<String>,
}

impl CursorStore {
    pub fn load(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut cursors = HashMap::new();
        for key in kv.keys_with_prefix(CURSOR_KEY_PREFIX)? {
            let Some(raw) = kv.get(&key)? else {
                continue;
            };
            let cursor: Cursor = serde_json::from_slice(&raw).with_context(|| format!("decode cursor: {key}"))?;
            cursors.insert(cursor.account_id.clone(), cursor);
        }
        debug!(count = cursors.len(), "cursors loaded");
        Ok(Self {
            kv,
            clock,
            cursors,
            dirty: BTreeSet::new(),
        })
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Returns the stored cursor or a fresh default one. Does not persist.
    pub fn get(&self, account_id: &str) -> Cursor {
        self.cursors
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| Cursor::new(account_id))
    }

    fn touch(&mut self, account_id: &str) -> &mut Cursor {
        self.dirty.insert(account_id.to_string());
        self.cursors
            .entry(account_id.to_string())
            .or_insert_with(|| Cursor::new(account_id))
    }

    pub fn advance_newest(&mut self, account_id: &str, new_top: Option<String>, bottom_if_unset: Option<String>) {
        let now = self.now_ms();
        self.touch(account_id).advance_newest(now, new_top, bottom_if_unset);
    }

    pub fn advance_history(&mut self, account_id: &str, new_bottom: Option<String>) {
        let now = self.now_ms();
        self.touch(account_id).advance_history(now, new_bottom);
    }

    pub fn mark_failure(&mut self, account_id: &str) {
        self.touch(account_id).mark_failure();
    }

    pub fn mark_cache_enough(&mut self, account_id: &str) {
        self.touch(account_id).cache_enough = true;
    }

    pub fn reset_for_bootstrap(&mut self, account_id: &str) {
        self.touch(account_id).reset_for_bootstrap();
    }

    pub fn can_fetch_new(&self, account_id: &str) -> bool {
        let now = self.now_ms();
        self.cursors
            .get(account_id)
            .map(|c| c.can_fetch_new(now))
            .unwrap_or_else(|| Cursor::new(account_id).can_fetch_new(now))
    }

    pub fn need_fetch_old(&self, account_id: &str) -> bool {
        let now = self.now_ms();
        self.cursors
            .get(account_id)
            .map(|c| c.need_fetch_old(now))
            .unwrap_or(false)
    }

    pub fn status(&self, account_id: &str) -> CursorStatus {
        self.get(account_id).status(self.now_ms())
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every cursor touched since the last flush in one batch.
    pub fn persist_dirty(&mut self) -> Result<usize> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let mut entries = Vec::with_capacity(self.dirty.len());
        for id in &self.dirty {
            if let Some(c) = self.cursors.get(id) {
                let raw = serde_json::to_vec(c).context("encode cursor")?;
                entries.push((cursor_key(id), raw));
            }
        }
        self.kv.put_many(&entries)?;
        let n = entries.len();
        self.dirty.clear();
        Ok(n)
    }

    pub fn remove(&mut self, account_id: &str) -> Result<()> {
        self.cursors.remove(account_id);
        self.dirty.remove(account_id);
        self.kv.delete(&cursor_key(account_id))
    }
}

fn cursor_key(account_id: &str) -> String {
    format!("{CURSOR_KEY_PREFIX}{account_id}")
}
