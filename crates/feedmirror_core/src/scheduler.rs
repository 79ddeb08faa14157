/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::cursor::CursorStore;
use crate::kv::{load_json, store_json, KvStore};

pub const DEFAULT_MAX_PER_ROUND: usize = 5;
const SCAN_FACTOR: usize = 3;
const STATE_KEY: &str = "scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Newest,
    History,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Newest => f.write_str("newest"),
            Phase::History => f.write_str("history"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub new_group_index: usize,
    #[serde(default)]
    pub old_group_index: usize,
    #[serde(default)]
    pub immediate_queue: Vec<String>,
    #[serde(default)]
    pub newest_fetch: bool,
    /// Forces the next rotation round into the newest phase.
    #[serde(default)]
    pub bootstrap: bool,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            new_group_index: 0,
            old_group_index: 0,
            immediate_queue: Vec::new(),
            newest_fetch: false,
            bootstrap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub phase: Phase,
    pub accounts: Vec<String>,
    pub immediate: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub batch: Batch,
    state: SchedulerState,
}

/// Picks the accounts for each round: the immediate queue first, otherwise a
/// bounded round-robin scan alternating between newest and history passes.
pub struct Scheduler {
    kv: Arc<dyn KvStore>,
    max_per_round: usize,
    state: SchedulerState,
}

impl Scheduler {
    pub fn load(kv: Arc<dyn KvStore>, max_per_round: usize) -> Result<Self> {
        let state = load_json::<SchedulerState>(kv.as_ref(), STATE_KEY)?.unwrap_or_default();
        debug!(?state, "scheduler state loaded");
        Ok(Self {
            kv,
            max_per_round: max_per_round.max(1),
            state,
        })
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Picks the next batch without touching stored state. The returned plan
    /// only takes effect once passed to [`Scheduler::commit`]; a dropped plan
    /// leaves the queue, the phase flag and both rotation indices as they were.
    pub fn plan(&self, accounts: &[String], cursors: &CursorStore) -> Plan {
        if let Some(plan) = self.plan_immediate() {
            return plan;
        }

        let mut state = self.state.clone();
        if state.bootstrap {
            state.newest_fetch = true;
            state.bootstrap = false;
        } else {
            state.newest_fetch = !state.newest_fetch;
        }
        let phase = if state.newest_fetch {
            Phase::Newest
        } else {
            Phase::History
        };

        let total = accounts.len();
        if total == 0 {
            return Plan {
                batch: Batch {
                    phase,
                    accounts: Vec::new(),
                    immediate: false,
                },
                state,
            };
        }

        // With more accounts than one batch holds, never scan the full circle so
        // the rotation index always lands somewhere new.
        let max_scan = if total > self.max_per_round {
            (self.max_per_round * SCAN_FACTOR).min(total - 1)
        } else {
            total
        };

        let start = match phase {
            Phase::Newest => state.new_group_index,
            Phase::History => state.old_group_index,
        } % total;

        let mut idx = start;
        let mut scanned = 0usize;
        let mut picked: Vec<String> = Vec::new();
        while scanned < max_scan && picked.len() < self.max_per_round {
            let id = &accounts[idx];
            let eligible = match phase {
                Phase::Newest => cursors.can_fetch_new(id),
                Phase::History => cursors.need_fetch_old(id),
            };
            if eligible && !picked.contains(id) {
                picked.push(id.clone());
            }
            scanned += 1;
            idx = (idx + 1) % total;
        }

        match phase {
            Phase::Newest => state.new_group_index = idx,
            Phase::History => state.old_group_index = idx,
        }
        debug!(%phase, start, scanned, picked = picked.len(), "rotation scan");

        Plan {
            batch: Batch {
                phase,
                accounts: picked,
                immediate: false,
            },
            state,
        }
    }

    /// Head of the immediate queue, if any. Rotation state is not part of it.
    pub fn plan_immediate(&self) -> Option<Plan> {
        if self.state.immediate_queue.is_empty() {
            return None;
        }
        let mut state = self.state.clone();
        let take = state.immediate_queue.len().min(self.max_per_round);
        let accounts: Vec<String> = state.immediate_queue.drain(..take).collect();
        Some(Plan {
            batch: Batch {
                phase: Phase::Newest,
                accounts,
                immediate: true,
            },
            state,
        })
    }

    pub fn commit(&mut self, plan: Plan) -> Result<()> {
        self.state = plan.state;
        self.save()
    }

    /// Returns false when the account was already queued.
    pub fn enqueue_immediate(&mut self, account_id: &str) -> Result<bool> {
        if self.state.immediate_queue.iter().any(|q| q == account_id) {
            return Ok(false);
        }
        self.state.immediate_queue.push(account_id.to_string());
        self.save()?;
        Ok(true)
    }

    pub fn dequeue_immediate(&mut self, account_id: &str) -> Result<bool> {
        let before = self.state.immediate_queue.len();
        self.state.immediate_queue.retain(|q| q != account_id);
        if self.state.immediate_queue.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn set_bootstrap(&mut self) -> Result<()> {
        self.state.bootstrap = true;
        self.save()
    }

    pub fn reset_state(&mut self) -> Result<()> {
        self.state = SchedulerState {
            newest_fetch: true,
            ..SchedulerState::default()
        };
        self.save()
    }

    fn save(&self) -> Result<()> {
        store_json(self.kv.as_ref(), STATE_KEY, &self.state)
    }
}
