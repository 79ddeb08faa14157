/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::api::{rate_limit_of, TimelineApi};
use crate::cache_store::CacheStore;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::cursor::{CursorStatus, CursorStore};
use crate::kv::{load_json, store_json, KvStore};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{Phase, Plan, Scheduler};

const ACCOUNTS_KEY: &str = "accounts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Stored { items: usize, pruned: u64 },
    /// The remote had nothing for this phase; the cursor was parked.
    Exhausted,
    /// The account's window has not opened yet; nothing was fetched.
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Idle,
    LimiterRefused,
    Completed,
    StoppedOnFailure,
    StoreError,
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub phase: Option<Phase>,
    pub immediate: bool,
    pub batch: Vec<String>,
    pub attempted: Vec<String>,
    pub items_stored: usize,
    pub pruned: u64,
    pub failed: Option<String>,
    pub rate_limited: bool,
    /// Server hint attached to a rate-limit rejection.
    pub retry_after_secs: Option<u64>,
    pub outcome: RoundOutcome,
}

impl RoundReport {
    fn new() -> Self {
        Self {
            phase: None,
            immediate: false,
            batch: Vec::new(),
            attempted: Vec::new(),
            items_stored: 0,
            pruned: 0,
            failed: None,
            rate_limited: false,
            retry_after_secs: None,
            outcome: RoundOutcome::Idle,
        }
    }
}

pub enum SyncRequest {
    RequestImmediate(String),
    CancelImmediate(String),
    SyncNow {
        account_id: String,
        reply: oneshot::Sender<Result<FetchOutcome>>,
    },
}

/// Cloneable entry point for other tasks. Requests are applied by the engine
/// between rounds, never in the middle of one.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncRequest>,
    notify: Arc<Notify>,
}

impl SyncHandle {
    pub fn request_immediate_sync(&self, account_id: &str) -> Result<()> {
        self.send(SyncRequest::RequestImmediate(account_id.to_string()))
    }

    pub fn cancel_immediate_sync(&self, account_id: &str) -> Result<()> {
        self.send(SyncRequest::CancelImmediate(account_id.to_string()))
    }

    /// Foreground fetch of the account's newest page; resolves with the
    /// outcome or the fetch error.
    pub async fn sync_now(&self, account_id: &str) -> Result<FetchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncRequest::SyncNow {
            account_id: account_id.to_string(),
            reply,
        })?;
        rx.await.context("sync engine dropped request")?
    }

    fn send(&self, req: SyncRequest) -> Result<()> {
        self.tx
            .send(req)
            .map_err(|_| anyhow::anyhow!("sync engine stopped"))?;
        self.notify.notify_one();
        Ok(())
    }
}

enum Step {
    Done(FetchOutcome),
    Failed {
        rate_limited: bool,
        retry_after_secs: Option<u64>,
        error: anyhow::Error,
    },
}

/// Owns all sync state and drives rounds sequentially.
pub struct SyncEngine {
    api: Arc<dyn TimelineApi>,
    kv: Arc<dyn KvStore>,
    cache: CacheStore,
    cursors: CursorStore,
    limiter: RateLimiter,
    scheduler: Scheduler,
    accounts: Vec<String>,
    page_size: u32,
    call_gap: Duration,
    requests_tx: mpsc::UnboundedSender<SyncRequest>,
    requests_rx: mpsc::UnboundedReceiver<SyncRequest>,
    notify: Arc<Notify>,
}

impl SyncEngine {
    pub fn open(
        cfg: &SyncConfig,
        kv: Arc<dyn KvStore>,
        cache: CacheStore,
        api: Arc<dyn TimelineApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cursors = CursorStore::load(kv.clone(), clock.clone()).context("load cursors")?;
        let limiter = RateLimiter::load(kv.clone(), clock, cfg.bucket_base_capacity())
            .context("load rate limiter")?;
        let scheduler = Scheduler::load(kv.clone(), cfg.max_per_round()).context("load scheduler")?;
        let accounts: Vec<String> = load_json(kv.as_ref(), ACCOUNTS_KEY)?.unwrap_or_default();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        info!(
            accounts = accounts.len(),
            tokens = limiter.tokens(),
            queued = scheduler.state().immediate_queue.len(),
            "sync engine loaded"
        );
        Ok(Self {
            api,
            kv,
            cache,
            cursors,
            limiter,
            scheduler,
            accounts,
            page_size: cfg.page_size(),
            call_gap: cfg.call_gap(),
            requests_tx,
            requests_rx,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            tx: self.requests_tx.clone(),
            notify: self.notify.clone(),
        }
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cursor_status(&self, account_id: &str) -> CursorStatus {
        self.cursors.status(account_id)
    }

    pub fn is_cache_empty(&self) -> Result<bool> {
        self.cache.is_empty()
    }

    /// Replaces the tracked account list. When nothing is cached yet every
    /// account is reset so the first rounds pull fresh heads.
    pub fn bootstrap(&mut self, account_ids: Vec<String>) -> Result<bool> {
        let mut ids: Vec<String> = Vec::with_capacity(account_ids.len());
        for id in account_ids {
            let id = id.trim().to_string();
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.accounts = ids;
        self.save_accounts()?;

        if !self.is_cache_empty()? {
            return Ok(false);
        }
        for id in self.accounts.clone() {
            self.cursors.reset_for_bootstrap(&id);
        }
        self.cursors.persist_dirty()?;
        self.scheduler.set_bootstrap()?;
        info!(accounts = self.accounts.len(), "bootstrap: cache empty, all cursors reset");
        Ok(true)
    }

    pub fn reset_for_bootstrap(&mut self, account_id: &str) -> Result<()> {
        self.cursors.reset_for_bootstrap(account_id);
        self.cursors.persist_dirty()?;
        Ok(())
    }

    /// Starts tracking an account and queues it for the next round.
    pub fn track_account(&mut self, account_id: &str) -> Result<bool> {
        let account_id = account_id.trim();
        if account_id.is_empty() || self.accounts.iter().any(|a| a == account_id) {
            return Ok(false);
        }
        self.accounts.push(account_id.to_string());
        self.save_accounts()?;
        self.reset_for_bootstrap(account_id)?;
        self.scheduler.enqueue_immediate(account_id)?;
        info!(account = %account_id, "account tracked");
        Ok(true)
    }

    pub fn untrack_account(&mut self, account_id: &str) -> Result<bool> {
        let before = self.accounts.len();
        self.accounts.retain(|a| a != account_id);
        if self.accounts.len() == before {
            return Ok(false);
        }
        self.save_accounts()?;
        self.scheduler.dequeue_immediate(account_id)?;
        self.cursors.remove(account_id)?;
        let deleted = self.cache.delete_all_for_account(account_id)?;
        info!(account = %account_id, deleted, "account untracked");
        Ok(true)
    }

    pub fn request_immediate_sync(&mut self, account_id: &str) -> Result<bool> {
        self.scheduler.enqueue_immediate(account_id)
    }

    pub fn cancel_immediate_sync(&mut self, account_id: &str) -> Result<bool> {
        self.scheduler.dequeue_immediate(account_id)
    }

    pub fn refill(&mut self) -> Result<()> {
        self.limiter.refill_base()
    }

    /// Applies every request sent through a [`SyncHandle`] so far.
    pub async fn process_requests(&mut self) {
        while let Ok(req) = self.requests_rx.try_recv() {
            match req {
                SyncRequest::RequestImmediate(id) => {
                    if let Err(e) = self.request_immediate_sync(&id) {
                        warn!("enqueue immediate {id} failed: {e:#}");
                    }
                }
                SyncRequest::CancelImmediate(id) => {
                    if let Err(e) = self.cancel_immediate_sync(&id) {
                        warn!("dequeue immediate {id} failed: {e:#}");
                    }
                }
                SyncRequest::SyncNow { account_id, reply } => {
                    let res = self.sync_account_now(&account_id).await;
                    let _ = reply.send(res);
                }
            }
        }
    }

    /// User-driven newest fetch for one account. Bypasses the limiter's
    /// cooldown and reports failures to the caller.
    pub async fn sync_account_now(&mut self, account_id: &str) -> Result<FetchOutcome> {
        if !self.cursors.can_fetch_new(account_id) {
            debug!(account = %account_id, "sync now: not due");
            return Ok(FetchOutcome::NotDue);
        }
        self.limiter.consume_for_user()?;
        let step = self.fetch_account(account_id, Phase::Newest).await;
        self.cursors.persist_dirty()?;
        match step? {
            Step::Done(outcome) => Ok(outcome),
            Step::Failed { error, .. } => Err(error),
        }
    }

    /// Runs one scheduling round to completion. Never fails: fetch and store
    /// errors are folded into cursor state and the returned report.
    pub async fn run_round(&mut self) -> RoundReport {
        self.process_requests().await;
        let plan = self.scheduler.plan(&self.accounts, &self.cursors);
        self.execute(plan).await
    }

    /// Applies pending requests and fetches only the immediate queue. Rotation
    /// indices and the phase alternation stay untouched.
    pub async fn run_immediate_round(&mut self) -> RoundReport {
        self.process_requests().await;
        match self.scheduler.plan_immediate() {
            Some(plan) => self.execute(plan).await,
            None => RoundReport::new(),
        }
    }

    async fn execute(&mut self, plan: Plan) -> RoundReport {
        let mut report = RoundReport::new();
        let batch = plan.batch.clone();
        report.phase = Some(batch.phase);
        report.immediate = batch.immediate;
        report.batch = batch.accounts.clone();

        if batch.is_empty() {
            debug!(phase = %batch.phase, "round: nothing to fetch");
            if let Err(e) = self.scheduler.commit(plan) {
                warn!("scheduler save failed: {e:#}");
                report.outcome = RoundOutcome::StoreError;
            }
            return report;
        }

        // A refused plan is dropped so the same batch is offered next tick.
        match self.limiter.try_consume_for_batch(batch.accounts.len()) {
            Ok(true) => {}
            Ok(false) => {
                info!(phase = %batch.phase, size = batch.accounts.len(), "round: limiter refused batch");
                report.outcome = RoundOutcome::LimiterRefused;
                return report;
            }
            Err(e) => {
                warn!("rate limiter failed: {e:#}");
                report.outcome = RoundOutcome::StoreError;
                return report;
            }
        }
        if let Err(e) = self.scheduler.commit(plan) {
            warn!("scheduler save failed: {e:#}");
            report.outcome = RoundOutcome::StoreError;
            return report;
        }

        info!(
            phase = %batch.phase,
            immediate = batch.immediate,
            size = batch.accounts.len(),
            "round started"
        );
        report.outcome = RoundOutcome::Completed;
        let last = batch.accounts.len().saturating_sub(1);
        for (i, account_id) in batch.accounts.iter().enumerate() {
            report.attempted.push(account_id.clone());
            match self.fetch_account(account_id, batch.phase).await {
                Ok(Step::Done(outcome)) => {
                    if let FetchOutcome::Stored { items, pruned } = outcome {
                        report.items_stored += items;
                        report.pruned += pruned;
                    }
                }
                Ok(Step::Failed {
                    rate_limited,
                    retry_after_secs,
                    error,
                }) => {
                    warn!(
                        account = %account_id,
                        rate_limited,
                        retry_after = ?retry_after_secs,
                        "fetch failed, stopping round: {error:#}"
                    );
                    report.failed = Some(account_id.clone());
                    report.rate_limited = rate_limited;
                    report.retry_after_secs = retry_after_secs;
                    report.outcome = RoundOutcome::StoppedOnFailure;
                    break;
                }
                Err(e) => {
                    warn!(account = %account_id, "store failed, stopping round: {e:#}");
                    report.failed = Some(account_id.clone());
                    report.outcome = RoundOutcome::StoreError;
                    break;
                }
            }
            if i < last && !self.call_gap.is_zero() {
                tokio::time::sleep(self.call_gap).await;
            }
        }

        match self.cursors.persist_dirty() {
            Ok(n) => debug!(cursors = n, "round cursors persisted"),
            Err(e) => {
                warn!("persist cursors failed: {e:#}");
                report.outcome = RoundOutcome::StoreError;
            }
        }
        info!(
            phase = %batch.phase,
            attempted = report.attempted.len(),
            stored = report.items_stored,
            pruned = report.pruned,
            outcome = ?report.outcome,
            "round finished"
        );
        report
    }

    /// One API call plus the resulting cache and cursor updates. `Err` is
    /// reserved for local store failures.
    async fn fetch_account(&mut self, account_id: &str, phase: Phase) -> Result<Step> {
        let cursor = self.cursors.get(account_id);
        let token = match phase {
            Phase::Newest => cursor.top_cursor.clone(),
            Phase::History => match cursor.bottom_cursor.clone() {
                Some(b) => Some(b),
                None => {
                    debug!(account = %account_id, "history fetch without bottom cursor, skipped");
                    return Ok(Step::Done(FetchOutcome::Exhausted));
                }
            },
        };

        let page = match self.api.fetch_page(account_id, self.page_size, token.as_deref()).await {
            Ok(p) => p,
            Err(error) => {
                self.cursors.mark_failure(account_id);
                let retry_after_secs = rate_limit_of(&error).map(|rl| rl.retry_after_secs);
                if retry_after_secs.is_some() {
                    self.limiter.penalize()?;
                }
                return Ok(Step::Failed {
                    rate_limited: retry_after_secs.is_some(),
                    retry_after_secs: retry_after_secs.flatten(),
                    error,
                });
            }
        };

        let mut pruned = 0;
        if !page.is_empty() {
            let cache = self.cache.clone();
            let id = account_id.to_string();
            let items = page.items.clone();
            pruned = tokio::task::spawn_blocking(move || cache.upsert(&id, &items)).await??;
        }

        let outcome = match phase {
            Phase::Newest => {
                if page.is_empty() {
                    self.cursors.advance_newest(account_id, None, page.bottom_cursor.clone());
                    FetchOutcome::Exhausted
                } else {
                    self.cursors
                        .advance_newest(account_id, page.top_cursor.clone(), page.bottom_cursor.clone());
                    FetchOutcome::Stored {
                        items: page.items.len(),
                        pruned,
                    }
                }
            }
            Phase::History => {
                let exhausted = page.is_empty() && (!page.has_more || page.bottom_cursor == token);
                let next = if exhausted { None } else { page.bottom_cursor.clone() };
                self.cursors.advance_history(account_id, next);
                if page.is_empty() {
                    FetchOutcome::Exhausted
                } else {
                    FetchOutcome::Stored {
                        items: page.items.len(),
                        pruned,
                    }
                }
            }
        };

        if pruned > 0 {
            self.cursors.mark_cache_enough(account_id);
        }
        debug!(account = %account_id, %phase, ?outcome, "fetch done");
        Ok(Step::Done(outcome))
    }

    fn save_accounts(&self) -> Result<()> {
        store_json(self.kv.as_ref(), ACCOUNTS_KEY, &self.accounts)
    }
}
