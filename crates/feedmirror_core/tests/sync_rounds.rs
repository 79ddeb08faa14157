/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use feedmirror_core::api::{RateLimited, TimelineApi};
use feedmirror_core::cache_store::CacheStore;
use feedmirror_core::clock::ManualClock;
use feedmirror_core::config::SyncConfig;
use feedmirror_core::cursor::{CursorStore, MAX_FAILURES};
use feedmirror_core::engine::{FetchOutcome, RoundOutcome, SyncEngine, SyncHandle};
use feedmirror_core::kv::{KvStore, MemoryKv, SqliteKv};
use feedmirror_core::scheduler::Phase;
use feedmirror_core::{TimelineItem, TimelinePage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000_000;

enum Scripted {
    Page(TimelinePage),
    RateLimited,
}

#[derive(Default)]
struct FakeApi {
    counter: AtomicUsize,
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    on_fetch: Mutex<Option<(String, String, SyncHandle)>>,
}

impl FakeApi {
    fn script(&self, account_id: &str, step: Scripted) {
        self.scripted
            .lock()
            .unwrap()
            .entry(account_id.to_string())
            .or_default()
            .push_back(step);
    }

    fn fail_always(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    fn called_accounts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(a, _)| a).collect()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

fn item(account_id: &str, id: String, created_at_ms: i64) -> TimelineItem {
    TimelineItem {
        item_id: id,
        account_id: account_id.to_string(),
        created_at_ms,
        payload: serde_json::json!({ "text": "hello" }),
    }
}

#[async_trait]
impl TimelineApi for FakeApi {
    async fn fetch_page(&self, account_id: &str, _page_size: u32, cursor: Option<&str>) -> Result<TimelinePage> {
        self.calls
            .lock()
            .unwrap()
            .push((account_id.to_string(), cursor.map(str::to_string)));

        if let Some((trigger, target, handle)) = self.on_fetch.lock().unwrap().as_ref() {
            if trigger == account_id {
                handle.request_immediate_sync(target)?;
            }
        }
        if self.failing.lock().unwrap().contains(account_id) {
            anyhow::bail!("connection reset: {account_id}");
        }
        let step = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(account_id)
            .and_then(|q| q.pop_front());
        match step {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::RateLimited) => Err(anyhow::Error::new(RateLimited {
                retry_after_secs: Some(60),
            })),
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(TimelinePage {
                    items: vec![item(account_id, format!("{account_id}-{n}"), n as i64)],
                    top_cursor: Some(format!("top-{n}")),
                    bottom_cursor: Some(format!("bottom-{n}")),
                    has_more: true,
                })
            }
        }
    }
}

struct Harness {
    _dir: TempDir,
    engine: SyncEngine,
    api: Arc<FakeApi>,
    clock: ManualClock,
}

fn cfg(base_capacity: i64) -> SyncConfig {
    SyncConfig {
        call_gap_ms: Some(0),
        bucket_base_capacity: Some(base_capacity),
        ..SyncConfig::default()
    }
}

fn harness_with(accounts: &[&str], cap: u32, base_capacity: i64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::open_with_cap(dir.path().join("cache.db"), cap).unwrap();
    let api = Arc::new(FakeApi::default());
    let clock = ManualClock::new(T0);
    let mut engine = SyncEngine::open(
        &cfg(base_capacity),
        Arc::new(MemoryKv::new()),
        cache,
        api.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    assert!(engine
        .bootstrap(accounts.iter().map(|a| a.to_string()).collect())
        .unwrap());
    Harness {
        _dir: dir,
        engine,
        api,
        clock,
    }
}

fn harness(accounts: &[&str]) -> Harness {
    harness_with(accounts, 200, 12)
}

fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn rounds_alternate_phases_and_rotate_through_accounts() {
    let accounts = ["a0", "a1", "a2", "a3", "a4", "a5", "a6"];
    let mut h = harness(&accounts);

    let r1 = h.engine.run_round().await;
    assert_eq!(r1.phase, Some(Phase::Newest));
    assert_eq!(r1.outcome, RoundOutcome::Completed);
    assert_eq!(r1.attempted, names(&["a0", "a1", "a2", "a3", "a4"]));
    assert_eq!(r1.items_stored, 5);
    assert!(h.api.calls().iter().all(|(_, c)| c.is_none()));
    assert_eq!(h.engine.limiter().tokens(), 24 - 5);

    h.clock.advance_secs(60);
    h.api.clear_calls();
    let r2 = h.engine.run_round().await;
    assert_eq!(r2.phase, Some(Phase::History));
    assert_eq!(r2.attempted, names(&["a0", "a1", "a2", "a3", "a4"]));
    let cursors: Vec<Option<String>> = h.api.calls().into_iter().map(|(_, c)| c).collect();
    assert!(cursors.iter().all(|c| c.as_deref().is_some_and(|c| c.starts_with("bottom-"))));

    h.clock.advance_secs(60);
    let r3 = h.engine.run_round().await;
    assert_eq!(r3.phase, Some(Phase::Newest));
    assert_eq!(r3.attempted, names(&["a5", "a6", "a0", "a1", "a2"]));
    assert_eq!(h.engine.cache().total_count().unwrap(), 15);
}

#[tokio::test]
async fn rate_limit_stops_the_batch_and_starts_cooldown() {
    let mut h = harness(&["a0", "a1", "a2", "a3", "a4"]);
    h.api.script("a2", Scripted::RateLimited);

    let r1 = h.engine.run_round().await;
    assert_eq!(r1.outcome, RoundOutcome::StoppedOnFailure);
    assert!(r1.rate_limited);
    assert_eq!(r1.retry_after_secs, Some(60));
    assert_eq!(r1.failed.as_deref(), Some("a2"));
    assert_eq!(h.api.called_accounts(), names(&["a0", "a1", "a2"]));
    assert!(h.engine.limiter().in_cooldown());
    assert_eq!(h.engine.cursors().get("a2").failure_count, 1);
    assert!(h.engine.cursors().get("a3").top_cursor.is_none());
    assert!(h.engine.cursors().get("a1").top_cursor.is_some());

    h.clock.advance_secs(60);
    h.api.clear_calls();
    let r2 = h.engine.run_round().await;
    assert_eq!(r2.phase, Some(Phase::History));
    assert_eq!(r2.outcome, RoundOutcome::LimiterRefused);
    assert!(h.api.calls().is_empty());

    // The refused history batch is retried once the cooldown is over.
    h.clock.advance_secs(4 * 60);
    let r3 = h.engine.run_round().await;
    assert_eq!(r3.phase, Some(Phase::History));
    assert_eq!(r3.outcome, RoundOutcome::Completed);
    assert_eq!(r3.attempted, names(&["a0", "a1"]));

    let r4 = h.engine.run_round().await;
    assert_eq!(r4.phase, Some(Phase::Newest));
    assert_eq!(r4.outcome, RoundOutcome::Completed);
    assert_eq!(h.engine.cursors().get("a2").failure_count, 0);
}

#[tokio::test]
async fn request_made_mid_round_leads_the_next_round() {
    let accounts = ["a0", "a1", "a2", "a3", "a4", "a5", "a6"];
    let mut h = harness(&accounts);
    let handle = h.engine.handle();
    *h.api.on_fetch.lock().unwrap() = Some(("a1".into(), "a6".into(), handle));

    let r1 = h.engine.run_round().await;
    assert_eq!(r1.attempted, names(&["a0", "a1", "a2", "a3", "a4"]));
    assert!(h.engine.scheduler().state().immediate_queue.is_empty());

    *h.api.on_fetch.lock().unwrap() = None;
    let r2 = h.engine.run_round().await;
    assert!(r2.immediate);
    assert_eq!(r2.phase, Some(Phase::Newest));
    assert_eq!(r2.attempted, names(&["a6"]));

    let r3 = h.engine.run_round().await;
    assert!(!r3.immediate);
    assert_eq!(r3.phase, Some(Phase::History));
}

#[tokio::test]
async fn cancelled_request_is_dropped_before_the_round() {
    let mut h = harness(&["a0", "a1"]);
    let handle = h.engine.handle();
    handle.request_immediate_sync("a1").unwrap();
    handle.cancel_immediate_sync("a1").unwrap();

    let r = h.engine.run_round().await;
    assert!(!r.immediate);
    assert_eq!(r.attempted, names(&["a0", "a1"]));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let kv_path = dir.path().join("state.db");
    let cache_path = dir.path().join("cache.db");
    let api = Arc::new(FakeApi::default());
    let clock = ManualClock::new(T0);

    let before = {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&kv_path).unwrap());
        let mut engine = SyncEngine::open(
            &cfg(12),
            kv,
            CacheStore::open(&cache_path).unwrap(),
            api.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        engine.bootstrap(names(&["a0", "a1", "a2"])).unwrap();
        engine.run_round().await;
        engine.request_immediate_sync("a2").unwrap();
        (
            engine.cursors().get("a1"),
            engine.scheduler().state().clone(),
            engine.limiter().state(),
        )
    };

    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&kv_path).unwrap());
    let mut engine = SyncEngine::open(
        &cfg(12),
        kv,
        CacheStore::open(&cache_path).unwrap(),
        api,
        Arc::new(clock),
    )
    .unwrap();
    assert_eq!(engine.accounts(), names(&["a0", "a1", "a2"]).as_slice());
    assert_eq!(engine.cursors().get("a1"), before.0);
    assert_eq!(engine.scheduler().state(), &before.1);
    assert_eq!(engine.limiter().state(), before.2);
    assert_eq!(engine.limiter().tokens(), 24 - 3);

    // A non-empty cache keeps the restored cursors.
    assert!(!engine.bootstrap(names(&["a0", "a1", "a2"])).unwrap());
    assert_eq!(engine.cursors().get("a1"), before.0);
}

#[tokio::test]
async fn repeated_failures_take_an_account_out_of_rotation() {
    let mut h = harness(&["a0"]);
    h.api.fail_always("a0");

    for _ in 0..(MAX_FAILURES * 2) {
        let r = h.engine.run_round().await;
        assert!(!r.rate_limited);
        h.clock.advance_secs(60);
    }
    assert_eq!(h.engine.cursors().get("a0").failure_count, MAX_FAILURES);
    assert_eq!(h.api.calls().len(), MAX_FAILURES as usize);
    assert!(!h.engine.limiter().in_cooldown());

    let r = h.engine.run_round().await;
    assert_eq!(r.phase, Some(Phase::Newest));
    assert_eq!(r.outcome, RoundOutcome::Idle);

    h.engine.reset_for_bootstrap("a0").unwrap();
    assert!(h.engine.cursor_status("a0").can_fetch_new);
}

#[tokio::test]
async fn limiter_refusal_leaves_cursors_and_rotation_untouched() {
    let mut h = harness_with(&["a0", "a1", "a2", "a3", "a4"], 200, 2);
    let before = h.engine.scheduler().state().clone();

    let r = h.engine.run_round().await;
    assert_eq!(r.outcome, RoundOutcome::LimiterRefused);
    assert_eq!(r.phase, Some(Phase::Newest));
    assert!(h.api.calls().is_empty());
    assert_eq!(h.engine.limiter().tokens(), 4);
    assert!(h.engine.cursors().get("a0").top_cursor.is_none());
    assert_eq!(h.engine.scheduler().state(), &before);

    // Same batch is offered again on the next tick.
    let r = h.engine.run_round().await;
    assert_eq!(r.phase, Some(Phase::Newest));
    assert_eq!(r.batch, names(&["a0", "a1", "a2", "a3", "a4"]));
    assert_eq!(h.engine.scheduler().state(), &before);
}

#[tokio::test]
async fn immediate_request_survives_cooldown_refusal() {
    let accounts = ["a0", "a1", "a2", "a3", "a4", "a5", "a6"];
    let mut h = harness(&accounts);
    h.api.script("a0", Scripted::RateLimited);

    let r1 = h.engine.run_round().await;
    assert!(r1.rate_limited);
    assert!(h.engine.limiter().in_cooldown());

    h.engine.request_immediate_sync("a6").unwrap();
    h.clock.advance_secs(60);
    let r2 = h.engine.run_round().await;
    assert!(r2.immediate);
    assert_eq!(r2.outcome, RoundOutcome::LimiterRefused);
    assert_eq!(h.engine.scheduler().state().immediate_queue, names(&["a6"]));

    h.clock.advance_secs(4 * 60);
    h.api.clear_calls();
    let r3 = h.engine.run_round().await;
    assert!(r3.immediate);
    assert_eq!(r3.outcome, RoundOutcome::Completed);
    assert_eq!(r3.attempted, names(&["a6"]));
    assert_eq!(h.api.called_accounts(), names(&["a6"]));
    assert!(h.engine.scheduler().state().immediate_queue.is_empty());
}

/// Refuses to store a limiter document that carries a cooldown.
struct CooldownRejectingKv {
    inner: MemoryKv,
    rejected: AtomicBool,
}

impl CooldownRejectingKv {
    fn check(&self, key: &str, value: &[u8]) -> Result<()> {
        if key == "rate_limiter" {
            let doc: serde_json::Value = serde_json::from_slice(value)?;
            if doc["cooldown_until_ms"].as_i64().unwrap_or(0) > 0 {
                self.rejected.store(true, Ordering::SeqCst);
                anyhow::bail!("disk full");
            }
        }
        Ok(())
    }
}

impl KvStore for CooldownRejectingKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check(key, value)?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        for (k, v) in entries {
            self.check(k, v)?;
        }
        self.inner.put_many(entries)
    }
}

#[tokio::test]
async fn rate_limit_failure_is_counted_even_if_cooldown_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Arc::new(CooldownRejectingKv {
        inner: MemoryKv::new(),
        rejected: AtomicBool::new(false),
    });
    let api = Arc::new(FakeApi::default());
    api.script("a0", Scripted::RateLimited);
    let clock = ManualClock::new(T0);
    let mut engine = SyncEngine::open(
        &cfg(12),
        kv.clone(),
        CacheStore::open(dir.path().join("cache.db")).unwrap(),
        api,
        Arc::new(clock.clone()),
    )
    .unwrap();
    engine.bootstrap(names(&["a0", "a1"])).unwrap();

    let r = engine.run_round().await;
    assert_eq!(r.outcome, RoundOutcome::StoreError);
    assert!(kv.rejected.load(Ordering::SeqCst));
    assert_eq!(engine.cursors().get("a0").failure_count, 1);

    let reloaded = CursorStore::load(kv, Arc::new(clock)).unwrap();
    assert_eq!(reloaded.get("a0").failure_count, 1);
}

#[tokio::test]
async fn history_exhaustion_and_pruning_stop_backfill() {
    let mut h = harness_with(&["a0", "a1"], 2, 12);
    h.api.script(
        "a1",
        Scripted::Page(TimelinePage {
            items: (0..3).map(|i| item("a1", format!("a1-{i}"), i)).collect(),
            top_cursor: Some("t".into()),
            bottom_cursor: Some("b".into()),
            has_more: true,
        }),
    );

    let r1 = h.engine.run_round().await;
    assert_eq!(r1.pruned, 1);
    assert!(h.engine.cursors().get("a1").cache_enough);
    assert!(!h.engine.cursors().get("a0").cache_enough);
    assert_eq!(h.engine.cache().count_for_account("a1").unwrap(), 2);

    let bottom = h.engine.cursors().get("a0").bottom_cursor;
    h.api.script(
        "a0",
        Scripted::Page(TimelinePage {
            items: Vec::new(),
            top_cursor: None,
            bottom_cursor: None,
            has_more: false,
        }),
    );
    h.api.clear_calls();
    let r2 = h.engine.run_round().await;
    assert_eq!(r2.phase, Some(Phase::History));
    assert_eq!(h.api.called_accounts(), names(&["a0"]));
    let c = h.engine.cursors().get("a0");
    assert!(c.cache_enough);
    assert_eq!(c.bottom_cursor, bottom);
    assert!(!h.engine.cursor_status("a0").need_fetch_old);
}

#[tokio::test]
async fn empty_newest_page_parks_the_account() {
    let mut h = harness(&["a0"]);
    h.engine.run_round().await;
    let top = h.engine.cursors().get("a0").top_cursor;

    h.clock.advance_secs(60);
    h.engine.run_round().await;
    h.clock.advance_secs(60);
    h.api.script(
        "a0",
        Scripted::Page(TimelinePage {
            items: Vec::new(),
            top_cursor: Some("ignored".into()),
            bottom_cursor: None,
            has_more: false,
        }),
    );
    let r = h.engine.run_round().await;
    assert_eq!(r.phase, Some(Phase::Newest));
    assert_eq!(r.items_stored, 0);
    assert_eq!(h.engine.cursors().get("a0").top_cursor, top);
    assert!(h.engine.cursor_status("a0").next_newest_in_secs > 60);
}

#[tokio::test]
async fn sync_now_goes_through_the_handle() {
    let mut h = harness(&["a0", "a1"]);
    h.api.fail_always("a1");
    let handle = h.engine.handle();

    let (res, _) = tokio::join!(handle.sync_now("a0"), async {
        tokio::task::yield_now().await;
        h.engine.process_requests().await;
    });
    assert_eq!(res.unwrap(), FetchOutcome::Stored { items: 1, pruned: 0 });

    assert_eq!(h.engine.sync_account_now("a0").await.unwrap(), FetchOutcome::NotDue);
    assert!(h.engine.sync_account_now("a1").await.is_err());
    assert_eq!(h.engine.cursors().get("a1").failure_count, 1);
    assert_eq!(h.engine.limiter().tokens(), 24 - 2);
}

#[tokio::test]
async fn tracking_and_untracking_accounts() {
    let mut h = harness(&["a0"]);
    h.engine.run_round().await;

    assert!(h.engine.track_account("new").unwrap());
    assert!(!h.engine.track_account("new").unwrap());
    let r = h.engine.run_round().await;
    assert!(r.immediate);
    assert_eq!(r.attempted, names(&["new"]));
    assert_eq!(h.engine.cache().count_for_account("new").unwrap(), 1);

    assert!(h.engine.untrack_account("new").unwrap());
    assert!(!h.engine.untrack_account("new").unwrap());
    assert_eq!(h.engine.accounts(), names(&["a0"]).as_slice());
    assert_eq!(h.engine.cache().count_for_account("new").unwrap(), 0);
    assert!(h.engine.cursors().get("new").top_cursor.is_none());
}
