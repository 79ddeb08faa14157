/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use feedmirror_protocol::TimelineItem;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

pub const MAX_ITEMS_PER_ACCOUNT: u32 = 200;
const MAX_QUERY_LIMIT: u32 = 500;

/// Bounded per-account item cache backed by SQLite.
#[derive(Clone)]
pub struct CacheStore {
    path: PathBuf,
    max_items_per_account: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    pub item_id: String,
    pub account_id: String,
    pub created_at_ms: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Keyset position in the global feed. Items sharing a timestamp are
/// ordered by `item_id`, so no item is skipped at a page boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCursor {
    pub created_at_ms: i64,
    pub item_id: String,
}

#[derive(Debug, Clone)]
pub struct FeedPage {
    pub items: Vec<CachedItem>,
    /// Position to pass as `before` for the next page, when the page was full.
    pub next_before: Option<FeedCursor>,
}

impl CacheStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_cap(db_path, MAX_ITEMS_PER_ACCOUNT)
    }

    pub fn open_with_cap(db_path: impl AsRef<Path>, max_items_per_account: u32) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS cached_items (
              item_id TEXT PRIMARY KEY,
              account_id TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              payload BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cached_account_created ON cached_items(account_id, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_cached_created ON cached_items(created_at_ms DESC);
            "#,
        )?;
        Ok(Self {
            path,
            max_items_per_account: max_items_per_account.max(1),
        })
    }

    pub fn max_items_per_account(&self) -> u32 {
        self.max_items_per_account
    }

    /// Merges `items` into the account's cache and trims it back to the cap.
    /// Returns how many old items were pruned.
    pub fn upsert(&self, account_id: &str, items: &[TimelineItem]) -> Result<u64> {
        let mut conn = Connection::open(&self.path)?;
        let tx = conn.transaction()?;
        for item in items {
            let payload = serde_json::to_vec(&item.payload).context("encode item payload")?;
            tx.execute(
                r#"
                INSERT INTO cached_items(item_id, account_id, created_at_ms, payload)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(item_id) DO UPDATE SET
                  account_id=excluded.account_id,
                  created_at_ms=excluded.created_at_ms,
                  payload=excluded.payload
                "#,
                params![item.item_id, account_id, item.created_at_ms, payload],
            )?;
        }
        let pruned = prune_account_tx(&tx, account_id, self.max_items_per_account)?;
        tx.commit()?;
        Ok(pruned)
    }

    pub fn query_range(&self, account_id: &str, limit: u32, direction: Direction) -> Result<Vec<CachedItem>> {
        let conn = Connection::open(&self.path)?;
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        let sql = match direction {
            Direction::NewestFirst => {
                "SELECT item_id, account_id, created_at_ms, payload FROM cached_items WHERE account_id=?1 ORDER BY created_at_ms DESC, item_id DESC LIMIT ?2"
            }
            Direction::OldestFirst => {
                "SELECT item_id, account_id, created_at_ms, payload FROM cached_items WHERE account_id=?1 ORDER BY created_at_ms ASC, item_id ASC LIMIT ?2"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![account_id, limit as i64], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Newest-first feed across accounts, paged by `(created_at_ms, item_id)` keyset.
    pub fn query_global_feed(
        &self,
        limit: u32,
        account_filter: Option<&[String]>,
        before: Option<&FeedCursor>,
    ) -> Result<FeedPage> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        if matches!(account_filter, Some(ids) if ids.is_empty()) {
            return Ok(FeedPage {
                items: Vec::new(),
                next_before: None,
            });
        }

        let mut clauses: Vec<String> = Vec::new();
        let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(ids) = account_filter {
            let start = params_vec.len() + 1;
            let placeholders = (0..ids.len())
                .map(|i| format!("?{}", start + i))
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("account_id IN ({placeholders})"));
            params_vec.extend(ids.iter().map(|id| rusqlite::types::Value::from(id.clone())));
        }
        if let Some(c) = before {
            let ts = params_vec.len() + 1;
            clauses.push(format!(
                "(created_at_ms < ?{ts} OR (created_at_ms = ?{ts} AND item_id < ?{}))",
                ts + 1
            ));
            params_vec.push(c.created_at_ms.into());
            params_vec.push(c.item_id.clone().into());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT item_id, account_id, created_at_ms, payload FROM cached_items {where_sql} ORDER BY created_at_ms DESC, item_id DESC LIMIT ?{}",
            params_vec.len() + 1
        );
        params_vec.push((limit as i64).into());

        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), row_to_item)?;
        let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        let next_before = if items.len() as u32 == limit {
            items.last().map(|i| FeedCursor {
                created_at_ms: i.created_at_ms,
                item_id: i.item_id.clone(),
            })
        } else {
            None
        };
        Ok(FeedPage { items, next_before })
    }

    pub fn delete_all_for_account(&self, account_id: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let deleted = conn.execute("DELETE FROM cached_items WHERE account_id=?1", params![account_id])?;
        Ok(deleted as u64)
    }

    pub fn count_for_account(&self, account_id: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM cached_items WHERE account_id=?1",
            params![account_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn total_count(&self) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let n: u64 = conn.query_row("SELECT COUNT(*) FROM cached_items", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.total_count()? == 0)
    }
}

fn prune_account_tx(tx: &rusqlite::Transaction<'_>, account_id: &str, max_items: u32) -> Result<u64> {
    // SQLite compatibility: some builds don't support `DELETE ... LIMIT`.
    let deleted = tx.execute(
        r#"
        DELETE FROM cached_items
        WHERE item_id IN (
          SELECT item_id FROM cached_items
          WHERE account_id = ?1
          ORDER BY created_at_ms DESC, item_id DESC
          LIMIT -1 OFFSET ?2
        )
        "#,
        params![account_id, max_items as i64],
    )?;
    Ok(deleted as u64)
}

fn row_to_item(r: &rusqlite::Row<'_>) -> rusqlite::Result<CachedItem> {
    Ok(CachedItem {
        item_id: r.get(0)?,
        account_id: r.get(1)?,
        created_at_ms: r.get(2)?,
        payload: r.get(3)?,
    })
}
