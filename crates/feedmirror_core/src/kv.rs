/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::clock::now_ms;

/// Durable key/value store holding the engine's small state documents.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Writes all entries or none of them.
    fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        for (k, v) in entries {
            self.put(k, v)?;
        }
        Ok(())
    }
}

pub fn load_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = kv.get(key)? else {
        return Ok(None);
    };
    let v = serde_json::from_slice(&raw).with_context(|| format!("decode state: {key}"))?;
    Ok(Some(v))
}

pub fn store_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_vec(value).with_context(|| format!("encode state: {key}"))?;
    kv.put(key, &raw)
}

#[derive(Clone)]
pub struct SqliteKv {
    path: PathBuf,
}

impl SqliteKv {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS kv_state (
              key TEXT PRIMARY KEY,
              value BLOB NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { path })
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = Connection::open(&self.path)?;
        let v = conn
            .query_row("SELECT value FROM kv_state WHERE key=?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT INTO kv_state(key, value, updated_at_ms) VALUES (?1, ?2, ?3)\n             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute("DELETE FROM kv_state WHERE key=?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv_state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![prefix], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = Connection::open(&self.path)?;
        let tx = conn.transaction()?;
        let now = now_ms();
        for (k, v) in entries {
            tx.execute(
                "INSERT INTO kv_state(key, value, updated_at_ms) VALUES (?1, ?2, ?3)\n                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
                params![k, v, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Process-local store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let g = self.map.lock().unwrap();
        Ok(g.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut g = self.map.lock().unwrap();
        for (k, v) in entries {
            g.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}
