use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{CounterUpdate, Store, StreamEntry, glob_to_like, set_at_path, value_at_path};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(db_path)?;
        init_schema(&db)?;
        info!("Opened store at {:?}", db_path);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE IF NOT EXISTS sorted_sets (
            set_key TEXT NOT NULL,
            member TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (set_key, member)
         );
         CREATE INDEX IF NOT EXISTS idx_sorted_sets_score ON sorted_sets(set_key, score);
         CREATE TABLE IF NOT EXISTS stream_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream_key TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_stream_entries_key_id ON stream_entries(stream_key, id);
         CREATE TABLE IF NOT EXISTS stream_groups (
            stream_key TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_delivered_id INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (stream_key, group_name)
         );
         CREATE TABLE IF NOT EXISTS stream_pending (
            stream_key TEXT NOT NULL,
            group_name TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream_key, group_name, entry_id)
         );",
    )?;
    Ok(())
}

fn read_doc(db: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = db
        .query_row(
            "SELECT value_json FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn write_doc(db: &Connection, key: &str, value: &Value) -> Result<()> {
    db.execute(
        "INSERT INTO documents (key, value_json, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = CURRENT_TIMESTAMP",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

/// SQLite LIMIT/OFFSET take i64; usize::MAX means "no limit".
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn as_counter(value: Option<&Value>) -> u64 {
    value.and_then(|v| v.as_u64()).unwrap_or(0)
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn to_entry(raw: (i64, String, String, String)) -> Result<StreamEntry> {
    let (id, stream, payload_json, created_at) = raw;
    Ok(StreamEntry {
        id,
        stream,
        payload: serde_json::from_str(&payload_json)?,
        created_at,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str, path: Option<&str>) -> Result<Option<Value>> {
        let db = self.db.lock().await;
        let Some(doc) = read_doc(&db, key)? else {
            return Ok(None);
        };
        match path {
            None => Ok(Some(doc)),
            Some(p) => Ok(value_at_path(&doc, p).cloned()),
        }
    }

    async fn set(&self, key: &str, path: Option<&str>, value: Value) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        match path {
            None => write_doc(&tx, key, &value)?,
            Some(p) => {
                let mut doc = read_doc(&tx, key)?.unwrap_or_else(|| Value::Object(Default::default()));
                set_at_path(&mut doc, p, value)?;
                write_doc(&tx, key, &doc)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO documents (key, value_json) VALUES (?1, ?2)",
            params![key, serde_json::to_string(&value)?],
        )?;
        Ok(rows > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        path: &str,
        expected: &Value,
        value: Value,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let Some(mut doc) = read_doc(&tx, key)? else {
            return Ok(false);
        };
        if value_at_path(&doc, path) != Some(expected) {
            return Ok(false);
        }
        set_at_path(&mut doc, path, value)?;
        write_doc(&tx, key, &doc)?;
        tx.commit()?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM documents WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT key FROM documents WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC")?;
        let rows = stmt.query_map(params![glob_to_like(pattern)], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn increment_bounded(
        &self,
        key: &str,
        counter_path: &str,
        limit_path: &str,
        amount: u64,
    ) -> Result<CounterUpdate> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut doc = read_doc(&tx, key)?
            .ok_or_else(|| anyhow!("document '{}' does not exist", key))?;
        let current = as_counter(value_at_path(&doc, counter_path));
        let limit = value_at_path(&doc, limit_path)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("no numeric limit at '{}' in '{}'", limit_path, key))?;

        let next = current.saturating_add(amount);
        if next > limit {
            return Ok(CounterUpdate {
                applied: false,
                value: current,
                limit,
            });
        }
        set_at_path(&mut doc, counter_path, Value::from(next))?;
        write_doc(&tx, key, &doc)?;
        tx.commit()?;
        Ok(CounterUpdate {
            applied: true,
            value: next,
            limit,
        })
    }

    async fn increment(&self, key: &str, path: &str, amount: i64) -> Result<i64> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut doc = read_doc(&tx, key)?.unwrap_or_else(|| Value::Object(Default::default()));
        let current = value_at_path(&doc, path).and_then(|v| v.as_i64()).unwrap_or(0);
        let next = current.saturating_add(amount);
        set_at_path(&mut doc, path, Value::from(next))?;
        write_doc(&tx, key, &doc)?;
        tx.commit()?;
        Ok(next)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO sorted_sets (set_key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(set_key, member) DO UPDATE SET score = excluded.score",
            params![set, member, score],
        )?;
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM sorted_sets WHERE set_key = ?1 AND member = ?2",
            params![set, member],
        )?;
        Ok(rows > 0)
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<f64>> {
        let db = self.db.lock().await;
        let score = db
            .query_row(
                "SELECT score FROM sorted_sets WHERE set_key = ?1 AND member = ?2",
                params![set, member],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(score)
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT member, score FROM sorted_sets
             WHERE set_key = ?1 AND score >= ?2 AND score <= ?3
             ORDER BY score ASC, member ASC LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt.query_map(
            params![set, min, max, sql_count(limit), sql_count(offset)],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn append(&self, stream: &str, payload: Value) -> Result<StreamEntry> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO stream_entries (stream_key, payload_json) VALUES (?1, ?2)",
            params![stream, serde_json::to_string(&payload)?],
        )?;
        let id = db.last_insert_rowid();
        let raw = db.query_row(
            "SELECT id, stream_key, payload_json, created_at FROM stream_entries WHERE id = ?1",
            params![id],
            map_entry,
        )?;
        to_entry(raw)
    }

    async fn range(&self, stream: &str, after_id: i64, limit: usize) -> Result<Vec<StreamEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, stream_key, payload_json, created_at FROM stream_entries
             WHERE stream_key = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![stream, after_id, sql_count(limit)], map_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(to_entry(row?)?);
        }
        Ok(out)
    }

    async fn tail(&self, stream: &str, limit: usize) -> Result<Vec<StreamEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, stream_key, payload_json, created_at FROM stream_entries
             WHERE stream_key = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![stream, sql_count(limit)], map_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(to_entry(row?)?);
        }
        out.reverse();
        Ok(out)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO stream_groups (stream_key, group_name, last_delivered_id) VALUES (?1, ?2, 0)",
            params![stream, group],
        )?;

        let mut out = Vec::new();
        {
            let mut pending = tx.prepare(
                "SELECT e.id, e.stream_key, e.payload_json, e.created_at
                 FROM stream_pending p JOIN stream_entries e ON e.id = p.entry_id
                 WHERE p.stream_key = ?1 AND p.group_name = ?2 AND p.consumer = ?3
                 ORDER BY e.id ASC LIMIT ?4",
            )?;
            let rows = pending.query_map(params![stream, group, consumer, sql_count(count)], map_entry)?;
            for row in rows {
                out.push(to_entry(row?)?);
            }
        }
        if !out.is_empty() {
            let ids: Vec<i64> = out.iter().map(|e| e.id).collect();
            for id in ids {
                tx.execute(
                    "UPDATE stream_pending SET delivery_count = delivery_count + 1
                     WHERE stream_key = ?1 AND group_name = ?2 AND entry_id = ?3",
                    params![stream, group, id],
                )?;
            }
        }

        let remaining = count.saturating_sub(out.len());
        if remaining > 0 {
            let last_delivered: i64 = tx.query_row(
                "SELECT last_delivered_id FROM stream_groups WHERE stream_key = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )?;
            let mut fresh = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT id, stream_key, payload_json, created_at FROM stream_entries
                     WHERE stream_key = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
                )?;
                let rows =
                    stmt.query_map(params![stream, last_delivered, sql_count(remaining)], map_entry)?;
                for row in rows {
                    fresh.push(to_entry(row?)?);
                }
            }
            for entry in &fresh {
                tx.execute(
                    "INSERT OR IGNORE INTO stream_pending (stream_key, group_name, entry_id, consumer) VALUES (?1, ?2, ?3, ?4)",
                    params![stream, group, entry.id, consumer],
                )?;
            }
            if let Some(last) = fresh.last() {
                tx.execute(
                    "UPDATE stream_groups SET last_delivered_id = ?1 WHERE stream_key = ?2 AND group_name = ?3",
                    params![last.id, stream, group],
                )?;
            }
            out.extend(fresh);
        }
        tx.commit()?;
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<usize> {
        let db = self.db.lock().await;
        let mut acked = 0;
        for id in ids {
            acked += db.execute(
                "DELETE FROM stream_pending WHERE stream_key = ?1 AND group_name = ?2 AND entry_id = ?3",
                params![stream, group, id],
            )?;
        }
        Ok(acked)
    }
}
