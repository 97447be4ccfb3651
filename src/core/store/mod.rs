//! Persistent store capability consumed by every engine component.
//!
//! The engine only needs four things from storage:
//! - JSON documents addressable by key and dotted sub-path
//! - sorted sets (the scheduler's due queue, per-user run indexes)
//! - append-only per-key logs with consumer-group readout (the activity log)
//! - an atomic bounded counter increment (budget admission)
//!
//! [`SqliteStore`] is the bundled implementation.

mod sqlite;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamEntry {
    pub id: i64,
    pub stream: String,
    pub payload: Value,
    pub created_at: String,
}

/// Outcome of [`Store::increment_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub applied: bool,
    /// Counter value after the call (unchanged when not applied).
    pub value: u64,
    pub limit: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Read a document, or the sub-value at a dotted `path` inside it.
    async fn get(&self, key: &str, path: Option<&str>) -> Result<Option<Value>>;

    /// Write a whole document, or the sub-value at a dotted `path` (creating
    /// the document and intermediate objects as needed).
    async fn set(&self, key: &str, path: Option<&str>, value: Value) -> Result<()>;

    /// Create a document only if the key is unused. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool>;

    /// Replace the value at `path` only when it currently equals `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        path: &str,
        expected: &Value,
        value: Value,
    ) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate document keys matching a glob (`*` and `?` wildcards).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add `amount` to the counter at `counter_path` only if the result stays
    /// within the number stored at `limit_path`. Check and write happen in one
    /// transaction.
    async fn increment_bounded(
        &self,
        key: &str,
        counter_path: &str,
        limit_path: &str,
        amount: u64,
    ) -> Result<CounterUpdate>;

    /// Unbounded atomic add (negative amounts allowed). Missing counters start at 0.
    async fn increment(&self, key: &str, path: &str, amount: i64) -> Result<i64>;

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()>;

    async fn zrem(&self, set: &str, member: &str) -> Result<bool>;

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<f64>>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn append(&self, stream: &str, payload: Value) -> Result<StreamEntry>;

    /// Entries with id greater than `after_id`, oldest first.
    async fn range(&self, stream: &str, after_id: i64, limit: usize) -> Result<Vec<StreamEntry>>;

    /// The newest `limit` entries, oldest first.
    async fn tail(&self, stream: &str, limit: usize) -> Result<Vec<StreamEntry>>;

    /// Deliver entries to `consumer` within `group`. Unacknowledged entries
    /// already delivered to this consumer are returned again before new ones.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<usize>;
}

pub async fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    match store.get(key, None).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    store.set(key, None, serde_json::to_value(value)?).await
}

/// Key layout shared by all components.
pub mod keys {
    pub fn task(task_id: &str) -> String {
        format!("task:{}", task_id)
    }

    pub fn run(run_id: &str) -> String {
        format!("run:{}", run_id)
    }

    pub fn run_for_task(task_id: &str) -> String {
        format!("run:by_task:{}", task_id)
    }

    pub fn runs_by_user(user_id: &str) -> String {
        format!("runs:user:{}", user_id)
    }

    pub fn approval(approval_id: &str) -> String {
        format!("approval:{}", approval_id)
    }

    pub const PENDING_APPROVALS: &str = "approvals:pending";

    pub fn approval_for_step(run_id: &str, step_id: &str) -> String {
        format!("approvals:by_step:{}:{}", run_id, step_id)
    }

    pub fn retry(task_id: &str, step_id: &str) -> String {
        format!("retry:{}:{}", task_id, step_id)
    }

    pub fn scheduled(task_id: &str) -> String {
        format!("scheduled:{}", task_id)
    }

    pub const SCHEDULER_DUE: &str = "scheduler:due";

    pub const ACTIVITY_STREAM: &str = "stream:activity";

    pub fn run_activity_stream(run_id: &str) -> String {
        format!("stream:activity:run:{}", run_id)
    }

    pub fn daily_activity(date: &str) -> String {
        format!("activity:daily:{}", date)
    }

    pub fn budget(scope: &str, scope_id: &str) -> String {
        format!("budget:{}:{}", scope, scope_id)
    }

    pub fn run_summary(run_id: &str) -> String {
        format!("memory:run_summary:{}", run_id)
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> Vec<Segment<'_>> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(i) => Segment::Index(i),
            Err(_) => Segment::Key(s),
        })
        .collect()
}

/// Resolve a dotted path (`steps.0.status`) inside a JSON value.
pub(crate) fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments(path) {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(items)) => items.get(i)?,
            (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects. Array
/// segments may address an existing element or append at `len`.
pub(crate) fn set_at_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segs = segments(path);
    if segs.is_empty() {
        *root = value;
        return Ok(());
    }
    let mut current = root;
    let last = segs.len() - 1;
    for (pos, seg) in segs.into_iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => {
                if pos == last {
                    map.insert(k.to_string(), value);
                    return Ok(());
                }
                map.entry(k.to_string()).or_insert(Value::Null)
            }
            (Segment::Index(i), Value::Object(map)) => {
                if pos == last {
                    map.insert(i.to_string(), value);
                    return Ok(());
                }
                map.entry(i.to_string()).or_insert(Value::Null)
            }
            (Segment::Index(i), Value::Array(items)) => {
                if i > items.len() {
                    return Err(anyhow!("index {} out of bounds in path '{}'", i, path));
                }
                if i == items.len() {
                    items.push(Value::Null);
                }
                if pos == last {
                    items[i] = value;
                    return Ok(());
                }
                &mut items[i]
            }
            (Segment::Key(k), other) => {
                return Err(anyhow!(
                    "cannot descend into non-object at '{}' (found {})",
                    k,
                    kind_name(other)
                ));
            }
            (Segment::Index(i), other) => {
                return Err(anyhow!(
                    "cannot index [{}] into {}",
                    i,
                    kind_name(other)
                ));
            }
        };
    }
    Ok(())
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Translate a `*`/`?` glob into a SQL LIKE pattern escaped with `\`.
pub(crate) fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests;
