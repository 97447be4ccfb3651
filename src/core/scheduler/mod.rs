//! Recurring and one-shot task creation.
//!
//! Scheduled tasks live as documents; the ids of enabled ones sit in a sorted
//! set scored by `next_run_at` (epoch millis), which is the due queue.

pub mod cron;
pub mod runner;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::errors::EngineError;
use crate::core::store::{self, Store, keys};

pub use cron::{CronError, CronExpr};
pub use runner::SchedulerRunner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum Schedule {
    Once { run_at: DateTime<Utc> },
    Cron { expression: String },
    Interval { interval_ms: u64 },
}

impl Schedule {
    pub fn type_name(&self) -> &'static str {
        match self {
            Schedule::Once { .. } => "once",
            Schedule::Cron { .. } => "cron",
            Schedule::Interval { .. } => "interval",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Cron { expression } => {
                CronExpr::parse(expression)?;
                Ok(())
            }
            Schedule::Interval { interval_ms } => {
                if *interval_ms == 0 {
                    bail!("interval_ms must be positive");
                }
                Ok(())
            }
        }
    }

    /// Next fire time relative to `reference` (creation time, then the last run).
    pub fn next_run(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Schedule::Once { run_at } => Ok(*run_at),
            Schedule::Cron { expression } => Ok(CronExpr::parse(expression)?.next_after(reference)?),
            Schedule::Interval { interval_ms } => {
                let ms = i64::try_from(*interval_ms)?;
                Ok(reference + Duration::milliseconds(ms))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(flatten)]
    pub schedule: Schedule,
    pub query_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<LastRunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    fn exhausted(&self) -> bool {
        matches!(self.schedule, Schedule::Once { .. })
            || self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    /// Expand `{{name}}`, `{{date}}`, `{{datetime}}` and `{{run_count}}`.
    pub fn render_query(&self, now: DateTime<Utc>) -> String {
        self.query_template
            .replace("{{name}}", &self.name)
            .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
            .replace(
                "{{datetime}}",
                &now.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .replace("{{run_count}}", &(self.run_count + 1).to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub user_id: String,
    pub name: String,
    pub schedule: Schedule,
    pub query_template: String,
    pub project_id: Option<String>,
    pub max_runs: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub created_task_id: Option<String>,
    pub error: Option<String>,
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    due_batch: usize,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, due_batch: usize) -> Self {
        Self {
            store,
            clock,
            due_batch: due_batch.max(1),
        }
    }

    async fn save(&self, task: &ScheduledTask) -> Result<()> {
        store::save(self.store.as_ref(), &keys::scheduled(&task.id), task).await
    }

    async fn enqueue(&self, task: &ScheduledTask) -> Result<()> {
        match task.next_run_at {
            Some(at) if task.enabled => self.store.zadd(keys::SCHEDULER_DUE, &task.id, score(at)).await,
            _ => {
                self.store.zrem(keys::SCHEDULER_DUE, &task.id).await?;
                Ok(())
            }
        }
    }

    async fn require(&self, id: &str) -> Result<ScheduledTask> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("scheduled task", id).into())
    }

    pub async fn create_scheduled_task(&self, new: NewScheduledTask) -> Result<ScheduledTask> {
        new.schedule.validate()?;
        if new.max_runs == Some(0) {
            bail!("max_runs must be at least 1");
        }
        let now = self.clock.now();
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            name: new.name,
            next_run_at: Some(new.schedule.next_run(now)?),
            schedule: new.schedule,
            query_template: new.query_template,
            project_id: new.project_id,
            run_count: 0,
            last_run_at: None,
            last_run_status: None,
            last_task_id: None,
            last_error: None,
            enabled: true,
            max_runs: new.max_runs,
            created_at: now,
            updated_at: now,
        };
        self.save(&task).await?;
        self.enqueue(&task).await?;
        info!(
            scheduled_id = %task.id,
            "Scheduled {} task '{}' first run at {:?}",
            task.schedule.type_name(),
            task.name,
            task.next_run_at
        );
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        store::load(self.store.as_ref(), &keys::scheduled(id)).await
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        let mut out = Vec::new();
        for key in self.store.keys(&keys::scheduled("*")).await? {
            if let Some(task) = store::load::<ScheduledTask>(self.store.as_ref(), &key).await?
                && task.user_id == user_id
            {
                out.push(task);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Enabled tasks ordered by next fire time, soonest first.
    pub async fn list_upcoming(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        let ids = self
            .store
            .zrange_by_score(keys::SCHEDULER_DUE, f64::MIN, f64::MAX, 0, limit)
            .await?;
        let mut out = Vec::new();
        for (id, _) in ids {
            if let Some(task) = self.get(&id).await? {
                out.push(task);
            }
        }
        Ok(out)
    }

    pub async fn get_due_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        let mut orphans = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .zrange_by_score(keys::SCHEDULER_DUE, f64::MIN, score(now), offset, self.due_batch)
                .await?;
            let page_len = page.len();
            for (id, _) in page {
                match self.get(&id).await? {
                    Some(task)
                        if task.enabled && task.next_run_at.is_some_and(|at| at <= now) =>
                    {
                        out.push(task)
                    }
                    Some(_) => {}
                    None => orphans.push(id),
                }
            }
            if page_len < self.due_batch {
                break;
            }
            offset += page_len;
        }
        // Removing while paging by offset would shift later entries past the cursor.
        for id in orphans {
            self.store.zrem(keys::SCHEDULER_DUE, &id).await?;
        }
        Ok(out)
    }

    pub async fn record_execution(&self, id: &str, outcome: ExecutionOutcome) -> Result<ScheduledTask> {
        let mut task = self.require(id).await?;
        let now = self.clock.now();
        task.run_count += 1;
        task.last_run_at = Some(now);
        task.last_run_status = Some(if outcome.success {
            LastRunStatus::Success
        } else {
            LastRunStatus::Failed
        });
        if outcome.created_task_id.is_some() {
            task.last_task_id = outcome.created_task_id;
        }
        task.last_error = outcome.error;
        task.updated_at = now;

        if task.exhausted() {
            task.enabled = false;
            task.next_run_at = None;
            info!(scheduled_id = %task.id, "Scheduled task '{}' finished after {} runs", task.name, task.run_count);
        } else {
            task.next_run_at = Some(task.schedule.next_run(now)?);
        }
        self.save(&task).await?;
        self.enqueue(&task).await?;
        Ok(task)
    }

    /// Disabling dequeues without deleting. Re-enabling recomputes the next
    /// run from now.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask> {
        let mut task = self.require(id).await?;
        let now = self.clock.now();
        if enabled {
            if task.exhausted() && task.run_count > 0 {
                return Err(anyhow!(
                    "scheduled task '{}' has no runs left ({} so far)",
                    task.name,
                    task.run_count
                ));
            }
            task.next_run_at = Some(task.schedule.next_run(now)?);
        } else {
            task.next_run_at = None;
        }
        task.enabled = enabled;
        task.updated_at = now;
        self.save(&task).await?;
        self.enqueue(&task).await?;
        Ok(task)
    }

    pub async fn delete_scheduled_task(&self, id: &str) -> Result<bool> {
        self.store.zrem(keys::SCHEDULER_DUE, id).await?;
        self.store.delete(&keys::scheduled(id)).await
    }
}
