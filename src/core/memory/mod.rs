//! Long-term memory sink for finished runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::core::orchestrator::types::{Run, StepStatus, Task};
use crate::core::store::{self, Store, keys};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub user_id: String,
    pub query: String,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_skipped: usize,
    pub tokens_used: u64,
    /// Outputs of every completed step, keyed by step id.
    pub outputs: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_run(run: &Run, task: &Task, now: DateTime<Utc>) -> Self {
        let mut outputs = Map::new();
        let mut tokens_used = 0;
        for step in &task.todo_list {
            if let Some(result) = &step.result {
                tokens_used += result.tokens_used;
                if step.status == StepStatus::Completed {
                    outputs.insert(step.id.clone(), Value::Object(result.outputs.clone()));
                }
            }
        }
        let count = |status: StepStatus| task.todo_list.iter().filter(|s| s.status == status).count();
        Self {
            run_id: run.id.clone(),
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            query: task.query.clone(),
            steps_total: task.todo_list.len(),
            steps_completed: count(StepStatus::Completed),
            steps_skipped: count(StepStatus::Skipped),
            tokens_used,
            outputs,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn remember_run(&self, summary: &RunSummary) -> Result<()>;
}

/// Keeps summaries as plain documents next to the runs they describe.
pub struct DocumentMemory {
    store: Arc<dyn Store>,
}

impl DocumentMemory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LongTermMemory for DocumentMemory {
    async fn remember_run(&self, summary: &RunSummary) -> Result<()> {
        store::save(self.store.as_ref(), &keys::run_summary(&summary.run_id), summary).await?;
        debug!(run_id = %summary.run_id, "Stored run summary");
        Ok(())
    }
}
