//! Turns due scheduled tasks into runs.

use anyhow::Result;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ExecutionOutcome;
use crate::core::orchestrator::{Orchestrator, Run};

pub struct SchedulerRunner {
    orchestrator: Arc<Orchestrator>,
}

impl SchedulerRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Create a run for every due scheduled task and record each outcome.
    /// The runs are returned unstarted.
    pub async fn tick(&self) -> Result<Vec<Run>> {
        let engine = self.orchestrator.engine();
        let due = engine.scheduler.get_due_tasks().await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        info!("{} scheduled task(s) due", due.len());

        let now = engine.clock.now();
        let mut runs = Vec::with_capacity(due.len());
        for scheduled in due {
            let query = scheduled.render_query(now);
            let outcome = match self
                .orchestrator
                .create_run(&scheduled.user_id, &query, scheduled.project_id.as_deref())
                .await
            {
                Ok((run, task)) => {
                    info!(scheduled_id = %scheduled.id, run_id = %run.id, "Scheduled run created for '{}'", scheduled.name);
                    runs.push(run);
                    ExecutionOutcome {
                        success: true,
                        created_task_id: Some(task.id),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(scheduled_id = %scheduled.id, "Scheduled task '{}' failed: {}", scheduled.name, e);
                    ExecutionOutcome {
                        success: false,
                        created_task_id: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            if let Err(e) = engine.scheduler.record_execution(&scheduled.id, outcome).await {
                error!(scheduled_id = %scheduled.id, "Could not record execution: {}", e);
            }
        }
        Ok(runs)
    }

    /// Tick, then drive each new run on its own tokio task.
    pub async fn tick_and_execute(&self) -> Result<usize> {
        let runs = self.tick().await?;
        let started = runs.len();
        for run in runs {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                match orchestrator.execute_run(&run.id).await {
                    Ok(done) => info!(run_id = %done.id, "Scheduled run left in {}", done.status.as_str()),
                    Err(e) => error!(run_id = %run.id, "Scheduled run failed: {}", e),
                }
            });
        }
        Ok(started)
    }

    /// Register the tick on `scheduler` under a six-field cron expression.
    pub async fn register(self: Arc<Self>, scheduler: &JobScheduler, expression: &str) -> Result<Uuid> {
        let job = Job::new_async(expression, move |_uuid, mut _l| {
            let runner = self.clone();
            Box::pin(async move {
                if let Err(e) = runner.tick_and_execute().await {
                    error!("Scheduler tick failed: {}", e);
                }
            })
        })?;
        let id = scheduler.add(job).await?;
        info!("Scheduler tick registered ({})", expression);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::errors::TerminationReason;
    use crate::core::scheduler::{LastRunStatus, NewScheduledTask, Schedule};
    use crate::core::testing::{Reply, ScriptedWorker, step, test_engine};
    use crate::core::workers::WorkerKind;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn tick_creates_runs_for_due_tasks_only() {
        let worker = Arc::new(ScriptedWorker::new(
            WorkerKind::Research,
            Reply::ok(json!({ "findings": ["nothing new"] })),
        ));
        let te = test_engine(
            EngineConfig::default(),
            vec![step("look", WorkerKind::Research, "Collect the headlines")],
            &[worker.clone()],
        );
        let orch = Arc::new(te.orchestrator());
        let runner = SchedulerRunner::new(orch.clone());
        let scheduled = te
            .engine
            .scheduler
            .create_scheduled_task(NewScheduledTask {
                user_id: "user-1".into(),
                name: "digest".into(),
                schedule: Schedule::Interval { interval_ms: 60_000 },
                query_template: "{{name}} for {{date}}".into(),
                project_id: Some("news".into()),
                max_runs: Some(2),
            })
            .await
            .unwrap();

        assert!(runner.tick().await.unwrap().is_empty());

        te.clock.advance(Duration::seconds(61));
        let runs = runner.tick().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].project_id, "news");
        assert_eq!(runs[0].user_id, "user-1");
        let task = orch.get_task(&runs[0].task_id).await.unwrap().unwrap();
        assert_eq!(task.query, "digest for 2024-01-01");

        let recorded = te.engine.scheduler.get(&scheduled.id).await.unwrap().unwrap();
        assert_eq!(recorded.run_count, 1);
        assert_eq!(recorded.last_run_status, Some(LastRunStatus::Success));
        assert_eq!(recorded.last_task_id.as_deref(), Some(task.id.as_str()));
        assert!(runner.tick().await.unwrap().is_empty());

        let done = orch.execute_run(&runs[0].id).await.unwrap();
        assert_eq!(done.termination_reason, Some(TerminationReason::Completed));

        te.clock.advance(Duration::seconds(61));
        assert_eq!(runner.tick().await.unwrap().len(), 1);
        let finished = te.engine.scheduler.get(&scheduled.id).await.unwrap().unwrap();
        assert!(!finished.enabled);
        assert!(finished.next_run_at.is_none());

        te.clock.advance(Duration::minutes(10));
        assert!(runner.tick().await.unwrap().is_empty());
        assert_eq!(orch.list_runs("user-1").await.unwrap().len(), 2);
    }
}
