use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::LifecycleComponent;
use crate::core::activity::DailyAggregator;
use crate::core::orchestrator::Orchestrator;
use crate::core::scheduler::SchedulerRunner;

/// Fires the scheduler tick on a cron timer.
pub struct ScheduledRuns {
    runner: Arc<SchedulerRunner>,
    expression: String,
}

impl ScheduledRuns {
    pub fn new(orchestrator: Arc<Orchestrator>, expression: impl Into<String>) -> Self {
        Self {
            runner: Arc::new(SchedulerRunner::new(orchestrator)),
            expression: expression.into(),
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ScheduledRuns {
    fn name(&self) -> &'static str {
        "scheduled-runs"
    }

    async fn on_init(&mut self) -> Result<()> {
        // Catch up on anything that fell due while the daemon was down.
        let started = self.runner.tick_and_execute().await?;
        if started > 0 {
            info!("Started {} overdue scheduled run(s)", started);
        }
        Ok(())
    }

    async fn on_start(&mut self, scheduler: &JobScheduler) -> Result<()> {
        self.runner.clone().register(scheduler, &self.expression).await?;
        Ok(())
    }
}

/// Expires overdue approvals and times out their runs.
pub struct ApprovalSweeper {
    orchestrator: Arc<Orchestrator>,
    expression: String,
}

impl ApprovalSweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, expression: impl Into<String>) -> Self {
        Self {
            orchestrator,
            expression: expression.into(),
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ApprovalSweeper {
    fn name(&self) -> &'static str {
        "approval-sweeper"
    }

    async fn on_start(&mut self, scheduler: &JobScheduler) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        let job = Job::new_async(self.expression.as_str(), move |_uuid, mut _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.expire_approvals().await {
                    Ok(expired) if !expired.is_empty() => {
                        warn!("Expired {} approval(s)", expired.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Approval sweep failed: {}", e),
                }
            })
        })?;
        scheduler.add(job).await?;
        Ok(())
    }
}

/// Runs the daily activity aggregator until shutdown.
pub struct ActivityAggregation {
    aggregator: Option<DailyAggregator>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ActivityAggregation {
    pub fn new(orchestrator: &Orchestrator) -> Self {
        let engine = orchestrator.engine();
        let aggregator = DailyAggregator::new(
            engine.store.clone(),
            format!("daemon-{}", std::process::id()),
            engine.config.activity.aggregate_batch,
            Duration::from_millis(engine.config.activity.aggregate_interval_ms),
        );
        Self {
            aggregator: Some(aggregator),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ActivityAggregation {
    fn name(&self) -> &'static str {
        "activity-aggregation"
    }

    async fn on_start(&mut self, _scheduler: &JobScheduler) -> Result<()> {
        if let Some(aggregator) = self.aggregator.take() {
            self.handle = Some(tokio::spawn(aggregator.run(self.cancel.clone())));
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::activity::daily_counts;
    use crate::core::approval::ApprovalStatus;
    use crate::core::config::EngineConfig;
    use crate::core::errors::TerminationReason;
    use crate::core::lifecycle::{LifecycleManager, LifecycleState};
    use crate::core::testing::{Reply, ScriptedWorker, step, test_engine};
    use crate::core::workers::WorkerKind;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn aggregation_drains_until_shutdown() {
        let mut config = EngineConfig::default();
        config.activity.aggregate_interval_ms = 10;
        let worker = Arc::new(ScriptedWorker::new(
            WorkerKind::Research,
            Reply::ok(json!({ "findings": ["x"] })),
        ));
        let te = test_engine(
            config,
            vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
            &[worker],
        );
        let orch = te.orchestrator();
        let (run, _) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();
        orch.execute_run(&run.id).await.unwrap();

        let mut manager = LifecycleManager::new().await.unwrap();
        manager.attach(Arc::new(Mutex::new(ActivityAggregation::new(&orch))));
        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);

        let counts = daily_counts(te.store.as_ref(), "2024-01-01").await.unwrap();
        assert_eq!(counts["counts"]["run_created"], 1);
        assert_eq!(counts["counts"]["run_terminated"], 1);
    }

    #[tokio::test]
    async fn sweeper_times_out_stale_approvals() {
        let exec = Arc::new(ScriptedWorker::new(
            WorkerKind::CodeExecution,
            Reply::ok(json!({ "stdout": "", "exit_code": 0 })),
        ));
        let te = test_engine(
            EngineConfig::default(),
            vec![step("install", WorkerKind::CodeExecution, "Run sudo apt-get install libssl-dev")],
            &[exec],
        );
        let orch = Arc::new(te.orchestrator());
        let (run, _) = orch.create_run("user-1", "Fix the build", None).await.unwrap();
        orch.execute_run(&run.id).await.unwrap();
        let approval = orch.list_pending_approvals("user-1").await.unwrap().remove(0);
        te.clock.advance(chrono::Duration::hours(25));

        let mut manager = LifecycleManager::new().await.unwrap();
        manager.attach(Arc::new(Mutex::new(ApprovalSweeper::new(orch.clone(), "* * * * * *"))));
        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        manager.shutdown().await.unwrap();

        let stored = te.engine.approvals.get(&approval.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Expired);
        let run = orch.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.termination_reason, Some(TerminationReason::ApprovalTimeout));
    }
}
