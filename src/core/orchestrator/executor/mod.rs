//! Step dispatch loop.
//!
//! Each round skips steps blocked by failed dependencies, gates the ready set
//! behind approval, admits every ready step against the budgets, then runs
//! the admitted steps concurrently. Results are folded back into the task
//! only while the run is still live.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{Orchestrator, failure_summary, set_task_status, settle_step};
use crate::core::activity::ActivityType;
use crate::core::approval::ApprovalStatus;
use crate::core::budget::{BudgetSubject, ResourceKind};
use crate::core::engine::Engine;
use crate::core::errors::{FailureKind, PlanError, StepFailure, TerminationReason};
use crate::core::memory::RunSummary;
use crate::core::orchestrator::plan::validate_plan;
use crate::core::orchestrator::types::{Run, RunStatus, Step, StepResult, StepStatus, Task, TaskStatus};
use crate::core::store::keys;
use crate::core::workers::{DispatchOutcome, WorkerContext, WorkerOutput};

/// How one step's attempt loop ended.
#[derive(Debug)]
pub(crate) enum StepRun {
    Completed { output: WorkerOutput, attempts: u32 },
    Failed { failure: StepFailure, attempts: u32 },
    /// The run terminated between attempts.
    Abandoned,
}

/// Pending steps with all dependencies completed, in plan order.
pub(crate) fn ready_steps(task: &Task) -> Vec<String> {
    let completed: HashSet<&str> = task
        .todo_list
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.id.as_str())
        .collect();
    task.todo_list
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| s.depends_on.iter().all(|d| completed.contains(d.as_str())))
        .map(|s| s.id.clone())
        .collect()
}

/// Put steps left `Running` by an interrupted dispatch back in the queue.
/// Their earlier invocation stays recorded as spent; the next round admits
/// them again.
pub(crate) fn requeue_interrupted(task: &mut Task) -> Vec<String> {
    let mut requeued = Vec::new();
    for step in task.todo_list.iter_mut().filter(|s| s.status == StepStatus::Running) {
        step.status = StepStatus::Pending;
        step.started_at = None;
        requeued.push(step.id.clone());
    }
    requeued
}

/// Pending steps with a failed or skipped dependency. Repeated until no more
/// steps are blocked so skips cascade down the graph.
pub(crate) fn blocked_steps(task: &Task) -> Vec<(String, String)> {
    let mut dead: HashSet<&str> = task
        .todo_list
        .iter()
        .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
        .map(|s| s.id.as_str())
        .collect();
    let mut out = Vec::new();
    loop {
        let mut changed = false;
        for step in task.todo_list.iter().filter(|s| s.status == StepStatus::Pending) {
            if dead.contains(step.id.as_str()) {
                continue;
            }
            if let Some(dep) = step.depends_on.iter().find(|d| dead.contains(d.as_str())) {
                out.push((step.id.clone(), dep.clone()));
                dead.insert(step.id.as_str());
                changed = true;
            }
        }
        if !changed {
            return out;
        }
    }
}

/// Outputs of the step's direct dependencies, keyed by dependency id.
fn dependency_outputs(task: &Task, step: &Step) -> Map<String, Value> {
    step.depends_on
        .iter()
        .filter_map(|dep| task.step(dep))
        .filter_map(|dep| {
            dep.result
                .as_ref()
                .map(|r| (dep.id.clone(), Value::Object(r.outputs.clone())))
        })
        .collect()
}

/// What the approval gate inspects as the step's prior result: its own
/// result if it has one, otherwise the merged outputs of its dependencies.
fn prior_result(task: &Task, step: &Step) -> Option<Value> {
    if let Some(result) = &step.result {
        return serde_json::to_value(result).ok();
    }
    let mut merged = Map::new();
    for outputs in dependency_outputs(task, step).into_values() {
        if let Value::Object(map) = outputs {
            merged.extend(map);
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(json!({ "outputs": merged }))
    }
}

fn worker_context(task: &Task, step: &Step) -> WorkerContext {
    let deps = dependency_outputs(task, step);
    WorkerContext {
        task_id: task.id.clone(),
        step_id: step.id.clone(),
        project_id: task.project_id.clone(),
        user_id: task.user_id.clone(),
        recent_context: (!deps.is_empty()).then(|| Value::Object(deps).to_string()),
        rag_context: None,
        library_ids: Vec::new(),
    }
}

/// Dispatch one step until it succeeds, fails terminally, or exhausts its
/// retry ceiling. Every retry is re-admitted against the budgets.
async fn run_step(engine: Arc<Engine>, run: Run, task_id: String, step: Step, inputs: String, context: WorkerContext) -> StepRun {
    let contract = engine.contracts.contract(step.worker).clone();
    let subject = BudgetSubject::new(run.id.clone(), run.user_id.clone());
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = engine.workers.dispatch(&contract, &inputs, &context).await;
        let failure = match outcome {
            DispatchOutcome::Succeeded(output) => {
                if output.tokens_used > 0 {
                    match engine
                        .budgets
                        .consume_all_scopes(&subject, ResourceKind::LlmTokens, output.tokens_used)
                        .await
                    {
                        Ok(check) if !check.allowed => {
                            // The tokens are spent either way.
                            if let Err(e) = engine
                                .budgets
                                .record_all_scopes(&subject, ResourceKind::LlmTokens, output.tokens_used)
                                .await
                            {
                                warn!(run_id = %run.id, step_id = %step.id, "Token accounting failed: {}", e);
                            }
                            return StepRun::Failed {
                                failure: StepFailure::new(
                                    FailureKind::BudgetExhausted,
                                    check.denial_message(ResourceKind::LlmTokens, output.tokens_used),
                                ),
                                attempts,
                            };
                        }
                        Ok(_) => {}
                        Err(e) => warn!(run_id = %run.id, step_id = %step.id, "Token accounting failed: {}", e),
                    }
                }
                if let Err(e) = engine.contracts.clear_retries(&task_id, &step.id).await {
                    debug!(step_id = %step.id, "Could not clear retry account: {}", e);
                }
                return StepRun::Completed { output, attempts };
            }
            DispatchOutcome::Failed {
                failure,
                tokens_used,
                duration_ms,
            } => {
                debug!(
                    run_id = %run.id,
                    step_id = %step.id,
                    "Attempt {} failed after {}ms, {} tokens",
                    attempts,
                    duration_ms,
                    tokens_used
                );
                if tokens_used > 0 {
                    match engine
                        .budgets
                        .record_all_scopes(&subject, ResourceKind::LlmTokens, tokens_used)
                        .await
                    {
                        Ok(check) if !check.allowed => {
                            let failure = StepFailure::new(
                                FailureKind::BudgetExhausted,
                                format!(
                                    "{} after a failed attempt: {}",
                                    check.denial_message(ResourceKind::LlmTokens, tokens_used),
                                    failure.message
                                ),
                            );
                            return StepRun::Failed { failure, attempts };
                        }
                        Ok(_) => {}
                        Err(e) => warn!(run_id = %run.id, step_id = %step.id, "Token accounting failed: {}", e),
                    }
                }
                failure
            }
        };

        if !failure.kind.is_retryable() {
            return StepRun::Failed { failure, attempts };
        }
        let can_retry = match engine.contracts.can_retry(&task_id, &step).await {
            Ok(can) => can,
            Err(e) => {
                warn!(step_id = %step.id, "Retry accounting failed: {}", e);
                false
            }
        };
        if !can_retry {
            let failure = StepFailure::new(
                failure.kind,
                format!("{} (gave up after {} attempts)", failure.message, attempts),
            );
            return StepRun::Failed { failure, attempts };
        }
        if let Err(e) = engine
            .contracts
            .record_retry(&task_id, &step, &failure.to_string())
            .await
        {
            warn!(step_id = %step.id, "Could not record retry: {}", e);
        }

        let live = match engine.store.get(&keys::run(&run.id), Some("status")).await {
            Ok(status) => status.and_then(|v| v.as_str().map(str::to_string)).as_deref()
                != Some(RunStatus::Terminated.as_str()),
            Err(_) => true,
        };
        if !live {
            return StepRun::Abandoned;
        }

        match engine
            .budgets
            .consume_all_scopes(&subject, ResourceKind::WorkerInvocations, 1)
            .await
        {
            Ok(check) if !check.allowed => {
                return StepRun::Failed {
                    failure: StepFailure::new(
                        FailureKind::BudgetExhausted,
                        check.denial_message(ResourceKind::WorkerInvocations, 1),
                    ),
                    attempts,
                };
            }
            Ok(_) => {}
            Err(e) => {
                return StepRun::Failed {
                    failure: StepFailure::new(FailureKind::AgentError, format!("budget check failed: {}", e)),
                    attempts,
                };
            }
        }
    }
}

impl Orchestrator {
    /// Drive a run until it pauses for approval or terminates.
    pub async fn execute_run(&self, run_id: &str) -> Result<Run> {
        let mut run = self.require_run(run_id).await?;
        match run.status {
            RunStatus::Terminated => return Ok(run),
            RunStatus::WaitingApproval => {
                info!(run_id, "Run is waiting for approval");
                return Ok(run);
            }
            RunStatus::Created => {
                run = self.move_run(run_id, RunStatus::Started).await?;
                self.engine
                    .activity
                    .record(&run, ActivityType::RunStarted, json!({}))
                    .await?;
                info!(run_id, task_id = %run.task_id, "Run started");
            }
            RunStatus::Started => {}
        }

        let mut task = self.require_task(&run.task_id).await?;
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Planning) {
            if let Err(e) = self.plan_task(&mut task).await {
                let reason = match e.downcast_ref::<PlanError>() {
                    Some(_) => TerminationReason::ValidationError,
                    None => TerminationReason::AgentError,
                };
                return self
                    .fail_run(&run, &mut task, reason, format!("planning failed: {}", e))
                    .await;
            }
        }
        if task.status.is_terminal() {
            let reason = if task.status == TaskStatus::Completed {
                TerminationReason::Completed
            } else {
                TerminationReason::AgentError
            };
            return Ok(self.terminate_run(run_id, reason).await?.unwrap_or(run));
        }
        if task.status == TaskStatus::ApprovalNeeded {
            set_task_status(&mut task, TaskStatus::Executing, self.engine.clock.now())?;
        }
        let requeued = requeue_interrupted(&mut task);
        if !requeued.is_empty() {
            warn!(run_id, "Requeued interrupted step(s): {}", requeued.join(", "));
            self.save_task(&task).await?;
        }
        self.drive(run, task).await
    }

    /// Plan the run for the task, creating one if none exists yet.
    pub async fn execute_task(&self, task_id: &str) -> Result<Run> {
        let existing = self
            .engine
            .store
            .get(&keys::run_for_task(task_id), None)
            .await?
            .and_then(|v| v.as_str().map(str::to_string));
        let run_id = match existing {
            Some(id) => id,
            None => {
                let task = self.require_task(task_id).await?;
                self.open_run(&task).await?.id
            }
        };
        self.execute_run(&run_id).await
    }

    async fn plan_task(&self, task: &mut Task) -> Result<()> {
        let now = self.engine.clock.now();
        if task.status == TaskStatus::Pending {
            set_task_status(task, TaskStatus::Planning, now)?;
            self.save_task(task).await?;
        }
        let steps = self.engine.planner.plan(task).await?;
        validate_plan(&steps)?;
        info!(task_id = %task.id, "Planned {} steps", steps.len());
        task.todo_list = steps;
        task.steps_completed.clear();
        set_task_status(task, TaskStatus::Executing, self.engine.clock.now())?;
        self.save_task(task).await
    }

    /// Persist the task unless the run was terminated underneath us.
    async fn checkpoint(&self, run: &Run, task: &mut Task) -> Result<bool> {
        if self.run_is_live(&run.id).await? {
            self.save_task(task).await?;
            return Ok(true);
        }
        self.settle_abandoned(run, task).await?;
        Ok(false)
    }

    /// The run terminated elsewhere (cancel, expiry). Make sure the task
    /// agrees and stop.
    async fn settle_abandoned(&self, run: &Run, task: &mut Task) -> Result<Run> {
        let current = self.require_run(&run.id).await?;
        let mut stored = self.require_task(&task.id).await?;
        if !stored.status.is_terminal() {
            let reason = current
                .termination_reason
                .map(|r| r.as_str())
                .unwrap_or("terminated");
            set_task_status(&mut stored, TaskStatus::Failed, self.engine.clock.now())?;
            stored.failure = Some(format!("run terminated: {}", reason));
            self.save_task(&stored).await?;
        }
        *task = stored;
        info!(run_id = %run.id, "Run terminated while executing, results discarded");
        Ok(current)
    }

    async fn drive(&self, run: Run, mut task: Task) -> Result<Run> {
        let engine = self.engine.clone();
        let subject = BudgetSubject::new(run.id.clone(), run.user_id.clone());

        loop {
            if !self.run_is_live(&run.id).await? {
                return self.settle_abandoned(&run, &mut task).await;
            }
            let now = engine.clock.now();

            for (step_id, dep) in blocked_steps(&task) {
                let failure = StepFailure::new(
                    FailureKind::DependencyFailed,
                    format!("dependency `{}` did not complete", dep),
                );
                settle_step(&mut task, &step_id, StepStatus::Skipped, Some(failure.clone()), now);
                engine
                    .activity
                    .record(
                        &run,
                        ActivityType::StepFailed,
                        json!({ "step_id": step_id, "status": "skipped", "reason": failure.kind.as_str(), "error": failure.message }),
                    )
                    .await?;
                info!(run_id = %run.id, step_id = %step_id, "Skipped: {}", failure.message);
            }

            if task.all_steps_terminal() {
                return self.finish(&run, &mut task).await;
            }

            let ready = ready_steps(&task);
            if ready.is_empty() {
                let summary = "no step is ready and none is running".to_string();
                return self
                    .fail_run(&run, &mut task, TerminationReason::DependencyFailed, summary)
                    .await;
            }

            // Approval gate. The first step that needs a human pauses the run.
            for step_id in &ready {
                let Some(step) = task.step(step_id) else { continue };
                if step.approval_granted {
                    continue;
                }
                let prior = prior_result(&task, step);
                let decision = engine.approvals.should_require_approval(step, &task, prior.as_ref());
                let forced = engine.contracts.contract(step.worker).always_require_approval;
                if !decision.required && !forced {
                    debug!(step_id = %step.id, "Approval not required: {}", decision.reason);
                    continue;
                }

                if let Some(existing) = engine.approvals.approval_for_step(&run.id, step_id).await? {
                    match existing.status {
                        ApprovalStatus::Approved => {
                            if let Some(step) = task.step_mut(step_id) {
                                step.approval_granted = true;
                            }
                            continue;
                        }
                        ApprovalStatus::Pending => return self.pause(&run, &mut task).await,
                        ApprovalStatus::Rejected | ApprovalStatus::Expired => {
                            return self.close_for_approval(&existing).await;
                        }
                    }
                }

                let reason = if forced && !decision.required {
                    "worker always requires approval".to_string()
                } else {
                    decision.reason.clone()
                };
                let approval = engine
                    .approvals
                    .create_approval_request(&run, step, &decision.assessment, prior.as_ref())
                    .await?;
                engine
                    .activity
                    .record(
                        &run,
                        ActivityType::ApprovalRequested,
                        json!({
                            "approval_id": approval.id,
                            "step_id": step_id,
                            "risk_level": approval.risk_level,
                            "score": decision.assessment.score,
                            "reason": reason,
                        }),
                    )
                    .await?;
                if let Some(step) = task.step_mut(step_id) {
                    step.approval_id = Some(approval.id.clone());
                }
                return self.pause(&run, &mut task).await;
            }

            // Admission for every ready step before any dispatch.
            let mut admitted = Vec::with_capacity(ready.len());
            let mut denied_fatal = None;
            for step_id in &ready {
                let check = engine
                    .budgets
                    .consume_all_scopes(&subject, ResourceKind::WorkerInvocations, 1)
                    .await?;
                if check.allowed {
                    admitted.push(step_id.clone());
                    continue;
                }
                let failure = StepFailure::new(
                    FailureKind::BudgetExhausted,
                    check.denial_message(ResourceKind::WorkerInvocations, 1),
                );
                settle_step(&mut task, step_id, StepStatus::Failed, Some(failure.clone()), now);
                if let Some(step) = task.step(step_id) {
                    self.log_step_failure(&run, step, &failure, 0).await?;
                    if !step.allow_failure && denied_fatal.is_none() {
                        denied_fatal = Some(failure_summary(step, &failure));
                    }
                }
            }
            if let Some(summary) = denied_fatal {
                // None of the admitted steps will be dispatched.
                if !admitted.is_empty() {
                    engine
                        .budgets
                        .release_all_scopes(&subject, ResourceKind::WorkerInvocations, admitted.len() as u64)
                        .await?;
                }
                return self
                    .fail_run(&run, &mut task, TerminationReason::BudgetExhausted, summary)
                    .await;
            }

            let mut set = JoinSet::new();
            for step_id in &admitted {
                let Some(step) = task.step_mut(step_id) else { continue };
                step.status = StepStatus::Running;
                step.started_at = Some(now);
                let step = step.clone();
                engine
                    .activity
                    .record(
                        &run,
                        ActivityType::StepStarted,
                        json!({ "step_id": step.id, "worker": step.worker }),
                    )
                    .await?;
                info!(run_id = %run.id, step_id = %step.id, worker = %step.worker, "Dispatching step");

                let inputs = step.worker_inputs().to_string();
                let context = worker_context(&task, &step);
                let engine = engine.clone();
                let run = run.clone();
                let task_id = task.id.clone();
                let sid = step_id.clone();
                set.spawn(async move { (sid, run_step(engine, run, task_id, step, inputs, context).await) });
            }
            if !self.checkpoint(&run, &mut task).await? {
                set.abort_all();
                return self.require_run(&run.id).await;
            }

            let mut results: HashMap<String, StepRun> = HashMap::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((step_id, outcome)) => {
                        results.insert(step_id, outcome);
                    }
                    Err(e) => warn!(run_id = %run.id, "Step task failed to join: {}", e),
                }
            }

            if !self.run_is_live(&run.id).await? {
                return self.settle_abandoned(&run, &mut task).await;
            }

            let now = engine.clock.now();
            let mut fatal: Option<(FailureKind, String)> = None;
            for step_id in &admitted {
                let outcome = results.remove(step_id).unwrap_or(StepRun::Failed {
                    failure: StepFailure::new(FailureKind::AgentError, "worker task panicked"),
                    attempts: 1,
                });
                let Some(step) = task.step(step_id).cloned() else { continue };
                let failed = match outcome {
                    StepRun::Abandoned => continue,
                    StepRun::Completed { output, attempts } => {
                        let report = engine.contracts.validate_phase_exit(step.worker, &output.outputs);
                        for w in &report.warnings {
                            warn!(run_id = %run.id, step_id = %step.id, "{}", w);
                        }
                        if report.fatal {
                            Some((
                                StepFailure::new(FailureKind::ValidationError, report.errors.join("; ")),
                                attempts,
                                Some(output),
                            ))
                        } else {
                            for e in &report.errors {
                                warn!(run_id = %run.id, step_id = %step.id, worker = %step.worker, "{}", e);
                            }
                            let tokens = output.tokens_used;
                            let duration = output.duration_ms;
                            if let Some(s) = task.step_mut(step_id) {
                                s.result = Some(StepResult::from(output));
                                s.attempts = attempts;
                            }
                            settle_step(&mut task, step_id, StepStatus::Completed, None, now);
                            engine
                                .activity
                                .record(
                                    &run,
                                    ActivityType::StepCompleted,
                                    json!({
                                        "step_id": step_id,
                                        "worker": step.worker,
                                        "attempts": attempts,
                                        "tokens_used": tokens,
                                        "duration_ms": duration,
                                        "warnings": report.warnings,
                                    }),
                                )
                                .await?;
                            None
                        }
                    }
                    StepRun::Failed { failure, attempts } => Some((failure, attempts, None)),
                };

                if let Some((failure, attempts, output)) = failed {
                    if let Some(s) = task.step_mut(step_id) {
                        s.attempts = attempts;
                        if let Some(output) = output {
                            s.result = Some(StepResult::from(output));
                        }
                    }
                    settle_step(&mut task, step_id, StepStatus::Failed, Some(failure.clone()), now);
                    self.log_step_failure(&run, &step, &failure, attempts).await?;
                    if !step.allow_failure && fatal.is_none() {
                        fatal = Some((failure.kind, failure_summary(&step, &failure)));
                    }
                }
            }

            if !self.checkpoint(&run, &mut task).await? {
                return self.require_run(&run.id).await;
            }
            if let Some((kind, summary)) = fatal {
                return self
                    .fail_run(&run, &mut task, kind.termination_reason(), summary)
                    .await;
            }
        }
    }

    async fn log_step_failure(&self, run: &Run, step: &Step, failure: &StepFailure, attempts: u32) -> Result<()> {
        warn!(
            run_id = %run.id,
            step_id = %step.id,
            worker = %step.worker,
            "Step failed ({}): {}",
            failure.kind.as_str(),
            failure.message
        );
        self.engine
            .activity
            .record(
                run,
                ActivityType::StepFailed,
                json!({
                    "step_id": step.id,
                    "worker": step.worker,
                    "reason": failure.kind.as_str(),
                    "error": failure.message,
                    "attempts": attempts,
                    "allow_failure": step.allow_failure,
                }),
            )
            .await?;
        Ok(())
    }

    async fn pause(&self, run: &Run, task: &mut Task) -> Result<Run> {
        let now = self.engine.clock.now();
        if task.status != TaskStatus::ApprovalNeeded {
            set_task_status(task, TaskStatus::ApprovalNeeded, now)?;
        }
        if !self.checkpoint(run, task).await? {
            return self.require_run(&run.id).await;
        }
        let paused = self.move_run(&run.id, RunStatus::WaitingApproval).await?;
        self.engine
            .activity
            .record(&paused, ActivityType::RunWaitingApproval, json!({}))
            .await?;
        info!(run_id = %run.id, "Run paused for approval");
        Ok(paused)
    }

    async fn finish(&self, run: &Run, task: &mut Task) -> Result<Run> {
        let now = self.engine.clock.now();
        let summary = RunSummary::from_run(run, task, now);
        if let Err(e) = self.engine.memory.remember_run(&summary).await {
            warn!(run_id = %run.id, "Could not store run summary: {}", e);
        }
        set_task_status(task, TaskStatus::Completed, now)?;
        if !self.checkpoint(run, task).await? {
            return self.require_run(&run.id).await;
        }
        info!(
            run_id = %run.id,
            task_id = %task.id,
            "Task completed ({} steps, {} tokens)",
            summary.steps_total,
            summary.tokens_used
        );
        match self.terminate_run(&run.id, TerminationReason::Completed).await? {
            Some(run) => Ok(run),
            None => self.require_run(&run.id).await,
        }
    }
}
