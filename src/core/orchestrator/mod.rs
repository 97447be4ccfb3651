//! Task/Run lifecycle.
//!
//! A task owns the step graph; a run is one execution of it. Both documents
//! are the resume point: an approval pause leaves them persisted and any
//! process can pick the run up again.

mod executor;
pub mod plan;
pub mod types;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::activity::ActivityType;
use crate::core::approval::{Approval, ApprovalStatus};
use crate::core::engine::Engine;
use crate::core::errors::{EngineError, FailureKind, StepFailure, TerminationReason};
use crate::core::store::{self, keys};

pub use types::{CompletedStep, Run, RunReplay, RunStatus, Step, StepStatus, Task, TaskStatus};

const DEFAULT_PROJECT: &str = "default";

pub fn can_transition_task(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        TaskStatus::Pending => matches!(to, TaskStatus::Planning | TaskStatus::Failed),
        TaskStatus::Planning => matches!(to, TaskStatus::Executing | TaskStatus::Failed),
        TaskStatus::Executing => matches!(
            to,
            TaskStatus::ApprovalNeeded | TaskStatus::Completed | TaskStatus::Failed
        ),
        TaskStatus::ApprovalNeeded => matches!(to, TaskStatus::Executing | TaskStatus::Failed),
        TaskStatus::Completed | TaskStatus::Failed => false,
    }
}

pub fn can_transition_run(from: RunStatus, to: RunStatus) -> bool {
    match from {
        RunStatus::Created => matches!(to, RunStatus::Started | RunStatus::Terminated),
        RunStatus::Started => matches!(to, RunStatus::WaitingApproval | RunStatus::Terminated),
        RunStatus::WaitingApproval => matches!(to, RunStatus::Started | RunStatus::Terminated),
        RunStatus::Terminated => false,
    }
}

fn set_task_status(task: &mut Task, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
    if !can_transition_task(task.status, to) {
        return Err(EngineError::InvalidTransition {
            entity: "task",
            from: task.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
        .into());
    }
    task.status = to;
    task.updated_at = now;
    Ok(())
}

/// One-line account of a failed step: worker kind, description and error.
pub(crate) fn failure_summary(step: &Step, failure: &StepFailure) -> String {
    format!(
        "{} step `{}` ({}) failed: {}",
        step.worker, step.id, step.description, failure
    )
}

fn completed_entry(step: &Step, now: DateTime<Utc>) -> CompletedStep {
    CompletedStep {
        step_id: step.id.clone(),
        worker: step.worker,
        status: step.status,
        result: step.result.clone(),
        error: step.error.as_ref().map(|e| e.to_string()),
        finished_at: step.finished_at.unwrap_or(now),
    }
}

/// Mark a step terminal and record it in `steps_completed`.
pub(crate) fn settle_step(task: &mut Task, step_id: &str, status: StepStatus, error: Option<StepFailure>, now: DateTime<Utc>) {
    let Some(step) = task.step_mut(step_id) else {
        return;
    };
    step.status = status;
    step.finished_at = Some(now);
    if error.is_some() {
        step.error = error;
    }
    let entry = completed_entry(step, now);
    task.steps_completed.retain(|c| c.step_id != step_id);
    task.steps_completed.push(entry);
    task.updated_at = now;
}

pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn create_task(&self, user_id: &str, query: &str, project_id: Option<&str>) -> Result<Task> {
        let now = self.engine.clock.now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.unwrap_or(DEFAULT_PROJECT).to_string(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            status: TaskStatus::Pending,
            todo_list: Vec::new(),
            steps_completed: Vec::new(),
            artifacts: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        };
        self.save_task(&task).await?;
        info!(task_id = %task.id, user_id, "Task created");
        Ok(task)
    }

    pub async fn create_run(&self, user_id: &str, query: &str, project_id: Option<&str>) -> Result<(Run, Task)> {
        let task = self.create_task(user_id, query, project_id).await?;
        let run = self.open_run(&task).await?;
        Ok((run, task))
    }

    async fn open_run(&self, task: &Task) -> Result<Run> {
        let now = self.engine.clock.now();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            status: RunStatus::Created,
            termination_reason: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };
        let store = self.engine.store.as_ref();
        store::save(store, &keys::run(&run.id), &run).await?;
        store
            .set(&keys::run_for_task(&task.id), None, json!(run.id))
            .await?;
        store
            .zadd(
                &keys::runs_by_user(&run.user_id),
                &run.id,
                now.timestamp_millis() as f64,
            )
            .await?;
        self.engine
            .activity
            .record(&run, ActivityType::RunCreated, json!({ "query": task.query }))
            .await?;
        info!(run_id = %run.id, task_id = %task.id, "Run created");
        Ok(run)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        store::load(self.engine.store.as_ref(), &keys::task(task_id)).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        store::load(self.engine.store.as_ref(), &keys::run(run_id)).await
    }

    pub(crate) async fn require_run(&self, run_id: &str) -> Result<Run> {
        self.get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id).into())
    }

    pub(crate) async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id).into())
    }

    /// Runs for a user, newest first.
    pub async fn list_runs(&self, user_id: &str) -> Result<Vec<Run>> {
        let ids = self
            .engine
            .store
            .zrange_by_score(&keys::runs_by_user(user_id), f64::MIN, f64::MAX, 0, usize::MAX)
            .await?;
        let mut runs = Vec::with_capacity(ids.len());
        for (id, _) in ids.into_iter().rev() {
            if let Some(run) = self.get_run(&id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    pub async fn get_run_replay(&self, run_id: &str) -> Result<Option<RunReplay>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let task = self.get_task(&run.task_id).await?;
        let events = self.engine.activity.run_events(run_id).await?;
        Ok(Some(RunReplay { run, task, events }))
    }

    pub async fn list_pending_approvals(&self, user_id: &str) -> Result<Vec<Approval>> {
        self.engine.approvals.list_pending(Some(user_id)).await
    }

    pub(crate) async fn save_task(&self, task: &Task) -> Result<()> {
        store::save(self.engine.store.as_ref(), &keys::task(&task.id), task).await
    }

    /// Read-modify-write of a run document as one compare-and-set on the
    /// whole document. `apply` returns false to leave the run untouched.
    async fn update_run<F>(&self, run_id: &str, mut apply: F) -> Result<Option<Run>>
    where
        F: FnMut(&mut Run) -> Result<bool>,
    {
        let key = keys::run(run_id);
        loop {
            let Some(raw) = self.engine.store.get(&key, None).await? else {
                return Err(EngineError::not_found("run", run_id).into());
            };
            let mut run: Run = serde_json::from_value(raw.clone())?;
            if !apply(&mut run)? {
                return Ok(None);
            }
            run.updated_at = self.engine.clock.now();
            let next = serde_json::to_value(&run)?;
            if self.engine.store.compare_and_set(&key, "", &raw, next).await? {
                return Ok(Some(run));
            }
        }
    }

    /// Move a run to `to`. Already being there is not an error.
    pub(crate) async fn move_run(&self, run_id: &str, to: RunStatus) -> Result<Run> {
        let updated = self
            .update_run(run_id, |run| {
                if run.status == to {
                    return Ok(false);
                }
                if !can_transition_run(run.status, to) {
                    return Err(EngineError::InvalidTransition {
                        entity: "run",
                        from: run.status.as_str().to_string(),
                        to: to.as_str().to_string(),
                    }
                    .into());
                }
                run.status = to;
                Ok(true)
            })
            .await?;
        match updated {
            Some(run) => Ok(run),
            None => self.require_run(run_id).await,
        }
    }

    /// Terminate with exactly one reason. Returns None if the run had already
    /// terminated, in which case nothing is written or logged.
    pub(crate) async fn terminate_run(&self, run_id: &str, reason: TerminationReason) -> Result<Option<Run>> {
        let now = self.engine.clock.now();
        let terminated = self
            .update_run(run_id, |run| {
                if run.status == RunStatus::Terminated {
                    return Ok(false);
                }
                run.status = RunStatus::Terminated;
                run.termination_reason = Some(reason);
                run.terminated_at = Some(now);
                Ok(true)
            })
            .await?;
        if let Some(run) = &terminated {
            self.engine
                .activity
                .record(run, ActivityType::RunTerminated, json!({ "reason": reason.as_str() }))
                .await?;
            info!(run_id = %run.id, "Run terminated: {}", reason.as_str());
        }
        Ok(terminated)
    }

    pub(crate) async fn run_is_live(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .get_run(run_id)
            .await?
            .is_some_and(|r| r.status != RunStatus::Terminated))
    }

    /// Fail the task with `summary` and terminate the run with `reason`.
    pub(crate) async fn fail_run(
        &self,
        run: &Run,
        task: &mut Task,
        reason: TerminationReason,
        summary: String,
    ) -> Result<Run> {
        let now = self.engine.clock.now();
        if !task.status.is_terminal() {
            set_task_status(task, TaskStatus::Failed, now)?;
            task.failure = Some(summary.clone());
            self.save_task(task).await?;
        }
        error!(run_id = %run.id, task_id = %task.id, "{}", summary);
        match self.terminate_run(&run.id, reason).await? {
            Some(run) => Ok(run),
            None => self.require_run(&run.id).await,
        }
    }

    /// Answer a pending approval. Approving resumes the run from its first
    /// pending step; rejecting fails the step and terminates the run.
    pub async fn respond_to_approval(&self, approval_id: &str, approved: bool, notes: Option<String>) -> Result<Run> {
        let approval = self
            .engine
            .approvals
            .get(approval_id)
            .await?
            .ok_or_else(|| EngineError::not_found("approval", approval_id))?;
        let run = self.require_run(&approval.run_id).await?;
        if run.status == RunStatus::Terminated {
            return Err(EngineError::RunTerminated(run.id).into());
        }

        let answered = match self.engine.approvals.respond(approval_id, approved, notes).await {
            Ok(answered) => answered,
            Err(e) => {
                // A late answer expires the approval; the run times out with it.
                if let Some(current) = self.engine.approvals.get(approval_id).await?
                    && current.status == ApprovalStatus::Expired
                {
                    self.close_for_approval(&current).await?;
                }
                return Err(e);
            }
        };

        if !approved {
            return self.close_for_approval(&answered).await;
        }

        self.engine
            .activity
            .record(
                &run,
                ActivityType::ApprovalApproved,
                json!({ "approval_id": answered.id, "step_id": answered.step_id, "notes": answered.notes }),
            )
            .await?;
        let mut task = self.require_task(&run.task_id).await?;
        if let Some(step) = task.step_mut(&answered.step_id) {
            step.approval_granted = true;
            step.approval_id = Some(answered.id.clone());
        }
        let now = self.engine.clock.now();
        if task.status == TaskStatus::ApprovalNeeded {
            set_task_status(&mut task, TaskStatus::Executing, now)?;
        }
        self.save_task(&task).await?;
        self.move_run(&run.id, RunStatus::Started).await?;
        info!(run_id = %run.id, step_id = %answered.step_id, "Approval granted, resuming");
        self.execute_run(&run.id).await
    }

    /// Fail the gated step of a rejected or expired approval and terminate
    /// its run.
    async fn close_for_approval(&self, approval: &Approval) -> Result<Run> {
        let run = self.require_run(&approval.run_id).await?;
        let (event, kind, message) = match approval.status {
            ApprovalStatus::Rejected => (
                ActivityType::ApprovalRejected,
                FailureKind::ApprovalRejected,
                match &approval.notes {
                    Some(notes) => format!("approval rejected: {}", notes),
                    None => "approval rejected".to_string(),
                },
            ),
            _ => (
                ActivityType::ApprovalExpired,
                FailureKind::ApprovalTimeout,
                format!("approval expired at {}", approval.expires_at.to_rfc3339()),
            ),
        };
        self.engine
            .activity
            .record(
                &run,
                event,
                json!({ "approval_id": approval.id, "step_id": approval.step_id, "notes": approval.notes }),
            )
            .await?;
        if run.status == RunStatus::Terminated {
            return Ok(run);
        }

        let mut task = self.require_task(&run.task_id).await?;
        let failure = StepFailure::new(kind, message);
        let now = self.engine.clock.now();
        settle_step(&mut task, &approval.step_id, StepStatus::Failed, Some(failure.clone()), now);
        let summary = match task.step(&approval.step_id) {
            Some(step) => {
                self.engine
                    .activity
                    .record(
                        &run,
                        ActivityType::StepFailed,
                        json!({ "step_id": step.id, "worker": step.worker, "reason": kind.as_str(), "error": failure.message }),
                    )
                    .await?;
                failure_summary(step, &failure)
            }
            None => failure.to_string(),
        };
        self.fail_run(&run, &mut task, kind.termination_reason(), summary).await
    }

    /// Expire overdue approvals and time out their runs.
    pub async fn expire_approvals(&self) -> Result<Vec<Approval>> {
        let expired = self.engine.approvals.expire_due().await?;
        for approval in &expired {
            if let Err(e) = self.close_for_approval(approval).await {
                warn!(approval_id = %approval.id, "Could not time out run {}: {}", approval.run_id, e);
            }
        }
        Ok(expired)
    }

    /// Terminate a run on the user's behalf. Takes effect between dispatches;
    /// results of steps still in flight are discarded.
    pub async fn cancel_run(&self, run_id: &str) -> Result<Run> {
        let run = self.require_run(run_id).await?;
        if run.status == RunStatus::Terminated {
            return Err(EngineError::RunTerminated(run.id).into());
        }
        let mut task = self.require_task(&run.task_id).await?;
        for step in task.todo_list.iter().filter(|s| s.status == StepStatus::Pending) {
            if let Some(approval) = self.engine.approvals.approval_for_step(run_id, &step.id).await?
                && approval.status == ApprovalStatus::Pending
                && let Err(e) = self
                    .engine
                    .approvals
                    .respond(&approval.id, false, Some("run cancelled".into()))
                    .await
            {
                warn!(approval_id = %approval.id, "Could not withdraw approval: {}", e);
            }
        }
        self.fail_run(&run, &mut task, TerminationReason::UserCancelled, "cancelled by user".into())
            .await
    }
}

#[cfg(test)]
mod tests;
