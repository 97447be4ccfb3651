use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use crate::core::activity::ActivityType;
use crate::core::approval::{ApprovalStatus, RiskLevel};
use crate::core::config::{EngineConfig, WorkerOverride};
use crate::core::errors::{FailureKind, TerminationReason};
use crate::core::orchestrator::types::{RunStatus, StepStatus, TaskStatus};
use crate::core::testing::{Reply, ScriptedWorker, TestEngine, step, step_after, test_engine};
use crate::core::workers::WorkerKind;

fn executor() -> Arc<ScriptedWorker> {
    Arc::new(ScriptedWorker::new(
        WorkerKind::CodeExecution,
        Reply::ok(json!({ "stdout": "installed", "exit_code": 0 })),
    ))
}

fn gated_engine(exec: &Arc<ScriptedWorker>) -> TestEngine {
    let research = Arc::new(ScriptedWorker::new(
        WorkerKind::Research,
        Reply::ok(json!({ "findings": ["needs libssl"] })),
    ));
    test_engine(
        EngineConfig::default(),
        vec![
            step("look", WorkerKind::Research, "Find the missing library"),
            step_after("install", WorkerKind::CodeExecution, "Run sudo apt-get install libssl-dev", &["look"]),
        ],
        &[research, exec.clone()],
    )
}

#[tokio::test]
async fn risky_step_pauses_until_approved() {
    let exec = executor();
    let te = gated_engine(&exec);
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Fix the build", None).await.unwrap();

    let paused = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::WaitingApproval);
    assert_eq!(exec.calls(), 0);
    let stored = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::ApprovalNeeded);
    assert_eq!(stored.step("look").unwrap().status, StepStatus::Completed);
    assert_eq!(stored.step("install").unwrap().status, StepStatus::Pending);

    let pending = orch.list_pending_approvals("user-1").await.unwrap();
    assert_eq!(pending.len(), 1);
    let approval = &pending[0];
    assert_eq!(approval.step_id, "install");
    assert_eq!(approval.risk_level, RiskLevel::High);
    assert!(approval.description.contains("Risk factors:"));
    assert_eq!(approval.expires_at - approval.created_at, Duration::hours(24));

    // Re-entering a paused run neither dispatches nor asks twice.
    let again = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(again.status, RunStatus::WaitingApproval);
    assert_eq!(orch.list_pending_approvals("user-1").await.unwrap().len(), 1);

    let done = orch
        .respond_to_approval(&approval.id, true, Some("go ahead".into()))
        .await
        .unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(exec.calls(), 1);
    assert!(orch.list_pending_approvals("user-1").await.unwrap().is_empty());

    let replay = orch.get_run_replay(&run.id).await.unwrap().unwrap();
    let types: Vec<ActivityType> = replay.events.iter().map(|e| e.activity_type).collect();
    let approved_at = types.iter().position(|t| *t == ActivityType::ApprovalApproved).unwrap();
    assert!(types[..approved_at].contains(&ActivityType::ApprovalRequested));
    assert!(types[..approved_at].contains(&ActivityType::RunWaitingApproval));
    assert!(types[approved_at..].contains(&ActivityType::StepStarted));
}

#[tokio::test]
async fn rejection_fails_the_step_and_the_run() {
    let exec = executor();
    let te = gated_engine(&exec);
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Fix the build", None).await.unwrap();
    orch.execute_run(&run.id).await.unwrap();
    let approval = orch.list_pending_approvals("user-1").await.unwrap().remove(0);

    let done = orch
        .respond_to_approval(&approval.id, false, Some("not on this box".into()))
        .await
        .unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::ApprovalRejected));
    assert_eq!(exec.calls(), 0);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.failure.as_ref().unwrap().contains("not on this box"));
    let install = task.step("install").unwrap();
    assert_eq!(install.status, StepStatus::Failed);
    assert_eq!(install.error.as_ref().unwrap().kind, FailureKind::ApprovalRejected);

    let stored = te.engine.approvals.get(&approval.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Rejected);
    assert!(orch.respond_to_approval(&approval.id, true, None).await.is_err());
}

#[tokio::test]
async fn overdue_approval_times_the_run_out() {
    let exec = executor();
    let te = gated_engine(&exec);
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Fix the build", None).await.unwrap();
    orch.execute_run(&run.id).await.unwrap();

    te.clock.advance(Duration::hours(23));
    assert!(orch.expire_approvals().await.unwrap().is_empty());

    te.clock.advance(Duration::hours(2));
    let expired = orch.expire_approvals().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, ApprovalStatus::Expired);

    let run = orch.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.termination_reason, Some(TerminationReason::ApprovalTimeout));
    let replay = orch.get_run_replay(&run.id).await.unwrap().unwrap();
    assert!(replay.events.iter().any(|e| e.activity_type == ActivityType::ApprovalExpired));
    assert_eq!(exec.calls(), 0);
}

#[tokio::test]
async fn late_answer_is_refused_and_expires_the_run() {
    let exec = executor();
    let te = gated_engine(&exec);
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Fix the build", None).await.unwrap();
    orch.execute_run(&run.id).await.unwrap();
    let approval = orch.list_pending_approvals("user-1").await.unwrap().remove(0);

    te.clock.advance(Duration::hours(25));
    assert!(orch.respond_to_approval(&approval.id, true, None).await.is_err());

    let run = orch.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Terminated);
    assert_eq!(run.termination_reason, Some(TerminationReason::ApprovalTimeout));
    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.step("install").unwrap().error.as_ref().unwrap().kind, FailureKind::ApprovalTimeout);
    assert_eq!(exec.calls(), 0);
}

#[tokio::test]
async fn contract_can_force_approval_of_low_risk_work() {
    let mut config = EngineConfig::default();
    config.workers.insert(
        "writing".into(),
        WorkerOverride {
            always_require_approval: Some(true),
            ..Default::default()
        },
    );
    let writer = Arc::new(ScriptedWorker::new(WorkerKind::Writing, Reply::ok(json!({ "content": "hi" }))));
    let te = test_engine(
        config,
        vec![step("draft", WorkerKind::Writing, "Draft the summary")],
        &[writer.clone()],
    );
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Draft", None).await.unwrap();

    let paused = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::WaitingApproval);
    let approval = orch.list_pending_approvals("user-1").await.unwrap().remove(0);
    assert_eq!(approval.risk_level, RiskLevel::Low);

    let done = orch.respond_to_approval(&approval.id, true, None).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(writer.calls(), 1);
}

#[tokio::test]
async fn deployment_is_always_gated() {
    let deployer = Arc::new(ScriptedWorker::new(
        WorkerKind::Deployment,
        Reply::ok(json!({ "deployment_id": "dep-1" })),
    ));
    let mut ship = step("ship", WorkerKind::Deployment, "Ship build 42");
    ship.require_approval = Some(false);
    let te = test_engine(EngineConfig::default(), vec![ship], &[deployer.clone()]);
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Ship", None).await.unwrap();

    let paused = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::WaitingApproval);
    assert_eq!(deployer.calls(), 0);
}

#[tokio::test]
async fn low_risk_steps_are_auto_approved() {
    let exec = executor();
    let mut config = EngineConfig::default();
    config.approval.max_auto_approve_level = RiskLevel::Medium;
    let te = test_engine(
        config,
        vec![step("check", WorkerKind::CodeExecution, "Print the compiler version")],
        &[exec.clone()],
    );
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Check", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Completed));
    assert!(orch.list_pending_approvals("user-1").await.unwrap().is_empty());
    assert_eq!(exec.calls(), 1);
}
