//! Retries, budgets, timeouts and cancellation.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::core::approval::ApprovalStatus;
use crate::core::budget::{BudgetScope, ResourceKind};
use crate::core::config::{EngineConfig, WorkerOverride};
use crate::core::errors::{FailureKind, TerminationReason};
use crate::core::orchestrator::types::{RunStatus, StepStatus, TaskStatus};
use crate::core::testing::{Reply, ScriptedWorker, step, step_after, test_engine};
use crate::core::workers::WorkerKind;

fn findings() -> Reply {
    Reply::ok(json!({ "findings": ["ok"] }))
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let flaky = Arc::new(
        ScriptedWorker::new(WorkerKind::Research, findings())
            .then(Reply::Error("connection reset".into()))
            .then(Reply::Error("connection reset".into())),
    );
    let te = test_engine(
        EngineConfig::default(),
        vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
        &[flaky.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(flaky.calls(), 3);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.step("look").unwrap().attempts, 3);
    assert!(te.engine.contracts.retry_account(&task.id, "look").await.unwrap().is_none());
}

#[tokio::test]
async fn retry_ceiling_bounds_dispatches() {
    let dead = Arc::new(ScriptedWorker::new(
        WorkerKind::Research,
        Reply::Error("connection reset".into()),
    ));
    let te = test_engine(
        EngineConfig::default(),
        vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
        &[dead.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::AgentError));
    // One dispatch plus three retries.
    assert_eq!(dead.calls(), 4);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert!(task.failure.unwrap().contains("gave up after 4 attempts"));
    let account = te
        .engine
        .contracts
        .retry_account(&task.id, "look")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.attempts, 3);
    assert_eq!(account.max_retries, 3);
}

#[tokio::test]
async fn invocation_budget_is_checked_before_dispatch() {
    let mut config = EngineConfig::default();
    config.budget.run.worker_invocations = Some(1);
    let worker = Arc::new(ScriptedWorker::new(WorkerKind::Research, findings()));
    let te = test_engine(
        config,
        vec![
            step("a", WorkerKind::Research, "Look at crate A"),
            step("b", WorkerKind::Research, "Look at crate B"),
        ],
        &[worker.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Compare", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::BudgetExhausted));
    assert_eq!(worker.calls(), 0);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let b = task.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.error.as_ref().unwrap().kind, FailureKind::BudgetExhausted);
}

#[tokio::test]
async fn token_overrun_exhausts_the_run() {
    let mut config = EngineConfig::default();
    config.budget.run.llm_tokens = Some(5);
    let worker = Arc::new(ScriptedWorker::new(WorkerKind::Research, findings()));
    let te = test_engine(
        config,
        vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
        &[worker.clone()],
    );
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::BudgetExhausted));
    assert_eq!(worker.calls(), 1);
}

#[tokio::test]
async fn denied_round_releases_admitted_invocations() {
    let mut config = EngineConfig::default();
    config.budget.run.worker_invocations = Some(1);
    let worker = Arc::new(ScriptedWorker::new(WorkerKind::Research, findings()));
    let te = test_engine(
        config,
        vec![
            step("a", WorkerKind::Research, "Look at crate A"),
            step("b", WorkerKind::Research, "Look at crate B"),
        ],
        &[worker.clone()],
    );
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Compare", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::BudgetExhausted));
    assert_eq!(worker.calls(), 0);

    for (scope, id) in [
        (BudgetScope::Run, run.id.as_str()),
        (BudgetScope::User, "user-1"),
        (BudgetScope::Global, "global"),
    ] {
        let budget = te.engine.budgets.get_budget(scope, id).await.unwrap();
        assert_eq!(budget.used(ResourceKind::WorkerInvocations), 0, "{:?}", scope);
    }
}

#[tokio::test]
async fn failed_attempts_still_spend_tokens() {
    let mut config = EngineConfig::default();
    config.budget.run.llm_tokens = Some(100);
    let burner = Arc::new(ScriptedWorker::new(
        WorkerKind::Research,
        Reply::FailSpending {
            message: "model refused the format".into(),
            tokens: 40,
        },
    ));
    let te = test_engine(
        config,
        vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
        &[burner.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::BudgetExhausted));
    // The third failure pushes the run past 100 tokens, so no fourth attempt.
    assert_eq!(burner.calls(), 3);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    let look = task.step("look").unwrap();
    assert_eq!(look.error.as_ref().unwrap().kind, FailureKind::BudgetExhausted);
    assert!(look.error.as_ref().unwrap().message.contains("model refused the format"));

    let run_budget = te.engine.budgets.get_budget(BudgetScope::Run, &run.id).await.unwrap();
    let user_budget = te.engine.budgets.get_budget(BudgetScope::User, "user-1").await.unwrap();
    assert_eq!(run_budget.used(ResourceKind::LlmTokens), 120);
    assert_eq!(user_budget.used(ResourceKind::LlmTokens), 120);
}

#[tokio::test]
async fn interrupted_dispatch_resumes_from_the_running_step() {
    let worker = Arc::new(
        ScriptedWorker::new(WorkerKind::Research, findings())
            .then(Reply::Slow(Duration::from_secs(5), json!({ "findings": ["late"] }))),
    );
    let te = test_engine(
        EngineConfig::default(),
        vec![
            step("look", WorkerKind::Research, "Collect benchmark numbers"),
            step_after("next", WorkerKind::Research, "Collect more numbers", &["look"]),
        ],
        &[worker.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    // The driving process goes away mid-dispatch.
    let interrupted = tokio::time::timeout(Duration::from_millis(100), orch.execute_run(&run.id)).await;
    assert!(interrupted.is_err());
    let stranded = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stranded.step("look").unwrap().status, StepStatus::Running);

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Completed));
    assert_eq!(worker.calls(), 3);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.step("next").unwrap().status, StepStatus::Completed);
    let run_budget = te.engine.budgets.get_budget(BudgetScope::Run, &run.id).await.unwrap();
    assert_eq!(run_budget.used(ResourceKind::WorkerInvocations), 3);
}

#[tokio::test]
async fn slow_worker_times_out() {
    let mut config = EngineConfig::default();
    config.workers.insert(
        "analysis".into(),
        WorkerOverride {
            timeout_ms: Some(20),
            max_retries: Some(0),
            ..Default::default()
        },
    );
    let slow = Arc::new(ScriptedWorker::new(
        WorkerKind::Analysis,
        Reply::Slow(Duration::from_millis(500), json!({ "analysis": "late" })),
    ));
    let te = test_engine(
        config,
        vec![step("think", WorkerKind::Analysis, "Compare the numbers")],
        &[slow.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Think", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::Timeout));
    assert_eq!(slow.calls(), 1);
    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.step("think").unwrap().error.as_ref().unwrap().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn cancelling_a_paused_run_withdraws_its_approval() {
    let exec = Arc::new(ScriptedWorker::new(
        WorkerKind::CodeExecution,
        Reply::ok(json!({ "stdout": "", "exit_code": 0 })),
    ));
    let te = test_engine(
        EngineConfig::default(),
        vec![step("wipe", WorkerKind::CodeExecution, "Run sudo rm -rf /var/cache/build")],
        &[exec.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Clean up", None).await.unwrap();
    orch.execute_run(&run.id).await.unwrap();
    let approval = orch.list_pending_approvals("user-1").await.unwrap().remove(0);

    let cancelled = orch.cancel_run(&run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Terminated);
    assert_eq!(cancelled.termination_reason, Some(TerminationReason::UserCancelled));
    assert!(orch.list_pending_approvals("user-1").await.unwrap().is_empty());
    let withdrawn = te.engine.approvals.get(&approval.id).await.unwrap().unwrap();
    assert_eq!(withdrawn.status, ApprovalStatus::Rejected);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(orch.cancel_run(&run.id).await.is_err());
    assert!(orch.respond_to_approval(&approval.id, true, None).await.is_err());
    assert_eq!(exec.calls(), 0);
}

#[tokio::test]
async fn cancel_during_dispatch_discards_results() {
    let slow = Arc::new(ScriptedWorker::new(
        WorkerKind::Research,
        Reply::Slow(Duration::from_millis(300), json!({ "findings": ["late"] })),
    ));
    let te = test_engine(
        EngineConfig::default(),
        vec![
            step("look", WorkerKind::Research, "Collect benchmark numbers"),
            step_after("next", WorkerKind::Research, "Collect more numbers", &["look"]),
        ],
        &[slow.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();

    let (executed, cancelled) = tokio::join!(orch.execute_run(&run.id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.cancel_run(&run.id).await
    });
    assert_eq!(cancelled.unwrap().termination_reason, Some(TerminationReason::UserCancelled));
    assert_eq!(executed.unwrap().termination_reason, Some(TerminationReason::UserCancelled));
    assert_eq!(slow.calls(), 1);

    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.step("look").unwrap().result.is_none());
    assert_eq!(task.step("next").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn invalid_plan_fails_before_dispatch() {
    let worker = Arc::new(ScriptedWorker::new(WorkerKind::Research, findings()));
    let te = test_engine(
        EngineConfig::default(),
        vec![
            step_after("a", WorkerKind::Research, "one", &["b"]),
            step_after("b", WorkerKind::Research, "two", &["a"]),
        ],
        &[worker.clone()],
    );
    let orch = te.orchestrator();
    let (run, task) = orch.create_run("user-1", "Loop", None).await.unwrap();

    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::ValidationError));
    assert_eq!(worker.calls(), 0);
    let task = orch.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.failure.unwrap().starts_with("planning failed"));
}

#[tokio::test]
async fn missing_worker_fails_the_run() {
    let te = test_engine(
        EngineConfig::default(),
        vec![step("look", WorkerKind::Research, "Collect benchmark numbers")],
        &[],
    );
    let orch = te.orchestrator();
    let (run, _) = orch.create_run("user-1", "Benchmarks", None).await.unwrap();
    let done = orch.execute_run(&run.id).await.unwrap();
    assert_eq!(done.termination_reason, Some(TerminationReason::AgentError));
}
