//! Fixtures shared by component tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::clock::ManualClock;
use crate::core::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::orchestrator::Orchestrator;
use crate::core::orchestrator::plan::{Planner, StaticPlanner};
use crate::core::orchestrator::types::{Run, RunStatus, Step, StepStatus, Task, TaskStatus};
use crate::core::store::{SqliteStore, Store};
use crate::core::workers::{Worker, WorkerContext, WorkerKind, WorkerOutput, WorkerRegistry};

pub const TEST_EPOCH: &str = "2024-01-01T00:00:00Z";

pub fn step(id: &str, worker: WorkerKind, description: &str) -> Step {
    Step {
        id: id.to_string(),
        description: description.to_string(),
        worker,
        status: StepStatus::Pending,
        depends_on: Vec::new(),
        inputs: None,
        risk_level: None,
        require_approval: None,
        approval_type: None,
        allow_failure: false,
        result: None,
        error: None,
        approval_id: None,
        approval_granted: false,
        attempts: 0,
        started_at: None,
        finished_at: None,
    }
}

pub fn step_after(id: &str, worker: WorkerKind, description: &str, deps: &[&str]) -> Step {
    Step {
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..step(id, worker, description)
    }
}

pub fn task_with(project_id: &str, steps: Vec<Step>) -> Task {
    let now = DateTime::parse_from_rfc3339(TEST_EPOCH)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Task {
        id: "task-1".to_string(),
        project_id: project_id.to_string(),
        user_id: "user-1".to_string(),
        query: "test query".to_string(),
        status: TaskStatus::Pending,
        todo_list: steps,
        steps_completed: Vec::new(),
        artifacts: Vec::new(),
        failure: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn run_for(task: &Task, now: DateTime<Utc>) -> Run {
    Run {
        id: "run-1".to_string(),
        task_id: task.id.clone(),
        project_id: task.project_id.clone(),
        user_id: task.user_id.clone(),
        status: RunStatus::Created,
        termination_reason: None,
        created_at: now,
        updated_at: now,
        terminated_at: None,
    }
}

pub fn outputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// One scripted worker reaction.
#[derive(Debug, Clone)]
pub enum Reply {
    Succeed { outputs: Value, tokens: u64 },
    /// `success = false` with an explanation.
    Fail(String),
    /// `success = false` after spending tokens.
    FailSpending { message: String, tokens: u64 },
    /// `execute` returns an error.
    Error(String),
    /// Sleep before succeeding with the given outputs.
    Slow(Duration, Value),
}

impl Reply {
    pub fn ok(outputs: Value) -> Self {
        Reply::Succeed { outputs, tokens: 10 }
    }
}

/// Worker that plays back queued replies, then repeats `fallback`.
pub struct ScriptedWorker {
    kind: WorkerKind,
    script: std::sync::Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    seen: Arc<std::sync::Mutex<Vec<String>>>,
}

impl ScriptedWorker {
    pub fn new(kind: WorkerKind, fallback: Reply) -> Self {
        Self {
            kind,
            script: std::sync::Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn then(self, reply: Reply) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    /// Share a call log with other workers to observe dispatch order.
    pub fn with_log(mut self, log: Arc<std::sync::Mutex<Vec<String>>>) -> Self {
        self.seen = log;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn execute(&self, _inputs: &str, context: &WorkerContext) -> anyhow::Result<WorkerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(context.step_id.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Succeed { outputs: out, tokens } => Ok(WorkerOutput {
                success: true,
                outputs: outputs(out),
                tokens_used: tokens,
                duration_ms: 5,
                ..Default::default()
            }),
            Reply::Fail(msg) => Ok(WorkerOutput {
                success: false,
                explanation: Some(msg),
                ..Default::default()
            }),
            Reply::FailSpending { message, tokens } => Ok(WorkerOutput {
                success: false,
                explanation: Some(message),
                tokens_used: tokens,
                ..Default::default()
            }),
            Reply::Error(msg) => Err(anyhow::anyhow!(msg)),
            Reply::Slow(delay, out) => {
                tokio::time::sleep(delay).await;
                Ok(WorkerOutput {
                    success: true,
                    outputs: outputs(out),
                    tokens_used: 1,
                    ..Default::default()
                })
            }
        }
    }
}

/// Engine on an in-memory store with a pinned clock and a fixed plan.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn Store>,
}

impl TestEngine {
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.engine.clone())
    }
}

pub fn test_engine(
    config: EngineConfig,
    steps: Vec<Step>,
    workers: &[Arc<ScriptedWorker>],
) -> TestEngine {
    let clock = Arc::new(ManualClock::at(TEST_EPOCH));
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let mut registry = WorkerRegistry::new(None);
    for worker in workers {
        registry.register(worker.clone());
    }
    let planner: Arc<dyn Planner> = Arc::new(StaticPlanner::new(steps));
    let engine = Engine::new(config, store.clone(), clock.clone(), registry, planner);
    TestEngine {
        engine: Arc::new(engine),
        clock,
        store,
    }
}

/// Config with the approval gate switched to auto-approve up to medium risk
/// and fast retries.
pub fn permissive_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.approval.max_auto_approve_level = crate::core::approval::RiskLevel::Medium;
    config.remote.retry = crate::core::retry::RetryPolicy::none();
    config
}
