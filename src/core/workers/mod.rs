//! Specialist worker contract and dispatch.
//!
//! Workers are external collaborators. The engine knows them only through the
//! [`Worker`] trait and a [`WorkerContract`] per [`WorkerKind`], resolved once at
//! startup. A kind with no in-process worker falls back to the remote workflow
//! client when one is configured.

pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::approval::ApprovalType;
use crate::core::config::WorkerOverride;
use crate::core::errors::{FailureKind, StepFailure};

pub use remote::RemoteWorkflowClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Research,
    Analysis,
    CodeGeneration,
    CodeExecution,
    FileOperations,
    ApiIntegration,
    DocumentProcessing,
    Writing,
    Deployment,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 9] = [
        WorkerKind::Research,
        WorkerKind::Analysis,
        WorkerKind::CodeGeneration,
        WorkerKind::CodeExecution,
        WorkerKind::FileOperations,
        WorkerKind::ApiIntegration,
        WorkerKind::DocumentProcessing,
        WorkerKind::Writing,
        WorkerKind::Deployment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Research => "research",
            WorkerKind::Analysis => "analysis",
            WorkerKind::CodeGeneration => "code_generation",
            WorkerKind::CodeExecution => "code_execution",
            WorkerKind::FileOperations => "file_operations",
            WorkerKind::ApiIntegration => "api_integration",
            WorkerKind::DocumentProcessing => "document_processing",
            WorkerKind::Writing => "writing",
            WorkerKind::Deployment => "deployment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        WorkerKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
    }

    /// Kinds that touch the outside world directly. Each adds a fixed weight to risk scores.
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            WorkerKind::CodeExecution
                | WorkerKind::FileOperations
                | WorkerKind::ApiIntegration
                | WorkerKind::Deployment
        )
    }

    /// Remote workflow name used by the webhook fallback.
    pub fn workflow_name(self) -> String {
        format!("{}-worker", self.as_str().replace('_', "-"))
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerContract {
    pub kind: WorkerKind,
    pub required_outputs: Vec<String>,
    #[serde(default)]
    pub optional_outputs: Vec<String>,
    /// Required outputs whose absence fails the step instead of only warning.
    #[serde(default)]
    pub mandatory_outputs: Vec<String>,
    pub max_retries: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub approval_type: Option<ApprovalType>,
    #[serde(default)]
    pub always_require_approval: bool,
}

impl WorkerContract {
    fn new(kind: WorkerKind, required: &[&str], optional: &[&str], max_retries: u32, timeout_secs: u64) -> Self {
        Self {
            kind,
            required_outputs: required.iter().map(|s| s.to_string()).collect(),
            optional_outputs: optional.iter().map(|s| s.to_string()).collect(),
            mandatory_outputs: Vec::new(),
            max_retries,
            timeout_ms: timeout_secs * 1_000,
            approval_type: None,
            always_require_approval: false,
        }
    }

    pub fn default_for(kind: WorkerKind) -> Self {
        match kind {
            WorkerKind::Research => {
                Self::new(kind, &["findings"], &["sources", "summary"], 3, 120)
            }
            WorkerKind::Analysis => {
                Self::new(kind, &["analysis"], &["insights", "metrics"], 3, 120)
            }
            WorkerKind::CodeGeneration => Self::new(
                kind,
                &["code"],
                &["files", "language", "explanation"],
                2,
                180,
            ),
            WorkerKind::CodeExecution => Self {
                approval_type: Some(ApprovalType::CodeExecution),
                ..Self::new(kind, &["stdout", "exit_code"], &["stderr"], 1, 60)
            },
            WorkerKind::FileOperations => Self {
                approval_type: Some(ApprovalType::FileWrite),
                ..Self::new(kind, &["files"], &["diff"], 2, 60)
            },
            WorkerKind::ApiIntegration => Self {
                approval_type: Some(ApprovalType::ExternalApi),
                ..Self::new(kind, &["response"], &["status_code"], 3, 60)
            },
            WorkerKind::DocumentProcessing => {
                Self::new(kind, &["content"], &["metadata"], 2, 120)
            }
            WorkerKind::Writing => Self::new(kind, &["content"], &["outline"], 2, 120),
            WorkerKind::Deployment => Self {
                approval_type: Some(ApprovalType::Deployment),
                always_require_approval: true,
                ..Self::new(kind, &["deployment_id"], &["url"], 1, 300)
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn apply(&mut self, o: &WorkerOverride) {
        if let Some(v) = o.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = o.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = &o.required_outputs {
            self.required_outputs = v.clone();
        }
        if let Some(v) = &o.mandatory_outputs {
            self.mandatory_outputs = v.clone();
        }
        if let Some(v) = o.always_require_approval {
            self.always_require_approval = v;
        }
    }
}

/// Contracts for every worker kind, fixed after startup.
#[derive(Debug, Clone)]
pub struct ContractTable {
    contracts: HashMap<WorkerKind, WorkerContract>,
}

impl ContractTable {
    pub fn from_overrides(overrides: &HashMap<WorkerKind, WorkerOverride>) -> Self {
        let contracts = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let mut contract = WorkerContract::default_for(kind);
                if let Some(o) = overrides.get(&kind) {
                    contract.apply(o);
                }
                (kind, contract)
            })
            .collect();
        Self { contracts }
    }

    pub fn get(&self, kind: WorkerKind) -> &WorkerContract {
        // Every kind is inserted in from_overrides.
        &self.contracts[&kind]
    }
}

impl Default for ContractTable {
    fn default() -> Self {
        Self::from_overrides(&HashMap::new())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerContext {
    pub task_id: String,
    pub step_id: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub success: bool,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn execute(&self, inputs: &str, context: &WorkerContext) -> anyhow::Result<WorkerOutput>;
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Succeeded(WorkerOutput),
    Failed {
        failure: StepFailure,
        tokens_used: u64,
        duration_ms: u64,
    },
}

impl DispatchOutcome {
    fn failed(kind: FailureKind, message: impl Into<String>, tokens_used: u64, started: Instant) -> Self {
        DispatchOutcome::Failed {
            failure: StepFailure::new(kind, message),
            tokens_used,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct WorkerRegistry {
    workers: HashMap<WorkerKind, Arc<dyn Worker>>,
    remote: Option<RemoteWorkflowClient>,
}

impl WorkerRegistry {
    pub fn new(remote: Option<RemoteWorkflowClient>) -> Self {
        Self {
            workers: HashMap::new(),
            remote,
        }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        info!("Registered worker: {}", worker.kind());
        self.workers.insert(worker.kind(), worker);
    }

    pub fn has_local(&self, kind: WorkerKind) -> bool {
        self.workers.contains_key(&kind)
    }

    /// Run one attempt against the local worker, or the remote workflow when
    /// none is registered, bounded by the contract timeout. Errors and
    /// `success=false` both map to `agent_error`.
    pub async fn dispatch(
        &self,
        contract: &WorkerContract,
        inputs: &str,
        context: &WorkerContext,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let kind = contract.kind;

        let local = self.workers.get(&kind);
        if local.is_none() && self.remote.is_none() {
            return DispatchOutcome::failed(
                FailureKind::AgentError,
                format!("no worker registered for {} and no remote workflow configured", kind),
                0,
                started,
            );
        }
        let attempt = async {
            match (local, &self.remote) {
                (Some(worker), _) => worker.execute(inputs, context).await,
                (None, Some(remote)) => remote
                    .invoke(kind, inputs, context)
                    .await
                    .map_err(anyhow::Error::from),
                (None, None) => Err(anyhow::anyhow!("no worker for {}", kind)),
            }
        };
        let result = match tokio::time::timeout(contract.timeout(), attempt).await {
            Ok(res) => res,
            Err(_) => {
                warn!(
                    "Worker {} timed out after {}ms on step {}",
                    kind, contract.timeout_ms, context.step_id
                );
                return DispatchOutcome::failed(
                    FailureKind::Timeout,
                    format!("worker {} timed out after {}ms", kind, contract.timeout_ms),
                    0,
                    started,
                );
            }
        };

        match result {
            Ok(mut output) if output.success => {
                if output.duration_ms == 0 {
                    output.duration_ms = started.elapsed().as_millis() as u64;
                }
                DispatchOutcome::Succeeded(output)
            }
            Ok(output) => {
                let message = output
                    .explanation
                    .clone()
                    .unwrap_or_else(|| format!("worker {} reported failure", kind));
                DispatchOutcome::failed(FailureKind::AgentError, message, output.tokens_used, started)
            }
            Err(e) => DispatchOutcome::failed(FailureKind::AgentError, e.to_string(), 0, started),
        }
    }
}
