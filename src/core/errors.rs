use serde::{Deserialize, Serialize};

/// Why a single step did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BudgetExhausted,
    AgentError,
    Timeout,
    ValidationError,
    ApprovalRejected,
    ApprovalTimeout,
    DependencyFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::BudgetExhausted => "budget_exhausted",
            FailureKind::AgentError => "agent_error",
            FailureKind::Timeout => "timeout",
            FailureKind::ValidationError => "validation_error",
            FailureKind::ApprovalRejected => "approval_rejected",
            FailureKind::ApprovalTimeout => "approval_timeout",
            FailureKind::DependencyFailed => "dependency_failed",
        }
    }

    /// Transient failures go back through the retry ceiling; policy denials never do.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::AgentError | FailureKind::Timeout)
    }

    pub fn termination_reason(self) -> TerminationReason {
        match self {
            FailureKind::BudgetExhausted => TerminationReason::BudgetExhausted,
            FailureKind::AgentError => TerminationReason::AgentError,
            FailureKind::Timeout => TerminationReason::Timeout,
            FailureKind::ValidationError => TerminationReason::ValidationError,
            FailureKind::ApprovalRejected => TerminationReason::ApprovalRejected,
            FailureKind::ApprovalTimeout => TerminationReason::ApprovalTimeout,
            FailureKind::DependencyFailed => TerminationReason::DependencyFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    UserCancelled,
    ApprovalRejected,
    ApprovalTimeout,
    BudgetExhausted,
    RateLimited,
    Timeout,
    MaxRetries,
    AgentError,
    ValidationError,
    DependencyFailed,
    ConflictUnresolved,
    CircuitBreaker,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::UserCancelled => "user_cancelled",
            TerminationReason::ApprovalRejected => "approval_rejected",
            TerminationReason::ApprovalTimeout => "approval_timeout",
            TerminationReason::BudgetExhausted => "budget_exhausted",
            TerminationReason::RateLimited => "rate_limited",
            TerminationReason::Timeout => "timeout",
            TerminationReason::MaxRetries => "max_retries",
            TerminationReason::AgentError => "agent_error",
            TerminationReason::ValidationError => "validation_error",
            TerminationReason::DependencyFailed => "dependency_failed",
            TerminationReason::ConflictUnresolved => "conflict_unresolved",
            TerminationReason::CircuitBreaker => "circuit_breaker",
        }
    }
}

/// Rejected plan shapes. Raised while building a task's step graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("duplicate step id `{0}`")]
    DuplicateStep(String),
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle through steps: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("plan output is not a valid step list: {0}")]
    Unparseable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("approval `{id}` is already {status}")]
    ApprovalNotPending { id: String, status: String },
    #[error("run `{0}` is already terminated")]
    RunTerminated(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}
