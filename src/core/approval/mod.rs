//! Human-in-the-loop approval gate.
//!
//! Risk scoring lives in [`risk`]. This module owns the approval record and its
//! one-way lifecycle: `pending` moves once to `approved`, `rejected` or
//! `expired`, enforced with a compare-and-set on the stored status.

pub mod risk;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::errors::EngineError;
use crate::core::orchestrator::types::{Run, Step, Task};
use crate::core::store::{self, Store, keys};
use crate::core::workers::WorkerKind;

pub use risk::{ApprovalDecision, RiskAssessment, assess_risk, should_require_approval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// How long an approval at this level stays answerable.
    pub fn expiry(self) -> Duration {
        match self {
            RiskLevel::High => Duration::hours(24),
            RiskLevel::Medium => Duration::hours(8),
            RiskLevel::Low => Duration::hours(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    FileWrite,
    CodeExecution,
    ExternalApi,
    DataDeletion,
    Deployment,
    CostIncurring,
    General,
}

impl ApprovalType {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalType::FileWrite => "file_write",
            ApprovalType::CodeExecution => "code_execution",
            ApprovalType::ExternalApi => "external_api",
            ApprovalType::DataDeletion => "data_deletion",
            ApprovalType::Deployment => "deployment",
            ApprovalType::CostIncurring => "cost_incurring",
            ApprovalType::General => "general",
        }
    }

    pub fn base_risk(self) -> u32 {
        match self {
            ApprovalType::FileWrite => 15,
            ApprovalType::CodeExecution => 25,
            ApprovalType::ExternalApi => 20,
            ApprovalType::DataDeletion => 30,
            ApprovalType::Deployment => 30,
            ApprovalType::CostIncurring => 10,
            ApprovalType::General => 10,
        }
    }

    pub fn for_worker(kind: WorkerKind) -> Option<Self> {
        match kind {
            WorkerKind::CodeExecution => Some(ApprovalType::CodeExecution),
            WorkerKind::FileOperations => Some(ApprovalType::FileWrite),
            WorkerKind::ApiIntegration => Some(ApprovalType::ExternalApi),
            WorkerKind::Deployment => Some(ApprovalType::Deployment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub auto_approve_enabled: bool,
    /// Highest level the policy may auto-approve. `high` is never auto-approved.
    pub max_auto_approve_level: RiskLevel,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_enabled: true,
            max_auto_approve_level: RiskLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPreview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<String>>,
}

fn string_list(value: Option<&Value>, object_keys: &[&str]) -> Option<Vec<String>> {
    let items: Vec<String> = match value? {
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => {
                    let parts: Vec<&str> = object_keys
                        .iter()
                        .filter_map(|k| map.get(*k).and_then(|v| v.as_str()))
                        .collect();
                    (!parts.is_empty()).then(|| parts.join(" "))
                }
                _ => None,
            })
            .collect(),
        _ => return None,
    };
    (!items.is_empty()).then_some(items)
}

impl ApprovalPreview {
    /// Pull files, commands and API calls out of a prior worker result. An
    /// `outputs` sub-object takes precedence over top-level fields.
    pub fn extract(result: &Value) -> Self {
        let source = match result.get("outputs") {
            Some(outputs @ Value::Object(_)) => outputs,
            _ => result,
        };
        let first = |names: &[&str], object_keys: &[&str]| {
            names
                .iter()
                .find_map(|n| string_list(source.get(*n), object_keys))
        };
        Self {
            files: first(&["files", "files_modified", "files_created", "paths"], &["path"]),
            commands: first(&["commands", "command"], &["command", "cmd"]),
            api_calls: first(&["api_calls", "requests"], &["method", "url"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_none() && self.commands.is_none() && self.api_calls.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub step_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    pub description: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub preview: ApprovalPreview,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

pub struct ApprovalService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: ApprovalPolicy,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, policy: ApprovalPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn should_require_approval(
        &self,
        step: &Step,
        task: &Task,
        prior_result: Option<&Value>,
    ) -> ApprovalDecision {
        should_require_approval(step, task, prior_result, &self.policy)
    }

    pub async fn create_approval_request(
        &self,
        run: &Run,
        step: &Step,
        assessment: &RiskAssessment,
        prior_result: Option<&Value>,
    ) -> Result<Approval> {
        let now = self.clock.now();
        let mut description = step.description.clone();
        if !assessment.factors.is_empty() {
            description.push_str("\n\nRisk factors:");
            for (i, factor) in assessment.factors.iter().enumerate() {
                description.push_str(&format!("\n{}. {}", i + 1, factor));
            }
        }

        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            step_id: step.id.clone(),
            user_id: run.user_id.clone(),
            approval_type: assessment.approval_type,
            description,
            risk_level: assessment.level,
            preview: prior_result.map(ApprovalPreview::extract).unwrap_or_default(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + assessment.level.expiry(),
            responded_at: None,
            notes: None,
        };

        store::save(self.store.as_ref(), &keys::approval(&approval.id), &approval).await?;
        self.store
            .set(
                &keys::approval_for_step(&run.id, &step.id),
                None,
                Value::String(approval.id.clone()),
            )
            .await?;
        self.store
            .zadd(
                keys::PENDING_APPROVALS,
                &approval.id,
                approval.expires_at.timestamp_millis() as f64,
            )
            .await?;

        info!(
            approval_id = %approval.id,
            run_id = %run.id,
            step_id = %step.id,
            "Approval requested at {} risk (score {})",
            assessment.level.as_str(),
            assessment.score
        );
        Ok(approval)
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<Approval>> {
        store::load(self.store.as_ref(), &keys::approval(approval_id)).await
    }

    pub async fn approval_for_step(&self, run_id: &str, step_id: &str) -> Result<Option<Approval>> {
        let Some(id) = self
            .store
            .get(&keys::approval_for_step(run_id, step_id), None)
            .await?
        else {
            return Ok(None);
        };
        match id.as_str() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Move a pending approval to `to`. Returns false if it was no longer pending.
    async fn transition(&self, approval_id: &str, to: ApprovalStatus) -> Result<bool> {
        let moved = self
            .store
            .compare_and_set(
                &keys::approval(approval_id),
                "status",
                &Value::String(ApprovalStatus::Pending.as_str().into()),
                Value::String(to.as_str().into()),
            )
            .await?;
        if moved {
            self.store.zrem(keys::PENDING_APPROVALS, approval_id).await?;
        }
        Ok(moved)
    }

    /// Record a human decision. Answering after `expires_at` expires the
    /// approval instead and reports it as no longer pending.
    pub async fn respond(
        &self,
        approval_id: &str,
        approved: bool,
        notes: Option<String>,
    ) -> Result<Approval> {
        let Some(current) = self.get(approval_id).await? else {
            return Err(EngineError::not_found("approval", approval_id).into());
        };
        let now = self.clock.now();

        if current.status == ApprovalStatus::Pending && now >= current.expires_at {
            self.transition(approval_id, ApprovalStatus::Expired).await?;
            return Err(EngineError::ApprovalNotPending {
                id: approval_id.to_string(),
                status: ApprovalStatus::Expired.as_str().to_string(),
            }
            .into());
        }

        let to = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        if !self.transition(approval_id, to).await? {
            let status = self
                .store
                .get(&keys::approval(approval_id), Some("status"))
                .await?
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| current.status.as_str().to_string());
            return Err(EngineError::ApprovalNotPending {
                id: approval_id.to_string(),
                status,
            }
            .into());
        }

        let key = keys::approval(approval_id);
        self.store
            .set(&key, Some("responded_at"), serde_json::to_value(now)?)
            .await?;
        if let Some(notes) = &notes {
            self.store
                .set(&key, Some("notes"), Value::String(notes.clone()))
                .await?;
        }
        info!(approval_id, "Approval {}", to.as_str());

        Ok(Approval {
            status: to,
            responded_at: Some(now),
            notes,
            ..current
        })
    }

    /// Expire every pending approval whose deadline has passed.
    pub async fn expire_due(&self) -> Result<Vec<Approval>> {
        let now = self.clock.now();
        let due = self
            .store
            .zrange_by_score(
                keys::PENDING_APPROVALS,
                f64::MIN,
                now.timestamp_millis() as f64,
                0,
                usize::MAX,
            )
            .await?;

        let mut expired = Vec::new();
        for (id, _) in due {
            if !self.transition(&id, ApprovalStatus::Expired).await? {
                // Answered concurrently, or the document is gone.
                self.store.zrem(keys::PENDING_APPROVALS, &id).await?;
                continue;
            }
            match self.get(&id).await? {
                Some(approval) => {
                    warn!(approval_id = %id, run_id = %approval.run_id, "Approval expired");
                    expired.push(approval);
                }
                None => warn!(approval_id = %id, "Expired approval has no document"),
            }
        }
        Ok(expired)
    }

    pub async fn list_pending(&self, user_id: Option<&str>) -> Result<Vec<Approval>> {
        let ids = self
            .store
            .zrange_by_score(keys::PENDING_APPROVALS, f64::MIN, f64::MAX, 0, usize::MAX)
            .await?;
        let mut out = Vec::new();
        for (id, _) in ids {
            if let Some(approval) = self.get(&id).await?
                && approval.status == ApprovalStatus::Pending
                && user_id.is_none_or(|u| u == approval.user_id)
            {
                out.push(approval);
            }
        }
        Ok(out)
    }
}
