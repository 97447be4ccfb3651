//! Weighted risk scoring for a step about to be dispatched.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use super::{ApprovalPolicy, ApprovalPreview, ApprovalType, RiskLevel};
use crate::core::orchestrator::types::{Step, Task};

const HIGH_RISK_WORKER_WEIGHT: u32 = 20;
const SENSITIVE_PATH_WEIGHT: u32 = 15;
const DESTRUCTIVE_SHELL_WEIGHT: u32 = 20;
const PIPE_TO_SHELL_WEIGHT: u32 = 20;
const SUDO_WEIGHT: u32 = 20;
const PACKAGE_INSTALL_WEIGHT: u32 = 15;
const DESTRUCTIVE_API_WEIGHT: u32 = 10;
const RISKY_CODE_WEIGHT: u32 = 15;
const MANY_FILES_WEIGHT: u32 = 10;
const MANY_FILES_THRESHOLD: usize = 10;
const PRODUCTION_WEIGHT: u32 = 30;

pub const HIGH_THRESHOLD: u32 = 50;
pub const MEDIUM_THRESHOLD: u32 = 20;

struct DescriptionPattern {
    label: &'static str,
    weight: u32,
    regex: Regex,
}

fn pattern(label: &'static str, weight: u32, re: &str) -> DescriptionPattern {
    DescriptionPattern {
        label,
        weight,
        regex: Regex::new(re).expect("risk pattern is a valid regex"),
    }
}

static DESCRIPTION_PATTERNS: LazyLock<Vec<DescriptionPattern>> = LazyLock::new(|| {
    vec![
        pattern(
            "sensitive path",
            SENSITIVE_PATH_WEIGHT,
            r"(?i)(/etc/(passwd|shadow|sudoers)|~?/\.ssh\b|\bid_(rsa|ed25519)\b|\.env\b|\.pem\b|\bcredentials?\b|\bsecrets?\b)",
        ),
        pattern(
            "destructive shell command",
            DESTRUCTIVE_SHELL_WEIGHT,
            r"(?i)(\brm\s+-[a-z]*[rf][a-z]*\b|\bmkfs(\.\w+)?\b|\bdd\s+if=|\bshred\b|\bchmod\s+(-R\s+)?777\b|\bkill\s+-9\b|:\(\)\s*\{)",
        ),
        pattern(
            "pipe to shell",
            PIPE_TO_SHELL_WEIGHT,
            r"(?i)\b(curl|wget)\b[^|\n]*\|\s*(sudo\s+)?(ba|z)?sh\b",
        ),
        pattern("privilege escalation", SUDO_WEIGHT, r"(?i)\bsudo\b"),
        pattern(
            "package install",
            PACKAGE_INSTALL_WEIGHT,
            r"(?i)\b(apt(-get)?|yum|dnf|brew|pip3?|npm|yarn|cargo|gem)\s+(install|add)\b",
        ),
        pattern(
            "destructive api call",
            DESTRUCTIVE_API_WEIGHT,
            r"(\bDELETE\s+/|(?i)\b(drop\s+(table|database)|truncate\s+table|purge|revoke)\b)",
        ),
    ]
});

static RISKY_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\beval\s*\(|\bexec\s*\(|os\.system|subprocess\.|child_process|shell\s*=\s*True|rm\s+-rf|__import__|Runtime\.getRuntime)",
    )
    .expect("risky code pattern is a valid regex")
});

static PRODUCTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[-_.:/])(prod|production|live)($|[-_.:/])")
        .expect("production pattern is a valid regex")
});

static TYPE_HINTS: LazyLock<Vec<(ApprovalType, Regex)>> = LazyLock::new(|| {
    let hint = |t: ApprovalType, re: &str| {
        (t, Regex::new(re).expect("approval type pattern is a valid regex"))
    };
    vec![
        hint(ApprovalType::Deployment, r"(?i)\b(deploy|release|rollout|publish)\w*\b"),
        hint(
            ApprovalType::DataDeletion,
            r"(?i)\b(delete|remove|drop|truncate|purge|wipe)\w*\b",
        ),
        hint(
            ApprovalType::CodeExecution,
            r"(?i)(\b(run|execute|sudo|bash|shell|script)\b|\b(apt(-get)?|pip3?|npm)\s)",
        ),
        hint(ApprovalType::ExternalApi, r"(?i)\b(api|webhook|http|endpoint|post request)\b"),
        hint(ApprovalType::FileWrite, r"(?i)\b(write|save|create|modify|edit)\b.*\bfiles?\b"),
        hint(ApprovalType::CostIncurring, r"(?i)\b(purchase|pay|buy|subscribe|billing)\b"),
    ]
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub approval_type: ApprovalType,
    pub factors: Vec<String>,
    /// Factors that added score, not counting the approval type's base.
    #[serde(default)]
    pub signals: usize,
    pub requires_manual_approval: bool,
    pub auto_approvable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub required: bool,
    pub reason: String,
    pub assessment: RiskAssessment,
}

pub fn level_for_score(score: u32) -> RiskLevel {
    if score >= HIGH_THRESHOLD {
        RiskLevel::High
    } else if score >= MEDIUM_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Approval type for a step: the explicit hint, then keywords in the
/// description, then the worker's own default.
pub fn resolve_approval_type(step: &Step) -> ApprovalType {
    if let Some(t) = step.approval_type {
        return t;
    }
    TYPE_HINTS
        .iter()
        .find(|(_, re)| re.is_match(&step.description))
        .map(|(t, _)| *t)
        .or_else(|| ApprovalType::for_worker(step.worker))
        .unwrap_or(ApprovalType::General)
}

pub fn assess_risk(
    step: &Step,
    task: &Task,
    prior_result: Option<&Value>,
    policy: &ApprovalPolicy,
) -> RiskAssessment {
    let mut score = 0;
    let mut factors = Vec::new();

    if step.worker.is_high_risk() {
        score += HIGH_RISK_WORKER_WEIGHT;
        factors.push(format!(
            "high-risk worker {} (+{})",
            step.worker, HIGH_RISK_WORKER_WEIGHT
        ));
    }

    let approval_type = resolve_approval_type(step);
    let base = approval_type.base_risk();
    score += base;
    factors.push(format!("{} operation (+{})", approval_type.as_str(), base));

    for p in DESCRIPTION_PATTERNS.iter() {
        for m in p.regex.find_iter(&step.description) {
            score += p.weight;
            factors.push(format!("{} `{}` (+{})", p.label, m.as_str().trim(), p.weight));
        }
    }

    if let Some(prior) = prior_result {
        let text = prior.to_string();
        if RISKY_CODE.is_match(&text) {
            score += RISKY_CODE_WEIGHT;
            factors.push(format!("prior result contains risky code (+{})", RISKY_CODE_WEIGHT));
        }
        let files = ApprovalPreview::extract(prior).files.map(|f| f.len()).unwrap_or(0);
        if files > MANY_FILES_THRESHOLD {
            score += MANY_FILES_WEIGHT;
            factors.push(format!("touches {} files (+{})", files, MANY_FILES_WEIGHT));
        }
    }

    if PRODUCTION_MARKER.is_match(&task.project_id) {
        score += PRODUCTION_WEIGHT;
        factors.push(format!(
            "production project {} (+{})",
            task.project_id, PRODUCTION_WEIGHT
        ));
    }

    // The approval type entry is always present and is not a signal.
    let signals = factors.len() - 1;
    let mut level = level_for_score(score);
    if let Some(declared) = step.risk_level
        && declared > level
    {
        factors.push(format!("declared risk level {}", declared.as_str()));
        level = declared;
    }

    RiskAssessment {
        score,
        level,
        approval_type,
        requires_manual_approval: score >= MEDIUM_THRESHOLD || signals > 2,
        auto_approvable: score < MEDIUM_THRESHOLD && policy.auto_approve_enabled,
        factors,
        signals,
    }
}

/// Decide whether the step must wait for a human.
///
/// An explicit `require_approval = true` always wins. High risk always
/// requires approval, even when the step opts out with `require_approval =
/// false`. Below high, an explicit opt-out or the auto-approval ceiling skips
/// the gate.
pub fn should_require_approval(
    step: &Step,
    task: &Task,
    prior_result: Option<&Value>,
    policy: &ApprovalPolicy,
) -> ApprovalDecision {
    let assessment = assess_risk(step, task, prior_result, policy);
    let (required, reason) = if step.require_approval == Some(true) {
        (true, "step explicitly requires approval".to_string())
    } else if assessment.level == RiskLevel::High {
        (true, format!("high risk (score {})", assessment.score))
    } else if step.require_approval == Some(false) {
        (false, "step explicitly skips approval".to_string())
    } else if policy.auto_approve_enabled && assessment.level <= policy.max_auto_approve_level {
        (
            false,
            format!("auto-approved at {} risk", assessment.level.as_str()),
        )
    } else {
        (
            true,
            format!(
                "{} risk exceeds auto-approval ceiling",
                assessment.level.as_str()
            ),
        )
    };
    ApprovalDecision {
        required,
        reason,
        assessment,
    }
}
