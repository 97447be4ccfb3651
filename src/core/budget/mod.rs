//! Multi-scope resource budgets.
//!
//! Each (scope, scope_id) pair owns one document holding a limit and a used
//! counter per resource kind. Admission goes through
//! [`Store::increment_bounded`], so the check and the write are a single
//! atomic step and parallel steps of one run cannot overshoot a limit.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::config::BudgetConfig;
use crate::core::store::{self, Store, keys};

pub const GLOBAL_SCOPE_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    LlmTokens,
    ApiCalls,
    ToolExecutions,
    WorkerInvocations,
    Embeddings,
    StorageBytes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::LlmTokens,
        ResourceKind::ApiCalls,
        ResourceKind::ToolExecutions,
        ResourceKind::WorkerInvocations,
        ResourceKind::Embeddings,
        ResourceKind::StorageBytes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::LlmTokens => "llm_tokens",
            ResourceKind::ApiCalls => "api_calls",
            ResourceKind::ToolExecutions => "tool_executions",
            ResourceKind::WorkerInvocations => "worker_invocations",
            ResourceKind::Embeddings => "embeddings",
            ResourceKind::StorageBytes => "storage_bytes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Run,
    User,
    Global,
}

impl BudgetScope {
    /// Order in which multi-scope operations are applied.
    pub const ORDER: [BudgetScope; 3] = [BudgetScope::Run, BudgetScope::User, BudgetScope::Global];

    pub fn as_str(self) -> &'static str {
        match self {
            BudgetScope::Run => "run",
            BudgetScope::User => "user",
            BudgetScope::Global => "global",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(BudgetScope::Run),
            "user" => Some(BudgetScope::User),
            "global" => Some(BudgetScope::Global),
            _ => None,
        }
    }

    /// Run and user budgets roll over daily; the global one never expires.
    pub fn lifetime(self) -> Option<Duration> {
        match self {
            BudgetScope::Run | BudgetScope::User => Some(Duration::hours(24)),
            BudgetScope::Global => None,
        }
    }

    pub fn default_limit(self, resource: ResourceKind) -> u64 {
        const MB: u64 = 1024 * 1024;
        const GB: u64 = 1024 * MB;
        let (run, user, global) = match resource {
            ResourceKind::LlmTokens => (100_000, 1_000_000, 10_000_000),
            ResourceKind::ApiCalls => (100, 1_000, 10_000),
            ResourceKind::ToolExecutions => (200, 2_000, 20_000),
            ResourceKind::WorkerInvocations => (50, 500, 5_000),
            ResourceKind::Embeddings => (1_000, 10_000, 100_000),
            ResourceKind::StorageBytes => (100 * MB, GB, 10 * GB),
        };
        match self {
            BudgetScope::Run => run,
            BudgetScope::User => user,
            BudgetScope::Global => global,
        }
    }
}

/// Config-level limit overrides for one scope. Unset fields keep the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitOverrides {
    pub llm_tokens: Option<u64>,
    pub api_calls: Option<u64>,
    pub tool_executions: Option<u64>,
    pub worker_invocations: Option<u64>,
    pub embeddings: Option<u64>,
    pub storage_bytes: Option<u64>,
}

impl LimitOverrides {
    fn get(&self, resource: ResourceKind) -> Option<u64> {
        match resource {
            ResourceKind::LlmTokens => self.llm_tokens,
            ResourceKind::ApiCalls => self.api_calls,
            ResourceKind::ToolExecutions => self.tool_executions,
            ResourceKind::WorkerInvocations => self.worker_invocations,
            ResourceKind::Embeddings => self.embeddings,
            ResourceKind::StorageBytes => self.storage_bytes,
        }
    }

    fn resolve(&self, scope: BudgetScope) -> BTreeMap<ResourceKind, u64> {
        ResourceKind::ALL
            .into_iter()
            .map(|r| (r, self.get(r).unwrap_or_else(|| scope.default_limit(r))))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub scope: BudgetScope,
    pub scope_id: String,
    pub limits: BTreeMap<ResourceKind, u64>,
    pub used: BTreeMap<ResourceKind, u64>,
    #[serde(default)]
    pub warned: Vec<ResourceKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceBudget {
    pub fn limit(&self, resource: ResourceKind) -> u64 {
        self.limits.get(&resource).copied().unwrap_or(0)
    }

    pub fn used(&self, resource: ResourceKind) -> u64 {
        self.used.get(&resource).copied().unwrap_or(0)
    }

    pub fn remaining(&self, resource: ResourceKind) -> u64 {
        self.limit(resource).saturating_sub(self.used(resource))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    /// Remaining headroom before this call's amount is applied.
    pub remaining: u64,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCheck {
    pub allowed: bool,
    pub denied_scope: Option<BudgetScope>,
    pub warnings: Vec<String>,
}

impl ScopeCheck {
    pub fn denial_message(&self, resource: ResourceKind, amount: u64) -> String {
        match self.denied_scope {
            Some(scope) => format!(
                "{} budget exhausted for {} (requested {})",
                scope.as_str(),
                resource.as_str(),
                amount
            ),
            None => String::new(),
        }
    }
}

/// The scope ids a run-level operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetSubject {
    pub run_id: String,
    pub user_id: String,
}

impl BudgetSubject {
    pub fn new(run_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
        }
    }

    fn scope_id(&self, scope: BudgetScope) -> &str {
        match scope {
            BudgetScope::Run => &self.run_id,
            BudgetScope::User => &self.user_id,
            BudgetScope::Global => GLOBAL_SCOPE_ID,
        }
    }
}

fn used_path(resource: ResourceKind) -> String {
    format!("used.{}", resource.as_str())
}

fn limit_path(resource: ResourceKind) -> String {
    format!("limits.{}", resource.as_str())
}

pub struct BudgetGuard {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    limits: HashMap<BudgetScope, BTreeMap<ResourceKind, u64>>,
    warn_ratio: f64,
}

impl BudgetGuard {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &BudgetConfig) -> Self {
        let limits = [
            (BudgetScope::Run, &config.run),
            (BudgetScope::User, &config.user),
            (BudgetScope::Global, &config.global),
        ]
        .into_iter()
        .map(|(scope, overrides)| (scope, overrides.resolve(scope)))
        .collect();
        Self {
            store,
            clock,
            limits,
            warn_ratio: config.warn_ratio,
        }
    }

    fn fresh_budget(&self, scope: BudgetScope, scope_id: &str) -> ResourceBudget {
        let now = self.clock.now();
        let limits = self
            .limits
            .get(&scope)
            .cloned()
            .unwrap_or_else(|| LimitOverrides::default().resolve(scope));
        ResourceBudget {
            scope,
            scope_id: scope_id.to_string(),
            used: ResourceKind::ALL.into_iter().map(|r| (r, 0)).collect(),
            limits,
            warned: Vec::new(),
            created_at: now,
            expires_at: scope.lifetime().map(|d| now + d),
        }
    }

    /// Load the budget, creating it on first use and rolling it over once expired.
    async fn ensure(&self, scope: BudgetScope, scope_id: &str) -> Result<ResourceBudget> {
        let key = keys::budget(scope.as_str(), scope_id);
        for _ in 0..5 {
            let Some(raw) = self.store.get(&key, None).await? else {
                let fresh = self.fresh_budget(scope, scope_id);
                if self
                    .store
                    .set_if_absent(&key, serde_json::to_value(&fresh)?)
                    .await?
                {
                    debug!("Created {} budget {}", scope.as_str(), scope_id);
                    return Ok(fresh);
                }
                // Lost a creation race; read the winner.
                continue;
            };
            let existing: ResourceBudget = serde_json::from_value(raw.clone())?;
            if !existing.expires_at.is_some_and(|at| self.clock.now() >= at) {
                return Ok(existing);
            }
            if let Some(fresh) = self.roll_over(scope, scope_id, &raw).await? {
                return Ok(fresh);
            }
        }
        Err(anyhow!("budget {} kept changing while loading", key))
    }

    /// Replace the expired document `seen` with a fresh period. Returns None
    /// when the stored document no longer matches `seen`, meaning another
    /// caller rolled it over or recorded usage first.
    async fn roll_over(&self, scope: BudgetScope, scope_id: &str, seen: &Value) -> Result<Option<ResourceBudget>> {
        let key = keys::budget(scope.as_str(), scope_id);
        let fresh = self.fresh_budget(scope, scope_id);
        if !self
            .store
            .compare_and_set(&key, "", seen, serde_json::to_value(&fresh)?)
            .await?
        {
            debug!("{} budget {} changed during rollover, re-reading", scope.as_str(), scope_id);
            return Ok(None);
        }
        info!(
            "{} budget {} expired, starting a new period",
            scope.as_str(),
            scope_id
        );
        Ok(Some(fresh))
    }

    /// Mark `resource` as warned. Returns true only for the caller that set it.
    async fn mark_warned(&self, scope: BudgetScope, scope_id: &str, resource: ResourceKind) -> Result<bool> {
        let key = keys::budget(scope.as_str(), scope_id);
        for _ in 0..5 {
            let current = self
                .store
                .get(&key, Some("warned"))
                .await?
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let mut warned: Vec<ResourceKind> = serde_json::from_value(current.clone())?;
            if warned.contains(&resource) {
                return Ok(false);
            }
            warned.push(resource);
            if self
                .store
                .compare_and_set(&key, "warned", &current, serde_json::to_value(&warned)?)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn maybe_warn(
        &self,
        budget: &ResourceBudget,
        resource: ResourceKind,
        projected: u64,
    ) -> Result<Option<String>> {
        let limit = budget.limit(resource);
        if limit == 0 || (projected as f64) < self.warn_ratio * limit as f64 {
            return Ok(None);
        }
        if budget.warned.contains(&resource)
            || !self.mark_warned(budget.scope, &budget.scope_id, resource).await?
        {
            return Ok(None);
        }
        let message = format!(
            "{} budget {} at {}/{} {} ({:.0}%)",
            budget.scope.as_str(),
            budget.scope_id,
            projected,
            limit,
            resource.as_str(),
            projected as f64 * 100.0 / limit as f64
        );
        warn!("{}", message);
        Ok(Some(message))
    }

    pub async fn can_use(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<BudgetCheck> {
        let budget = self.ensure(scope, scope_id).await?;
        let remaining = budget.remaining(resource);
        let allowed = amount <= remaining;
        let warning = if allowed {
            self.maybe_warn(&budget, resource, budget.used(resource) + amount)
                .await?
        } else {
            None
        };
        Ok(BudgetCheck {
            allowed,
            remaining,
            warning,
        })
    }

    /// Unconditionally add usage. Callers are expected to have asked `can_use` first.
    pub async fn record_usage(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<u64> {
        self.ensure(scope, scope_id).await?;
        let value = self
            .store
            .increment(
                &keys::budget(scope.as_str(), scope_id),
                &used_path(resource),
                i64::try_from(amount)?,
            )
            .await?;
        Ok(value.max(0) as u64)
    }

    /// Atomic check-and-record against a single scope.
    pub async fn try_consume(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<BudgetCheck> {
        let budget = self.ensure(scope, scope_id).await?;
        let update = self
            .store
            .increment_bounded(
                &keys::budget(scope.as_str(), scope_id),
                &used_path(resource),
                &limit_path(resource),
                amount,
            )
            .await?;
        if !update.applied {
            debug!(
                "{} budget {} denied {} {} (used {}/{})",
                scope.as_str(),
                scope_id,
                amount,
                resource.as_str(),
                update.value,
                update.limit
            );
            return Ok(BudgetCheck {
                allowed: false,
                remaining: update.limit.saturating_sub(update.value),
                warning: None,
            });
        }
        let warning = self.maybe_warn(&budget, resource, update.value).await?;
        Ok(BudgetCheck {
            allowed: true,
            remaining: update.limit.saturating_sub(update.value - amount),
            warning,
        })
    }

    /// Check every scope in run, user, global order without recording.
    pub async fn check_all_scopes(
        &self,
        subject: &BudgetSubject,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<ScopeCheck> {
        let mut warnings = Vec::new();
        for scope in BudgetScope::ORDER {
            let check = self
                .can_use(scope, subject.scope_id(scope), resource, amount)
                .await?;
            warnings.extend(check.warning);
            if !check.allowed {
                return Ok(ScopeCheck {
                    allowed: false,
                    denied_scope: Some(scope),
                    warnings,
                });
            }
        }
        Ok(ScopeCheck {
            allowed: true,
            denied_scope: None,
            warnings,
        })
    }

    /// Consume from run, user and global budgets. The first scope to deny
    /// blocks the whole operation and already-applied increments are undone.
    pub async fn consume_all_scopes(
        &self,
        subject: &BudgetSubject,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<ScopeCheck> {
        let mut applied: Vec<(BudgetScope, &str)> = Vec::new();
        let mut warnings = Vec::new();
        for scope in BudgetScope::ORDER {
            let scope_id = subject.scope_id(scope);
            let check = self.try_consume(scope, scope_id, resource, amount).await?;
            warnings.extend(check.warning);
            if !check.allowed {
                for (done_scope, done_id) in applied {
                    self.store
                        .increment(
                            &keys::budget(done_scope.as_str(), done_id),
                            &used_path(resource),
                            -i64::try_from(amount)?,
                        )
                        .await?;
                }
                return Ok(ScopeCheck {
                    allowed: false,
                    denied_scope: Some(scope),
                    warnings,
                });
            }
            applied.push((scope, scope_id));
        }
        Ok(ScopeCheck {
            allowed: true,
            denied_scope: None,
            warnings,
        })
    }

    /// Record usage that already happened in every scope, without a limit
    /// check. The returned check is denied when any scope is now past
    /// its limit, naming the first such scope.
    pub async fn record_all_scopes(
        &self,
        subject: &BudgetSubject,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<ScopeCheck> {
        let mut denied_scope = None;
        for scope in BudgetScope::ORDER {
            let scope_id = subject.scope_id(scope);
            let limit = self.ensure(scope, scope_id).await?.limit(resource);
            let used = self.record_usage(scope, scope_id, resource, amount).await?;
            if used > limit && denied_scope.is_none() {
                denied_scope = Some(scope);
            }
        }
        Ok(ScopeCheck {
            allowed: denied_scope.is_none(),
            denied_scope,
            warnings: Vec::new(),
        })
    }

    /// Give back usage admitted by `consume_all_scopes` that was never spent.
    pub async fn release_all_scopes(
        &self,
        subject: &BudgetSubject,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<()> {
        let delta = -i64::try_from(amount)?;
        for scope in BudgetScope::ORDER {
            self.store
                .increment(
                    &keys::budget(scope.as_str(), subject.scope_id(scope)),
                    &used_path(resource),
                    delta,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_budget(&self, scope: BudgetScope, scope_id: &str) -> Result<ResourceBudget> {
        self.ensure(scope, scope_id).await
    }

    pub async fn reset_budget(&self, scope: BudgetScope, scope_id: &str) -> Result<ResourceBudget> {
        let fresh = self.fresh_budget(scope, scope_id);
        store::save(
            self.store.as_ref(),
            &keys::budget(scope.as_str(), scope_id),
            &fresh,
        )
        .await?;
        info!("Reset {} budget {}", scope.as_str(), scope_id);
        Ok(fresh)
    }
}
