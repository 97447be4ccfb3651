//! Step-level retry accounting and output-contract validation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::orchestrator::types::Step;
use crate::core::store::{self, Store, keys};
use crate::core::workers::{ContractTable, WorkerContract, WorkerKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAccount {
    pub task_id: String,
    pub step_id: String,
    pub worker: WorkerKind,
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseExitReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// A missing output is marked mandatory by the contract.
    pub fatal: bool,
}

pub struct ContractEnforcer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    contracts: Arc<ContractTable>,
}

impl ContractEnforcer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, contracts: Arc<ContractTable>) -> Self {
        Self {
            store,
            clock,
            contracts,
        }
    }

    pub fn contract(&self, kind: WorkerKind) -> &WorkerContract {
        self.contracts.get(kind)
    }

    pub async fn retry_account(&self, task_id: &str, step_id: &str) -> Result<Option<RetryAccount>> {
        store::load(self.store.as_ref(), &keys::retry(task_id, step_id)).await
    }

    /// True while the step has retries left under its worker's ceiling.
    pub async fn can_retry(&self, task_id: &str, step: &Step) -> Result<bool> {
        let ceiling = self.contract(step.worker).max_retries;
        Ok(match self.retry_account(task_id, &step.id).await? {
            None => ceiling > 0,
            Some(account) => account.attempts < account.max_retries,
        })
    }

    pub async fn record_retry(&self, task_id: &str, step: &Step, error: &str) -> Result<RetryAccount> {
        let now = self.clock.now();
        let mut account = match self.retry_account(task_id, &step.id).await? {
            Some(account) => account,
            None => RetryAccount {
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
                worker: step.worker,
                attempts: 0,
                max_retries: self.contract(step.worker).max_retries,
                last_error: None,
                last_attempt_at: now,
            },
        };
        account.attempts += 1;
        account.last_error = Some(error.to_string());
        account.last_attempt_at = now;
        store::save(self.store.as_ref(), &keys::retry(task_id, &step.id), &account).await?;
        warn!(
            task_id,
            step_id = %step.id,
            worker = %step.worker,
            "Retry {}/{} after error: {}",
            account.attempts,
            account.max_retries,
            error
        );
        Ok(account)
    }

    pub async fn clear_retries(&self, task_id: &str, step_id: &str) -> Result<bool> {
        self.store.delete(&keys::retry(task_id, step_id)).await
    }

    /// Check produced outputs against the worker's declared contract.
    pub fn validate_phase_exit(&self, kind: WorkerKind, outputs: &Map<String, Value>) -> PhaseExitReport {
        let contract = self.contract(kind);
        let mut report = PhaseExitReport::default();

        for name in &contract.required_outputs {
            let present = outputs.get(name).is_some_and(|v| !v.is_null());
            if !present {
                report.errors.push(format!("missing required output `{}`", name));
                if contract.mandatory_outputs.contains(name) {
                    report.fatal = true;
                }
            }
        }
        // Mandatory outputs need not also be listed as required.
        for name in &contract.mandatory_outputs {
            if !contract.required_outputs.contains(name)
                && !outputs.get(name).is_some_and(|v| !v.is_null())
            {
                report.errors.push(format!("missing mandatory output `{}`", name));
                report.fatal = true;
            }
        }
        for name in outputs.keys() {
            let declared = contract.required_outputs.contains(name)
                || contract.optional_outputs.contains(name)
                || contract.mandatory_outputs.contains(name);
            if !declared {
                report
                    .warnings
                    .push(format!("undeclared output `{}` from {}", name, kind));
            }
        }

        report.valid = report.errors.is_empty();
        if !report.valid {
            debug!("{} phase exit: {:?}", kind, report.errors);
        }
        report
    }
}
