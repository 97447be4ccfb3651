use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::activity::ActivityLog;
use crate::core::approval::ApprovalService;
use crate::core::budget::BudgetGuard;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{DB_FILE, EngineConfig};
use crate::core::contract::ContractEnforcer;
use crate::core::memory::{DocumentMemory, LongTermMemory};
use crate::core::orchestrator::plan::{Planner, SingleStepPlanner, WorkflowPlanner};
use crate::core::scheduler::Scheduler;
use crate::core::store::{SqliteStore, Store};
use crate::core::workers::{ContractTable, RemoteWorkflowClient, WorkerKind, WorkerRegistry};

/// Every engine component, wired once and shared behind an `Arc`.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub approvals: ApprovalService,
    pub budgets: BudgetGuard,
    pub contracts: ContractEnforcer,
    pub activity: ActivityLog,
    pub scheduler: Scheduler,
    pub workers: WorkerRegistry,
    pub planner: Arc<dyn Planner>,
    pub memory: Arc<dyn LongTermMemory>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        workers: WorkerRegistry,
        planner: Arc<dyn Planner>,
    ) -> Self {
        let contracts = Arc::new(ContractTable::from_overrides(&config.worker_overrides()));
        Self {
            approvals: ApprovalService::new(store.clone(), clock.clone(), config.approval.clone()),
            budgets: BudgetGuard::new(store.clone(), clock.clone(), &config.budget),
            contracts: ContractEnforcer::new(store.clone(), clock.clone(), contracts),
            activity: ActivityLog::new(store.clone(), clock.clone()),
            scheduler: Scheduler::new(store.clone(), clock.clone(), config.scheduler.due_batch),
            memory: Arc::new(DocumentMemory::new(store.clone())),
            workers,
            planner,
            config,
            store,
            clock,
        }
    }

    /// Open the SQLite store under `data_dir` and wire the remote workflow
    /// client when a base url is configured.
    pub async fn open(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(data_dir.join(DB_FILE)).await?);

        let remote = if config.remote.is_enabled() {
            match RemoteWorkflowClient::new(&config.remote) {
                Ok(client) => {
                    info!("Remote workflows at {}", config.remote.base_url);
                    Some(client)
                }
                Err(e) => {
                    warn!("Remote workflows disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let planner: Arc<dyn Planner> = match &remote {
            Some(client) => Arc::new(WorkflowPlanner::new(client.clone(), WorkerKind::Research)),
            None => Arc::new(SingleStepPlanner {
                worker: WorkerKind::Research,
            }),
        };

        Ok(Self::new(
            config,
            store,
            Arc::new(SystemClock),
            WorkerRegistry::new(remote),
            planner,
        ))
    }
}
