mod components;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

pub use components::{ActivityAggregation, ApprovalSweeper, ScheduledRuns};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleState {
    Init,
    RegisterJobs,
    Ready,
    Shutdown,
}

/// A long-lived daemon part. Components get the shared job scheduler when
/// they start so periodic work rides on one timer.
#[async_trait::async_trait]
pub trait LifecycleComponent {
    fn name(&self) -> &'static str;

    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self, _scheduler: &JobScheduler) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle phase: init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle phase: register jobs");
        self.state = LifecycleState::RegisterJobs;
        for comp in &self.components {
            let mut comp = comp.lock().await;
            comp.on_start(&self.scheduler).await?;
            info!("Component '{}' started", comp.name());
        }

        info!("Lifecycle phase: ready (starting job scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Stop components in reverse attach order, then the job scheduler.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle phase: shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            let mut comp = comp.lock().await;
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component '{}' shutdown error: {}", comp.name(), e);
            }
        }
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Job scheduler shutdown error: {}", e);
        }
        Ok(())
    }
}
