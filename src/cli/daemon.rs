use anyhow::Result;
use console::style;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::CliContext;
use crate::core::lifecycle::{ActivityAggregation, ApprovalSweeper, LifecycleManager, ScheduledRuns};
use crate::core::terminal::{GuideSection, print_warn};

/// Run the background services until Ctrl+C.
pub async fn run_daemon(ctx: &CliContext) -> Result<()> {
    let engine = ctx.orchestrator.engine().clone();
    let config = &engine.config;

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ActivityAggregation::new(&ctx.orchestrator))));
    lifecycle.attach(Arc::new(Mutex::new(ApprovalSweeper::new(
        ctx.orchestrator.clone(),
        config.scheduler.approval_sweep_cron.clone(),
    ))));
    if config.scheduler.enabled {
        lifecycle.attach(Arc::new(Mutex::new(ScheduledRuns::new(
            ctx.orchestrator.clone(),
            config.scheduler.tick_cron.clone(),
        ))));
    } else {
        print_warn("Scheduler disabled in config; scheduled tasks will not fire.");
    }

    lifecycle.start().await?;

    GuideSection::new("Daemon")
        .status("Status", &style("RUNNING").green().bold().to_string())
        .status("PID", &std::process::id().to_string())
        .status("Data", &ctx.data_dir.display().to_string())
        .status("Scheduler tick", &config.scheduler.tick_cron)
        .status("Approval sweep", &config.scheduler.approval_sweep_cron)
        .blank()
        .info(&format!("Logs go to {}", style("switchyard.log").cyan()))
        .info(&format!("Press {} to stop.", style("Ctrl+C").bold().yellow()))
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    Ok(())
}
