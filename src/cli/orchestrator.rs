use anyhow::{Result, anyhow};
use console::style;

use super::{CliContext, flag_value, has_flag, positionals};
use crate::core::activity::daily_counts;
use crate::core::budget::{BudgetScope, GLOBAL_SCOPE_ID, ResourceBudget, ResourceKind};
use crate::core::errors::TerminationReason;
use crate::core::orchestrator::{Run, RunStatus, Task};
use crate::core::terminal::{
    GuideSection, print_error, print_info, print_success, print_waiting, print_warn, styled_status,
};

fn required_arg(args: &[String], what: &str, usage: &str) -> Result<String> {
    positionals(args, 2)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("missing {}. Usage: switchyard {}", what, usage))
}

pub async fn run(ctx: &CliContext, args: &[String]) -> Result<()> {
    let query = positionals(args, 2).join(" ");
    if query.trim().is_empty() {
        return Err(anyhow!("Usage: switchyard run [--project <id>] [--detach] <query...>"));
    }
    let project = flag_value(args, "--project");
    let (run, task) = ctx
        .orchestrator
        .create_run(&ctx.user, &query, project.as_deref())
        .await?;
    print_info(&format!("Run {} created for task {}", style(&run.id).bold(), style(&task.id).dim()));

    if has_flag(args, "--detach") {
        print_info(&format!("Detached. `switchyard status {}` starts it.", run.id));
        return Ok(());
    }
    let run = ctx.orchestrator.execute_run(&run.id).await?;
    report_run(ctx, &run).await
}

/// One-line outcome plus any approval the run is waiting on.
async fn report_run(ctx: &CliContext, run: &Run) -> Result<()> {
    match run.status {
        RunStatus::Terminated => match run.termination_reason {
            Some(TerminationReason::Completed) => print_success("Run completed"),
            Some(reason) => print_error(&format!("Run terminated: {}", reason.as_str())),
            None => print_warn("Run terminated without a reason"),
        },
        RunStatus::WaitingApproval => {
            print_waiting("Run is waiting for approval");
            let pending = ctx.orchestrator.list_pending_approvals(&run.user_id).await?;
            for approval in pending.iter().filter(|a| a.run_id == run.id) {
                GuideSection::new(&format!("Approval {}", approval.id))
                    .status("Step", &approval.step_id)
                    .status("Risk", &styled_status(approval.risk_level.as_str()))
                    .status("Expires", &approval.expires_at.to_rfc3339())
                    .text(&approval.description)
                    .blank()
                    .info(&format!(
                        "Run `switchyard approve {}` or `switchyard reject {}`.",
                        approval.id, approval.id
                    ))
                    .print();
            }
        }
        _ => print_info(&format!("Run is {}", run.status.as_str())),
    }
    if let Some(task) = ctx.orchestrator.get_task(&run.task_id).await? {
        print_task(&task);
    }
    println!();
    Ok(())
}

fn print_task(task: &Task) {
    let mut section = GuideSection::new(&format!("Task {}", task.id))
        .status("Query", &task.query)
        .status("Project", &task.project_id)
        .status("Status", &styled_status(task.status.as_str()));
    if let Some(failure) = &task.failure {
        section = section.warn(failure);
    }
    if !task.todo_list.is_empty() {
        section = section.blank();
    }
    for step in &task.todo_list {
        let mut line = format!(
            "{:<12} {:<20} {}",
            step.id,
            step.worker.as_str(),
            styled_status(step.status.as_str())
        );
        if step.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", step.attempts));
        }
        if let Some(err) = &step.error {
            line.push_str(&format!(" - {}", err));
        }
        section = section.text(&line);
    }
    section.print();
}

pub async fn status(ctx: &CliContext, args: &[String]) -> Result<()> {
    let run_id = required_arg(args, "run id", "status <run_id>")?;
    let Some(run) = ctx.orchestrator.get_run(&run_id).await? else {
        print_error(&format!("No run '{}'", run_id));
        return Ok(());
    };
    // A detached or interrupted run is picked up where it stopped.
    let run = if run.status == RunStatus::Created || run.status == RunStatus::Started {
        ctx.orchestrator.execute_run(&run.id).await?
    } else {
        run
    };
    GuideSection::new(&format!("Run {}", run.id))
        .status("User", &run.user_id)
        .status("Status", &styled_status(run.status.as_str()))
        .status(
            "Reason",
            run.termination_reason.map(|r| r.as_str()).unwrap_or("-"),
        )
        .status("Created", &run.created_at.to_rfc3339())
        .print();
    report_run(ctx, &run).await
}

pub async fn replay(ctx: &CliContext, args: &[String]) -> Result<()> {
    let run_id = required_arg(args, "run id", "replay <run_id> [--json]")?;
    let Some(replay) = ctx.orchestrator.get_run_replay(&run_id).await? else {
        print_error(&format!("No run '{}'", run_id));
        return Ok(());
    };
    if has_flag(args, "--json") {
        println!("{}", serde_json::to_string_pretty(&replay)?);
        return Ok(());
    }
    let mut section = GuideSection::new(&format!("Replay {}", replay.run.id));
    for event in &replay.events {
        let mut line = format!(
            "{}  {:<22}",
            style(event.timestamp.format("%H:%M:%S%.3f")).dim(),
            event.activity_type.as_str()
        );
        if let Some(step) = event.details.get("step_id").and_then(|v| v.as_str()) {
            line.push_str(&format!(" {}", step));
        }
        if let Some(reason) = event.details.get("reason").and_then(|v| v.as_str()) {
            line.push_str(&format!(" ({})", reason));
        }
        section = section.text(&line);
    }
    section.print();
    println!();
    Ok(())
}

pub async fn list_runs(ctx: &CliContext) -> Result<()> {
    let runs = ctx.orchestrator.list_runs(&ctx.user).await?;
    if runs.is_empty() {
        print_info("No runs yet.");
        return Ok(());
    }
    let mut section = GuideSection::new(&format!("Runs for {}", ctx.user));
    for run in &runs {
        let status = match run.termination_reason {
            Some(reason) => reason.as_str().to_string(),
            None => run.status.as_str().to_string(),
        };
        section = section.text(&format!(
            "{}  {}  {}",
            run.id,
            style(run.created_at.format("%Y-%m-%d %H:%M")).dim(),
            styled_status(&status)
        ));
    }
    section.print();
    println!();
    Ok(())
}

pub async fn cancel(ctx: &CliContext, args: &[String]) -> Result<()> {
    let run_id = required_arg(args, "run id", "cancel <run_id>")?;
    let run = ctx.orchestrator.cancel_run(&run_id).await?;
    print_success(&format!("Run {} cancelled", run.id));
    Ok(())
}

pub async fn approvals(ctx: &CliContext, args: &[String]) -> Result<()> {
    let pending = if has_flag(args, "--all") {
        ctx.orchestrator.engine().approvals.list_pending(None).await?
    } else {
        ctx.orchestrator.list_pending_approvals(&ctx.user).await?
    };
    if pending.is_empty() {
        print_info("No approvals waiting.");
        return Ok(());
    }
    for approval in &pending {
        GuideSection::new(&format!("Approval {}", approval.id))
            .status("Run", &approval.run_id)
            .status("Step", &approval.step_id)
            .status("Type", approval.approval_type.as_str())
            .status("Risk", &styled_status(approval.risk_level.as_str()))
            .status("Expires", &approval.expires_at.to_rfc3339())
            .text(&approval.description)
            .print();
    }
    println!();
    Ok(())
}

pub async fn respond(ctx: &CliContext, args: &[String], approved: bool) -> Result<()> {
    let usage = if approved {
        "approve <approval_id> [--notes <text>]"
    } else {
        "reject <approval_id> [--notes <text>]"
    };
    let approval_id = required_arg(args, "approval id", usage)?;
    let notes = flag_value(args, "--notes");
    let run = ctx
        .orchestrator
        .respond_to_approval(&approval_id, approved, notes)
        .await?;
    report_run(ctx, &run).await
}

fn print_budget(budget: &ResourceBudget) {
    let mut section = GuideSection::new(&format!("{} budget {}", budget.scope.as_str(), budget.scope_id));
    for resource in ResourceKind::ALL {
        let used = budget.used(resource);
        let limit = budget.limit(resource);
        let pct = if limit == 0 { 100 } else { used * 100 / limit };
        let shown = format!("{:>12} / {:<12} {:>3}%", used, limit, pct);
        let shown = if pct >= 80 {
            style(shown).yellow().to_string()
        } else {
            shown
        };
        section = section.status(resource.as_str(), &shown);
    }
    if let Some(expires) = budget.expires_at {
        section = section.blank().info(&format!("Resets at {}", expires.to_rfc3339()));
    }
    section.print();
}

pub async fn budget(ctx: &CliContext, args: &[String]) -> Result<()> {
    let pos = positionals(args, 2);
    let scope = match pos.first() {
        Some(s) => BudgetScope::parse(s).ok_or_else(|| anyhow!("unknown budget scope '{}'", s))?,
        None => BudgetScope::User,
    };
    let scope_id = match (scope, pos.get(1)) {
        (_, Some(id)) => id.clone(),
        (BudgetScope::User, None) => ctx.user.clone(),
        (BudgetScope::Global, None) => GLOBAL_SCOPE_ID.to_string(),
        (BudgetScope::Run, None) => return Err(anyhow!("Usage: switchyard budget run <run_id>")),
    };
    let budgets = &ctx.orchestrator.engine().budgets;
    let budget = if has_flag(args, "--reset") {
        let reset = budgets.reset_budget(scope, &scope_id).await?;
        print_success(&format!("{} budget {} reset", scope.as_str(), scope_id));
        reset
    } else {
        budgets.get_budget(scope, &scope_id).await?
    };
    print_budget(&budget);
    println!();
    Ok(())
}

/// Daily counters plus the latest events across all runs.
pub async fn activity(ctx: &CliContext, args: &[String]) -> Result<()> {
    let engine = ctx.orchestrator.engine();
    let limit = flag_value(args, "--limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    let date = flag_value(args, "--date")
        .unwrap_or_else(|| engine.clock.now().format("%Y-%m-%d").to_string());

    let counts = daily_counts(engine.store.as_ref(), &date).await?;
    let mut section = GuideSection::new(&format!("Activity on {}", date))
        .status("Total", &counts["total"].to_string());
    if let Some(by_type) = counts["counts"].as_object() {
        for (kind, n) in by_type {
            section = section.status(kind, &n.to_string());
        }
    }
    section.print();

    let recent = engine.activity.recent(limit).await?;
    if recent.is_empty() {
        print_info("No activity recorded yet.");
        return Ok(());
    }
    let mut section = GuideSection::new("Recent events");
    for event in &recent {
        section = section.text(&format!(
            "{}  {:<22} run {}",
            style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            event.activity_type.as_str(),
            event.run_id
        ));
    }
    section.print();
    println!();
    Ok(())
}
