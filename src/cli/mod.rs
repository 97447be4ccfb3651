mod daemon;
mod orchestrator;
mod schedule;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::config::{self, EngineConfig};
use crate::core::engine::Engine;
use crate::core::orchestrator::Orchestrator;
use crate::core::terminal::{self, GuideSection, print_error};

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "--user", "--project", "--notes", "--name", "--cron", "--every", "--at", "--max-runs", "--limit",
    "--date",
];

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Runs")
        .command("run <query...>", "Plan and execute a task (--project, --detach)")
        .command("status <run_id>", "Show a run, its task and every step")
        .command("replay <run_id>", "Print the run's event timeline (--json)")
        .command("runs", "List your runs, newest first")
        .command("cancel <run_id>", "Terminate a run on your behalf")
        .print();

    GuideSection::new("Approvals")
        .command("approvals", "List approvals waiting on you (--all)")
        .command("approve <approval_id>", "Approve and resume the run (--notes)")
        .command("reject <approval_id>", "Reject and fail the run (--notes)")
        .print();

    GuideSection::new("Schedules")
        .command("schedule add <template...>", "--name with --cron, --every <ms> or --at <rfc3339>")
        .command("schedule list", "Your scheduled tasks")
        .command("schedule enable|disable <id>", "Toggle a scheduled task")
        .command("schedule delete <id>", "Remove a scheduled task")
        .command("schedule due", "Upcoming runs across all users (--limit)")
        .print();

    GuideSection::new("Operations")
        .command("daemon", "Run scheduler ticks, approval expiry and activity counters")
        .command("budget [run|user|global] [id]", "Show usage against limits (--reset)")
        .command("activity", "Daily event counters and recent events (--date, --limit)")
        .blank()
        .info("--user <id> acts as another user; defaults to $SWITCHYARD_USER or $USER.")
        .print();
    println!();
}

/// Value following `flag`, if present.
pub(crate) fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

pub(crate) fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Arguments from `start` on that are neither flags nor flag values.
pub(crate) fn positionals(args: &[String], start: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
        } else if arg.starts_with("--") {
            i += 1;
        } else {
            out.push(args[i].clone());
            i += 1;
        }
    }
    out
}

pub(crate) fn current_user(args: &[String]) -> String {
    flag_value(args, "--user")
        .or_else(|| std::env::var("SWITCHYARD_USER").ok())
        .or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

/// Everything a command needs once the data directory is open.
pub(crate) struct CliContext {
    pub data_dir: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
    pub user: String,
}

async fn open_context(args: &[String], daemon: bool) -> Result<CliContext> {
    let data_dir = config::data_dir()?;
    tokio::fs::create_dir_all(&data_dir).await?;
    let config = EngineConfig::load(&data_dir).await?;

    if daemon {
        crate::logging::init(&config.log_level, Some(&data_dir.join("switchyard.log")))?;
    } else {
        crate::logging::init("warn", None)?;
    }

    let engine = Engine::open(&data_dir, config).await?;
    Ok(CliContext {
        data_dir,
        orchestrator: Arc::new(Orchestrator::new(Arc::new(engine))),
        user: current_user(args),
    })
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let ctx = open_context(&args, cmd == "daemon").await?;
    match cmd {
        "run" => orchestrator::run(&ctx, &args).await,
        "status" => orchestrator::status(&ctx, &args).await,
        "replay" => orchestrator::replay(&ctx, &args).await,
        "runs" => orchestrator::list_runs(&ctx).await,
        "cancel" => orchestrator::cancel(&ctx, &args).await,
        "approvals" => orchestrator::approvals(&ctx, &args).await,
        "approve" => orchestrator::respond(&ctx, &args, true).await,
        "reject" => orchestrator::respond(&ctx, &args, false).await,
        "budget" => orchestrator::budget(&ctx, &args).await,
        "activity" => orchestrator::activity(&ctx, &args).await,
        "schedule" => schedule::run_schedule_command(&ctx, &args).await,
        "daemon" => daemon::run_daemon(&ctx).await,
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}
