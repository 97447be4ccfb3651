use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use console::style;

use super::{CliContext, flag_value, positionals};
use crate::core::scheduler::{LastRunStatus, NewScheduledTask, Schedule, ScheduledTask};
use crate::core::terminal::{GuideSection, print_info, print_success, styled_status};

const USAGE: &str = "Usage: switchyard schedule <add|list|enable|disable|delete|due>";

pub async fn run_schedule_command(ctx: &CliContext, args: &[String]) -> Result<()> {
    let pos = positionals(args, 2);
    let Some(action) = pos.first().map(String::as_str) else {
        return Err(anyhow!(USAGE));
    };
    let scheduler = &ctx.orchestrator.engine().scheduler;

    match action {
        "add" => {
            let template = pos[1..].join(" ");
            let new = parse_new_task(args, &ctx.user, template)?;
            let created = scheduler.create_scheduled_task(new).await?;
            print_success(&format!("Scheduled '{}' ({})", created.name, created.id));
            print_schedule(&created);
        }
        "list" => {
            let tasks = scheduler.list_for_user(&ctx.user).await?;
            if tasks.is_empty() {
                print_info("No scheduled tasks.");
            }
            for task in &tasks {
                print_schedule(task);
            }
        }
        "enable" | "disable" => {
            let id = pos.get(1).ok_or_else(|| anyhow!("Usage: switchyard schedule {} <id>", action))?;
            let task = scheduler.set_enabled(id, action == "enable").await?;
            print_success(&format!("'{}' {}d", task.name, action));
            print_schedule(&task);
        }
        "delete" => {
            let id = pos.get(1).ok_or_else(|| anyhow!("Usage: switchyard schedule delete <id>"))?;
            if scheduler.delete_scheduled_task(id).await? {
                print_success(&format!("Deleted scheduled task {}", id));
            } else {
                print_info(&format!("No scheduled task {}", id));
            }
        }
        "due" => {
            let limit = flag_value(args, "--limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            let upcoming = scheduler.list_upcoming(limit).await?;
            if upcoming.is_empty() {
                print_info("Nothing scheduled.");
            }
            for task in &upcoming {
                print_schedule(task);
            }
        }
        other => return Err(anyhow!("unknown schedule action '{}'. {}", other, USAGE)),
    }
    println!();
    Ok(())
}

/// Build a schedule from `--cron`, `--every <ms>` or `--at <rfc3339>`.
fn parse_schedule(args: &[String]) -> Result<Schedule> {
    let cron = flag_value(args, "--cron");
    let every = flag_value(args, "--every");
    let at = flag_value(args, "--at");
    match (cron, every, at) {
        (Some(expression), None, None) => Ok(Schedule::Cron { expression }),
        (None, Some(ms), None) => Ok(Schedule::Interval {
            interval_ms: ms
                .parse()
                .map_err(|_| anyhow!("--every expects milliseconds, got '{}'", ms))?,
        }),
        (None, None, Some(at)) => Ok(Schedule::Once {
            run_at: DateTime::parse_from_rfc3339(&at)
                .map_err(|e| anyhow!("--at expects an RFC 3339 time: {}", e))?
                .with_timezone(&Utc),
        }),
        _ => Err(anyhow!("give exactly one of --cron, --every or --at")),
    }
}

fn parse_new_task(args: &[String], user: &str, template: String) -> Result<NewScheduledTask> {
    if template.trim().is_empty() {
        return Err(anyhow!(
            "Usage: switchyard schedule add --name <name> (--cron <expr> | --every <ms> | --at <time>) <query template...>"
        ));
    }
    let name = flag_value(args, "--name").ok_or_else(|| anyhow!("--name is required"))?;
    let max_runs = match flag_value(args, "--max-runs") {
        Some(v) => Some(
            v.parse()
                .map_err(|_| anyhow!("--max-runs expects a number, got '{}'", v))?,
        ),
        None => None,
    };
    Ok(NewScheduledTask {
        user_id: user.to_string(),
        name,
        schedule: parse_schedule(args)?,
        query_template: template,
        project_id: flag_value(args, "--project"),
        max_runs,
    })
}

fn describe(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Once { run_at } => format!("once at {}", run_at.to_rfc3339()),
        Schedule::Cron { expression } => format!("cron `{}`", expression),
        Schedule::Interval { interval_ms } => format!("every {} ms", interval_ms),
    }
}

fn print_schedule(task: &ScheduledTask) {
    let state = if task.enabled { "enabled" } else { "disabled" };
    let mut section = GuideSection::new(&format!("{} {}", task.name, style(&task.id).dim()))
        .status("Schedule", &describe(&task.schedule))
        .status("Query", &task.query_template)
        .status("State", &styled_status(state))
        .status(
            "Next run",
            &task
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    let runs = match task.max_runs {
        Some(max) => format!("{} of {}", task.run_count, max),
        None => task.run_count.to_string(),
    };
    section = section.status("Runs", &runs);
    if let Some(status) = task.last_run_status {
        let label = match status {
            LastRunStatus::Success => "success",
            LastRunStatus::Failed => "failed",
        };
        section = section.status("Last run", &styled_status(label));
    }
    if let Some(err) = &task.last_error {
        section = section.warn(err);
    }
    section.print();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_each_schedule_kind() {
        assert_eq!(
            parse_schedule(&argv("x schedule add --every 60000")).unwrap(),
            Schedule::Interval { interval_ms: 60_000 }
        );
        assert_eq!(
            parse_schedule(&argv("x schedule add --cron */15")).unwrap(),
            Schedule::Cron {
                expression: "*/15".into()
            }
        );
        assert!(matches!(
            parse_schedule(&argv("x schedule add --at 2024-06-01T09:00:00Z")).unwrap(),
            Schedule::Once { .. }
        ));
    }

    #[test]
    fn rejects_ambiguous_or_missing_schedule() {
        assert!(parse_schedule(&argv("x schedule add --every 5 --cron *")).is_err());
        assert!(parse_schedule(&argv("x schedule add")).is_err());
        assert!(parse_schedule(&argv("x schedule add --every soon")).is_err());
    }

    #[test]
    fn new_task_needs_name_and_template() {
        let args = argv("x schedule add --name digest --every 1000 --max-runs 3 summarize {{date}}");
        let pos = positionals(&args, 2);
        let new = parse_new_task(&args, "u", pos[1..].join(" ")).unwrap();
        assert_eq!(new.name, "digest");
        assert_eq!(new.max_runs, Some(3));
        assert_eq!(new.query_template, "summarize {{date}}");

        let unnamed = argv("x schedule add --every 1000 hello");
        assert!(parse_new_task(&unnamed, "u", "hello".into()).is_err());
    }
}
