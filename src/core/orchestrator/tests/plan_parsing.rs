//! Tests for planner output parsing and step graph validation.

use crate::core::errors::PlanError;
use crate::core::orchestrator::plan::{Planner, SingleStepPlanner, extract_json_block, parse_plan, validate_plan};
use crate::core::orchestrator::types::StepStatus;
use crate::core::testing::{step, step_after, task_with};
use crate::core::workers::WorkerKind;

#[test]
fn parse_plan_accepts_steps_object() {
    let json = r#"{
        "steps": [
            { "id": "s1", "description": "Research crates", "worker": "research" },
            { "id": "s2", "description": "Write the report", "worker": "writing", "depends_on": ["s1"] }
        ]
    }"#;

    let steps = parse_plan(json).expect("valid plan");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].worker, WorkerKind::Research);
    assert_eq!(steps[1].depends_on, vec!["s1"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
}

#[test]
fn parse_plan_accepts_fenced_array_with_aliases() {
    let output = r#"Here is the plan:
```json
[
  { "description": "Generate code", "agent": "code-generation" },
  { "description": "Run it", "worker_type": "code_execution", "dependencies": ["step-1"], "require_approval": true }
]
```
Let me know."#;

    let steps = parse_plan(output).expect("fenced plan");
    assert_eq!(steps[0].id, "step-1");
    assert_eq!(steps[1].id, "step-2");
    assert_eq!(steps[1].worker, WorkerKind::CodeExecution);
    assert_eq!(steps[1].require_approval, Some(true));
}

#[test]
fn parse_plan_rejects_prose_and_unknown_workers() {
    assert!(matches!(
        parse_plan("I would start by researching."),
        Err(PlanError::Unparseable(_))
    ));
    assert!(matches!(
        parse_plan(r#"[{ "description": "x", "worker": "astrologer" }]"#),
        Err(PlanError::Unparseable(msg)) if msg.contains("astrologer")
    ));
}

#[test]
fn extract_json_block_prefers_fence() {
    assert_eq!(extract_json_block("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
    assert_eq!(extract_json_block("  [1]  "), Some("[1]"));
    assert_eq!(extract_json_block("no json here"), None);
}

#[test]
fn validation_rejects_bad_graphs() {
    assert_eq!(validate_plan(&[]), Err(PlanError::Empty));

    let dup = vec![
        step("a", WorkerKind::Research, "one"),
        step("a", WorkerKind::Research, "two"),
    ];
    assert_eq!(validate_plan(&dup), Err(PlanError::DuplicateStep("a".into())));

    let unknown = vec![step_after("a", WorkerKind::Research, "one", &["ghost"])];
    assert_eq!(
        validate_plan(&unknown),
        Err(PlanError::UnknownDependency {
            step: "a".into(),
            dependency: "ghost".into()
        })
    );

    let cycle = vec![
        step_after("a", WorkerKind::Research, "one", &["c"]),
        step_after("b", WorkerKind::Analysis, "two", &["a"]),
        step_after("c", WorkerKind::Writing, "three", &["b"]),
    ];
    match validate_plan(&cycle) {
        Err(PlanError::Cycle(path)) => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn diamond_graph_is_valid() {
    let steps = vec![
        step("a", WorkerKind::Research, "root"),
        step_after("b", WorkerKind::Analysis, "left", &["a"]),
        step_after("c", WorkerKind::Analysis, "right", &["a"]),
        step_after("d", WorkerKind::Writing, "join", &["b", "c"]),
    ];
    assert_eq!(validate_plan(&steps), Ok(()));
}

#[tokio::test]
async fn single_step_planner_uses_the_query() {
    let mut task = task_with("proj", Vec::new());
    task.query = "Summarize the release notes".into();
    let steps = SingleStepPlanner {
        worker: WorkerKind::Writing,
    }
    .plan(&task)
    .await
    .unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].description, "Summarize the release notes");
    assert_eq!(steps[0].worker, WorkerKind::Writing);
}
