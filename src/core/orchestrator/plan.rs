//! Turning a query into a validated step graph.
//!
//! A planner returns steps; [`validate_plan`] rejects duplicate ids, unknown
//! dependencies and cycles before any of them is persisted.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::core::approval::{ApprovalType, RiskLevel};
use crate::core::errors::PlanError;
use crate::core::orchestrator::types::{Step, StepStatus, Task};
use crate::core::workers::{RemoteWorkflowClient, WorkerContext, WorkerKind};

const PLANNER_WORKFLOW: &str = "planner";

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &Task) -> Result<Vec<Step>>;
}

/// Step as written by a planner. Ids are optional and default to `step-N`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedStep {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(alias = "agent", alias = "worker_type")]
    pub worker: String,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub require_approval: Option<bool>,
    #[serde(default)]
    pub approval_type: Option<ApprovalType>,
    #[serde(default)]
    pub allow_failure: bool,
}

impl PlannedStep {
    fn into_step(self, position: usize) -> Result<Step, PlanError> {
        let worker = WorkerKind::parse(&self.worker)
            .ok_or_else(|| PlanError::Unparseable(format!("unknown worker `{}`", self.worker)))?;
        Ok(Step {
            id: self.id.unwrap_or_else(|| format!("step-{}", position + 1)),
            description: self.description,
            worker,
            status: StepStatus::Pending,
            depends_on: self.depends_on,
            inputs: self.inputs,
            risk_level: self.risk_level,
            require_approval: self.require_approval,
            approval_type: self.approval_type,
            allow_failure: self.allow_failure,
            result: None,
            error: None,
            approval_id: None,
            approval_granted: false,
            attempts: 0,
            started_at: None,
            finished_at: None,
        })
    }
}

/// Pull a JSON document out of planner text: a fenced ```json block first,
/// then raw text starting with `{` or `[`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

/// Accepts `[...]`, `{"steps": [...]}` or `{"todo_list": [...]}`.
pub fn plan_from_value(value: Value) -> Result<Vec<Step>, PlanError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("steps").or_else(|| map.remove("todo_list")) {
            Some(Value::Array(items)) => items,
            _ => return Err(PlanError::Unparseable("no `steps` array".into())),
        },
        Value::String(text) => return parse_plan(&text),
        _ => return Err(PlanError::Unparseable("expected an array of steps".into())),
    };
    let planned: Vec<PlannedStep> = serde_json::from_value(Value::Array(items))
        .map_err(|e| PlanError::Unparseable(e.to_string()))?;
    let steps = planned
        .into_iter()
        .enumerate()
        .map(|(i, p)| p.into_step(i))
        .collect::<Result<Vec<_>, _>>()?;
    validate_plan(&steps)?;
    Ok(steps)
}

pub fn parse_plan(text: &str) -> Result<Vec<Step>, PlanError> {
    let json = extract_json_block(text)
        .ok_or_else(|| PlanError::Unparseable("no JSON block in planner output".into()))?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| PlanError::Unparseable(e.to_string()))?;
    plan_from_value(value)
}

pub fn validate_plan(steps: &[Step]) -> Result<(), PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }
    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), PlanError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(PlanError::Cycle(cycle));
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        for dep in edges.get(id).into_iter().flatten() {
            visit(*dep, edges, marks, path)?;
        }
        path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let edges: HashMap<&str, Vec<&str>> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();
    let mut marks = HashMap::new();
    for step in steps {
        visit(&step.id, &edges, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

/// Always returns the same steps. Useful for replaying a known plan.
pub struct StaticPlanner {
    steps: Vec<Step>,
}

impl StaticPlanner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _task: &Task) -> Result<Vec<Step>> {
        validate_plan(&self.steps)?;
        Ok(self.steps.clone())
    }
}

/// Hands the whole query to one worker.
pub struct SingleStepPlanner {
    pub worker: WorkerKind,
}

#[async_trait]
impl Planner for SingleStepPlanner {
    async fn plan(&self, task: &Task) -> Result<Vec<Step>> {
        let planned = PlannedStep {
            id: Some("step-1".into()),
            description: task.query.clone(),
            worker: self.worker.as_str().to_string(),
            depends_on: Vec::new(),
            inputs: None,
            risk_level: None,
            require_approval: None,
            approval_type: None,
            allow_failure: false,
        };
        Ok(vec![planned.into_step(0)?])
    }
}

/// Asks the remote `planner` workflow for a step list, falling back to a
/// single step when the workflow fails or returns something unusable.
pub struct WorkflowPlanner {
    client: RemoteWorkflowClient,
    fallback: SingleStepPlanner,
}

impl WorkflowPlanner {
    pub fn new(client: RemoteWorkflowClient, fallback_worker: WorkerKind) -> Self {
        Self {
            client,
            fallback: SingleStepPlanner {
                worker: fallback_worker,
            },
        }
    }
}

#[async_trait]
impl Planner for WorkflowPlanner {
    async fn plan(&self, task: &Task) -> Result<Vec<Step>> {
        let context = WorkerContext {
            task_id: task.id.clone(),
            step_id: "plan".into(),
            project_id: task.project_id.clone(),
            user_id: task.user_id.clone(),
            ..Default::default()
        };
        match self
            .client
            .invoke_workflow(PLANNER_WORKFLOW, &task.query, &context)
            .await
        {
            Ok(value) => match plan_from_value(value) {
                Ok(steps) => {
                    info!(task_id = %task.id, "Planner produced {} steps", steps.len());
                    Ok(steps)
                }
                Err(e) if !matches!(e, PlanError::Unparseable(_) | PlanError::Empty) => Err(e.into()),
                Err(e) => {
                    warn!(task_id = %task.id, "Unusable plan ({}), using a single step", e);
                    self.fallback.plan(task).await
                }
            },
            Err(e) => {
                warn!(task_id = %task.id, "Planner workflow failed ({}), using a single step", e);
                self.fallback.plan(task).await
            }
        }
    }
}
