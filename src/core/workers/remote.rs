//! Webhook client for workers hosted on an external workflow runner.
//!
//! `POST {base}/webhook/{name}` with `{inputs, context}`. A response that only
//! carries an execution id is polled at `GET {base}/executions/{id}` until it
//! reports `finished`.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{WorkerContext, WorkerKind, WorkerOutput};
use crate::core::config::RemoteConfig;
use crate::core::retry::{RetryPolicy, retry_with_backoff};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("invalid remote workflow url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("workflow returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode workflow response: {0}")]
    Decode(String),
    #[error("execution {id} did not finish after {polls} polls")]
    PollExhausted { id: String, polls: u32 },
}

impl RemoteError {
    /// Transport failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionStatus {
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, rename = "stoppedAt")]
    stopped_at: Option<String>,
}

#[derive(Clone)]
pub struct RemoteWorkflowClient {
    http: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_polls: u32,
}

impl RemoteWorkflowClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url,
            retry: config.retry.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }

    pub async fn invoke(
        &self,
        kind: WorkerKind,
        inputs: &str,
        context: &WorkerContext,
    ) -> Result<WorkerOutput, RemoteError> {
        let payload = self.invoke_workflow(&kind.workflow_name(), inputs, context).await?;
        decode_output(payload)
    }

    /// Call a named workflow and return its raw result document.
    pub async fn invoke_workflow(
        &self,
        name: &str,
        inputs: &str,
        context: &WorkerContext,
    ) -> Result<Value, RemoteError> {
        let url = self.endpoint(&format!("webhook/{}", name))?;
        let body = json!({ "inputs": inputs, "context": context });
        info!("Invoking remote workflow {} for step {}", name, context.step_id);

        let label = format!("webhook {}", name);
        let response = retry_with_backoff(
            &self.retry,
            &label,
            |_| {
                let http = self.http.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let resp = http.post(url).json(&body).send().await?;
                    read_json(resp).await
                }
            },
            RemoteError::is_retryable,
        )
        .await?;

        let execution_id = response
            .get("executionId")
            .or_else(|| response.get("execution_id"))
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())));
        let has_result = response.get("success").is_some() || response.get("outputs").is_some();

        match execution_id {
            Some(id) if !has_result => self.wait_for_execution(&id).await,
            _ => Ok(response),
        }
    }

    async fn wait_for_execution(&self, id: &str) -> Result<Value, RemoteError> {
        let url = self.endpoint(&format!("executions/{}", id))?;
        for poll in 1..=self.max_polls {
            let label = format!("execution {}", id);
            let raw = retry_with_backoff(
                &self.retry,
                &label,
                |_| {
                    let http = self.http.clone();
                    let url = url.clone();
                    async move {
                        let resp = http.get(url).send().await?;
                        read_json(resp).await
                    }
                },
                RemoteError::is_retryable,
            )
            .await?;
            let status: ExecutionStatus =
                serde_json::from_value(raw).map_err(|e| RemoteError::Decode(e.to_string()))?;
            if status.finished {
                debug!(
                    "Execution {} finished after {} polls (stopped at {:?})",
                    id, poll, status.stopped_at
                );
                return Ok(status.data.unwrap_or(Value::Null));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(RemoteError::PollExhausted {
            id: id.to_string(),
            polls: self.max_polls,
        })
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, RemoteError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Accept either a bare worker result or one wrapped in a single-element array
/// (the shape some workflow runners return from webhook nodes).
fn decode_output(payload: Value) -> Result<WorkerOutput, RemoteError> {
    let payload = match payload {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    };
    if payload.is_null() {
        return Err(RemoteError::Decode("empty workflow result".into()));
    }
    serde_json::from_value(payload).map_err(|e| RemoteError::Decode(e.to_string()))
}
