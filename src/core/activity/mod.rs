//! Append-only lifecycle events.
//!
//! Every event lands in the global stream and in its run's own stream. The
//! per-run stream is what replay reads; the global stream feeds the daily
//! counters through a consumer group.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::orchestrator::types::Run;
use crate::core::store::{Store, keys};

pub const DAILY_COUNTER_GROUP: &str = "daily-counters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RunCreated,
    RunStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
    RunWaitingApproval,
    RunTerminated,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::RunCreated => "run_created",
            ActivityType::RunStarted => "run_started",
            ActivityType::StepStarted => "step_started",
            ActivityType::StepCompleted => "step_completed",
            ActivityType::StepFailed => "step_failed",
            ActivityType::ApprovalRequested => "approval_requested",
            ActivityType::ApprovalApproved => "approval_approved",
            ActivityType::ApprovalRejected => "approval_rejected",
            ActivityType::ApprovalExpired => "approval_expired",
            ActivityType::RunWaitingApproval => "run_waiting_approval",
            ActivityType::RunTerminated => "run_terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

pub struct ActivityLog {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Stamp and append an event for `run`.
    pub async fn record(&self, run: &Run, activity_type: ActivityType, details: Value) -> Result<ActivityEvent> {
        let event = ActivityEvent {
            activity_type,
            run_id: run.id.clone(),
            task_id: run.task_id.clone(),
            project_id: run.project_id.clone(),
            user_id: run.user_id.clone(),
            timestamp: self.clock.now(),
            details,
        };
        self.log_activity(&event).await?;
        Ok(event)
    }

    pub async fn log_activity(&self, event: &ActivityEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        self.store.append(keys::ACTIVITY_STREAM, payload.clone()).await?;
        self.store
            .append(&keys::run_activity_stream(&event.run_id), payload)
            .await?;
        debug!(run_id = %event.run_id, "activity {}", event.activity_type.as_str());
        Ok(())
    }

    /// The run's events in append order.
    pub async fn run_events(&self, run_id: &str) -> Result<Vec<ActivityEvent>> {
        let entries = self
            .store
            .range(&keys::run_activity_stream(run_id), 0, usize::MAX)
            .await?;
        entries
            .into_iter()
            .map(|e| Ok(serde_json::from_value(e.payload)?))
            .collect()
    }

    /// Latest `limit` events across all runs, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ActivityEvent>> {
        self.store
            .tail(keys::ACTIVITY_STREAM, limit)
            .await?
            .into_iter()
            .map(|e| Ok(serde_json::from_value(e.payload)?))
            .collect()
    }
}

/// Folds the global activity stream into `activity:daily:{date}` documents.
pub struct DailyAggregator {
    store: Arc<dyn Store>,
    consumer: String,
    batch: usize,
    interval: Duration,
}

impl DailyAggregator {
    pub fn new(store: Arc<dyn Store>, consumer: impl Into<String>, batch: usize, interval: Duration) -> Self {
        Self {
            store,
            consumer: consumer.into(),
            batch: batch.max(1),
            interval,
        }
    }

    /// Process one batch. Entries are acked only after their counters are
    /// written, so a crash mid-batch redelivers them.
    pub async fn drain_once(&self) -> Result<usize> {
        let entries = self
            .store
            .read_group(keys::ACTIVITY_STREAM, DAILY_COUNTER_GROUP, &self.consumer, self.batch)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<ActivityEvent>(entry.payload) {
                Ok(event) => {
                    let key = keys::daily_activity(&event.timestamp.format("%Y-%m-%d").to_string());
                    self.store
                        .increment(&key, &format!("counts.{}", event.activity_type.as_str()), 1)
                        .await?;
                    self.store.increment(&key, "total", 1).await?;
                }
                Err(e) => warn!("Skipping malformed activity entry {}: {}", entry.id, e),
            }
            ids.push(entry.id);
        }
        self.store
            .ack(keys::ACTIVITY_STREAM, DAILY_COUNTER_GROUP, &ids)
            .await
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Activity aggregator '{}' started", self.consumer);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    loop {
                        match self.drain_once().await {
                            Ok(n) if n >= self.batch => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!("Activity aggregation failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("Activity aggregator '{}' stopped", self.consumer);
    }
}

/// Daily counters for one `YYYY-MM-DD` date.
pub async fn daily_counts(store: &dyn Store, date: &str) -> Result<Value> {
    Ok(store
        .get(&keys::daily_activity(date), None)
        .await?
        .unwrap_or_else(|| json!({ "total": 0, "counts": {} })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::orchestrator::types::RunStatus;
    use crate::core::store::SqliteStore;

    fn run(id: &str, clock: &ManualClock) -> Run {
        Run {
            id: id.into(),
            task_id: format!("task-{}", id),
            project_id: "proj".into(),
            user_id: "user-1".into(),
            status: RunStatus::Created,
            termination_reason: None,
            created_at: clock.now(),
            updated_at: clock.now(),
            terminated_at: None,
        }
    }

    fn setup() -> (Arc<dyn Store>, ActivityLog, Arc<ManualClock>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::at("2024-01-01T10:00:00Z"));
        let log = ActivityLog::new(store.clone(), clock.clone());
        (store, log, clock)
    }

    #[tokio::test]
    async fn events_are_kept_per_run_in_order() {
        let (_, log, clock) = setup();
        let a = run("a", &clock);
        let b = run("b", &clock);
        log.record(&a, ActivityType::RunCreated, json!({})).await.unwrap();
        log.record(&b, ActivityType::RunCreated, json!({})).await.unwrap();
        log.record(&a, ActivityType::RunStarted, json!({})).await.unwrap();
        log.record(&a, ActivityType::RunTerminated, json!({ "reason": "completed" }))
            .await
            .unwrap();

        let events = log.run_events("a").await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.activity_type).collect();
        assert_eq!(
            types,
            vec![
                ActivityType::RunCreated,
                ActivityType::RunStarted,
                ActivityType::RunTerminated
            ]
        );
        assert_eq!(events[2].details["reason"], "completed");
        assert_eq!(log.run_events("b").await.unwrap().len(), 1);

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].activity_type, ActivityType::RunStarted);
        assert_eq!(recent[1].activity_type, ActivityType::RunTerminated);
        let three = log.recent(3).await.unwrap();
        assert_eq!(three[0].run_id, "b");
        assert!(log.recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregator_counts_by_day_and_acks() {
        let (store, log, clock) = setup();
        let a = run("a", &clock);
        log.record(&a, ActivityType::RunCreated, json!({})).await.unwrap();
        log.record(&a, ActivityType::StepStarted, json!({})).await.unwrap();
        log.record(&a, ActivityType::StepStarted, json!({})).await.unwrap();
        clock.set("2024-01-02T00:30:00Z");
        log.record(&a, ActivityType::RunTerminated, json!({})).await.unwrap();

        let aggregator = DailyAggregator::new(store.clone(), "test", 10, Duration::from_millis(10));
        assert_eq!(aggregator.drain_once().await.unwrap(), 4);
        assert_eq!(aggregator.drain_once().await.unwrap(), 0);

        let day1 = daily_counts(store.as_ref(), "2024-01-01").await.unwrap();
        assert_eq!(day1["total"], 3);
        assert_eq!(day1["counts"]["step_started"], 2);
        let day2 = daily_counts(store.as_ref(), "2024-01-02").await.unwrap();
        assert_eq!(day2["counts"]["run_terminated"], 1);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = ActivityEvent {
            activity_type: ActivityType::ApprovalRequested,
            run_id: "r".into(),
            task_id: "t".into(),
            project_id: "p".into(),
            user_id: "u".into(),
            timestamp: Utc::now(),
            details: Value::Null,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "approval_requested");
    }
}
