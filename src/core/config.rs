use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::approval::ApprovalPolicy;
use crate::core::budget::LimitOverrides;
use crate::core::retry::RetryPolicy;
use crate::core::workers::WorkerKind;

pub const CONFIG_FILE: &str = "switchyard.toml";
pub const DB_FILE: &str = "switchyard.db";

/// Resolve the data directory: `SWITCHYARD_DATA_DIR`, else `~/.switchyard`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("SWITCHYARD_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("could not resolve home directory"))?;
    Ok(home.join(".switchyard"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub approval: ApprovalPolicy,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    /// Per-kind contract overrides, keyed by worker kind name.
    #[serde(default)]
    pub workers: HashMap<String, WorkerOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub run: LimitOverrides,
    #[serde(default)]
    pub user: LimitOverrides,
    #[serde(default)]
    pub global: LimitOverrides,
    /// Fraction of a limit at which a one-time warning is raised.
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Empty disables the remote fallback.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Six-field expression (seconds first) driving the daemon tick.
    #[serde(default = "default_tick_cron")]
    pub tick_cron: String,
    /// Six-field expression for the approval expiry sweep.
    #[serde(default = "default_sweep_cron")]
    pub approval_sweep_cron: String,
    #[serde(default = "default_due_batch")]
    pub due_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_aggregate_batch")]
    pub aggregate_batch: usize,
    #[serde(default = "default_aggregate_interval_ms")]
    pub aggregate_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOverride {
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub required_outputs: Option<Vec<String>>,
    pub mandatory_outputs: Option<Vec<String>>,
    pub always_require_approval: Option<bool>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_warn_ratio() -> f64 {
    0.8
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_max_polls() -> u32 {
    120
}
fn default_true() -> bool {
    true
}
fn default_tick_cron() -> String {
    "0 * * * * *".to_string()
}
fn default_sweep_cron() -> String {
    "30 * * * * *".to_string()
}
fn default_due_batch() -> usize {
    50
}
fn default_aggregate_batch() -> usize {
    100
}
fn default_aggregate_interval_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            budget: BudgetConfig::default(),
            approval: ApprovalPolicy::default(),
            remote: RemoteConfig::default(),
            scheduler: SchedulerConfig::default(),
            activity: ActivityConfig::default(),
            workers: HashMap::new(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            run: LimitOverrides::default(),
            user: LimitOverrides::default(),
            global: LimitOverrides::default(),
            warn_ratio: default_warn_ratio(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RemoteConfig {
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_cron: default_tick_cron(),
            approval_sweep_cron: default_sweep_cron(),
            due_batch: default_due_batch(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            aggregate_batch: default_aggregate_batch(),
            aggregate_interval_ms: default_aggregate_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let mut config: EngineConfig = toml::from_str(&content)?;

        if !(0.0..=1.0).contains(&config.budget.warn_ratio) {
            warn!(
                "budget.warn_ratio {} out of range, falling back to {}",
                config.budget.warn_ratio,
                default_warn_ratio()
            );
            config.budget.warn_ratio = default_warn_ratio();
        }

        info!(
            "Loaded engine config: remote={}, scheduler={}, worker overrides={}",
            if config.remote.is_enabled() { config.remote.base_url.as_str() } else { "disabled" },
            config.scheduler.enabled,
            config.workers.len()
        );
        Ok(config)
    }

    /// Worker overrides keyed by kind. Unknown kind names are skipped with a warning.
    pub fn worker_overrides(&self) -> HashMap<WorkerKind, WorkerOverride> {
        let mut out = HashMap::new();
        for (name, o) in &self.workers {
            match WorkerKind::parse(name) {
                Some(kind) => {
                    out.insert(kind, o.clone());
                }
                None => warn!("Ignoring [workers.{}]: unknown worker kind", name),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::approval::RiskLevel;

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.budget.warn_ratio, 0.8);
        assert!(!config.remote.is_enabled());
        assert!(config.scheduler.enabled);
        assert!(config.approval.auto_approve_enabled);
    }

    #[tokio::test]
    async fn load_reads_sections_and_keeps_unset_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
log_level = "debug"

[budget]
warn_ratio = 0.9

[budget.run]
llm_tokens = 5000

[approval]
max_auto_approve_level = "medium"

[remote]
base_url = "http://localhost:5678"

[workers.code-generation]
max_retries = 5
mandatory_outputs = ["code"]

[workers.not_a_worker]
max_retries = 1
"#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.budget.warn_ratio, 0.9);
        assert_eq!(config.budget.run.llm_tokens, Some(5000));
        assert_eq!(config.budget.run.api_calls, None);
        assert_eq!(config.approval.max_auto_approve_level, RiskLevel::Medium);
        assert!(config.approval.auto_approve_enabled);
        assert!(config.remote.is_enabled());
        assert_eq!(config.remote.max_polls, 120);

        let overrides = config.worker_overrides();
        assert_eq!(overrides.len(), 1);
        let o = &overrides[&WorkerKind::CodeGeneration];
        assert_eq!(o.max_retries, Some(5));
        assert_eq!(o.mandatory_outputs.as_deref(), Some(&["code".to_string()][..]));
    }

    #[tokio::test]
    async fn out_of_range_warn_ratio_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[budget]\nwarn_ratio = 3.0\n").unwrap();
        let config = EngineConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.budget.warn_ratio, 0.8);
    }
}
