// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration Types
//
// Kubernetes-style manifest configuring the concurrent execution engine:
// - Fork-join executor defaults (timeouts, concurrency, grace period, retention)
// - Deadlock detector cadence and victim policy
// - Event bus capacity
// - Logging and metrics settings consumed by the CLI

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::wait_graph::DeadlockPolicy;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "ParallelEngineConfig";

/// Top-level Kubernetes-style engine configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ParallelEngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: EngineConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigSpec {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub deadlock_detector: DeadlockDetectorConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deadline applied to batches submitted without one
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub default_batch_timeout: Duration,

    /// Concurrency cap applied to batches submitted without one
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// Per-branch timeout for tasks that carry none
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub default_branch_timeout: Option<Duration>,

    /// How long a batch waits for cancelled branches to acknowledge
    #[serde(default = "default_cancel_grace_period", with = "humantime_serde")]
    pub cancel_grace_period: Duration,

    /// How long an unconsumed terminal batch stays queryable in memory
    #[serde(default = "default_retention_window", with = "humantime_serde")]
    pub retention_window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockDetectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_detector_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default)]
    pub policy: DeadlockPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer; slow subscribers lag past this many events
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_concurrency() -> usize {
    8
}

fn default_cancel_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_retention_window() -> Duration {
    Duration::from_secs(600)
}

fn default_detector_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_batch_timeout: default_batch_timeout(),
            default_max_concurrency: default_max_concurrency(),
            default_branch_timeout: None,
            cancel_grace_period: default_cancel_grace_period(),
            retention_window: default_retention_window(),
        }
    }
}

impl Default for DeadlockDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_detector_interval(),
            policy: DeadlockPolicy::default(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for EngineConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-parallel".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: EngineConfigSpec::default(),
        }
    }
}

impl EngineConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml).context("Failed to parse engine config")?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_PARALLEL_CONFIG environment variable
    /// 2. ./aegis-parallel.yaml (working directory)
    /// 3. ~/.aegis/parallel.yaml (user home)
    /// 4. /etc/aegis/parallel.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_PARALLEL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-parallel.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("parallel.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/aegis/parallel.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading engine configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(path) => {
                tracing::info!("Loading engine configuration from discovered path: {:?}", path);
                Self::from_yaml_file(path)?
            }
            None => {
                tracing::debug!("No engine configuration file found. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("AEGIS_PARALLEL_MAX_CONCURRENCY") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: AEGIS_PARALLEL_MAX_CONCURRENCY={}", n);
                    self.spec.executor.default_max_concurrency = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AEGIS_PARALLEL_MAX_CONCURRENCY: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("AEGIS_PARALLEL_DEADLOCK_POLICY") {
            match val.parse::<DeadlockPolicy>() {
                Ok(policy) => {
                    tracing::info!("Environment override: AEGIS_PARALLEL_DEADLOCK_POLICY={}", policy);
                    self.spec.deadlock_detector.policy = policy;
                }
                Err(e) => tracing::warn!("{}. Ignoring AEGIS_PARALLEL_DEADLOCK_POLICY.", e),
            }
        }

        if let Some(val) = lookup("AEGIS_PARALLEL_DETECTOR_INTERVAL") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(interval) => {
                    tracing::info!("Environment override: AEGIS_PARALLEL_DETECTOR_INTERVAL={}", val);
                    self.spec.deadlock_detector.interval = interval;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AEGIS_PARALLEL_DETECTOR_INTERVAL: '{}'. Expected e.g. '2s'. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let executor = &self.spec.executor;
        if executor.default_max_concurrency == 0 {
            anyhow::bail!("spec.executor.default_max_concurrency must be at least 1");
        }
        if executor.default_batch_timeout.is_zero() {
            anyhow::bail!("spec.executor.default_batch_timeout must be positive");
        }
        if executor.default_branch_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("spec.executor.default_branch_timeout must be positive when set");
        }

        if self.spec.deadlock_detector.interval.is_zero() {
            anyhow::bail!("spec.deadlock_detector.interval must be positive");
        }

        if self.spec.events.capacity == 0 {
            anyhow::bail!("spec.events.capacity must be at least 1");
        }

        match self.spec.observability.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown log format '{}'. Expected 'text' or 'json'", other),
        }

        Ok(())
    }
}
