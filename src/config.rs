//! Engine configuration.
//!
//! Read from `chaos-engine.toml`, layered file → environment → CLI:
//!
//! ```toml
//! [agent]
//! port = 19527
//! request_timeout_ms = 30000
//! prepare_timeout_ms = 300000
//!
//! [reconcile]
//! poll_interval_ms = 3000
//! max_attempts = 100
//!
//! [kubernetes]
//! api_server = "https://127.0.0.1:6443"
//! token = "..."
//!
//! [storage]
//! database = "chaos-engine.db"
//!
//! [logging]
//! filter = "chaos_engine=info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "chaos-engine.toml";

/// Settings for the chaos agent running on each host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Prepare commands (agent attach) are slow, so they get their own budget.
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
}

fn default_agent_port() -> u16 {
    19527
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_prepare_timeout_ms() -> u64 {
    300_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: default_agent_port(),
            request_timeout_ms: default_request_timeout_ms(),
            prepare_timeout_ms: default_prepare_timeout_ms(),
        }
    }
}

/// Status polling of remote resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Absent means poll until a terminal state is reported.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesConfig {
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite file; absent keeps everything in memory.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "chaos_engine=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Root of `chaos-engine.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from an explicit file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid chaos-engine.toml")
    }

    /// Resolve the layered configuration: the explicit file if given, else
    /// `chaos-engine.toml` in `dir` when present, else defaults; then
    /// environment overrides.
    pub fn resolve(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    Self::load(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CHAOS_*` overrides. The lookup is injected so tests don't touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("CHAOS_AGENT_PORT") {
            self.agent.port = port
                .parse()
                .with_context(|| format!("Invalid CHAOS_AGENT_PORT '{}'", port))?;
        }
        if let Some(interval) = lookup("CHAOS_POLL_INTERVAL_MS") {
            self.reconcile.poll_interval_ms = interval
                .parse()
                .with_context(|| format!("Invalid CHAOS_POLL_INTERVAL_MS '{}'", interval))?;
        }
        if let Some(server) = lookup("CHAOS_KUBE_API_SERVER") {
            self.kubernetes.api_server = server;
        }
        if let Some(token) = lookup("CHAOS_KUBE_TOKEN") {
            self.kubernetes.token = Some(token);
        }
        if let Some(database) = lookup("CHAOS_DATABASE") {
            self.storage.database = Some(PathBuf::from(database));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.request_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.prepare_timeout_ms)
    }
}
