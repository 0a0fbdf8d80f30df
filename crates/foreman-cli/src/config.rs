//! Configuration Vault – reads/writes `~/.foreman/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use foreman_kernel::{GateConfig, RolePolicy};
use foreman_runtime::ExecutorConfig;
use foreman_runtime::pipeline::{DEPLOYMENT_AGENT, DEVELOPER_AGENT, QA_AGENT, TESTER_AGENT};
use serde::{Deserialize, Serialize};

/// Persisted operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// Approval timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Identity the executor presents to the permission gate.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_recheck_interval_secs")]
    pub recheck_interval_secs: u64,
    /// Per-stage time limit.  Absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

/// Which built-in simulated agents to register at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_enabled_agents")]
    pub enabled: Vec<String>,
    /// Simulated work time per stage.
    #[serde(default = "default_work_ms")]
    pub work_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    /// agent → actions it may perform (`"*"` for all).
    #[serde(default = "default_grants")]
    pub grants: BTreeMap<String, Vec<String>>,
    /// (action, resource) pairs that need human sign-off.
    #[serde(default = "default_approval_required")]
    pub approval_required: Vec<ApprovalRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub action: String,
    pub resource: String,
}

fn default_approval_ttl_secs() -> u64 {
    3600
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_max_poll_attempts() -> u32 {
    360
}
fn default_agent_name() -> String {
    "executor".to_string()
}
fn default_recheck_interval_secs() -> u64 {
    5
}
fn default_enabled_agents() -> Vec<String> {
    [DEVELOPER_AGENT, TESTER_AGENT, QA_AGENT, DEPLOYMENT_AGENT]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_work_ms() -> u64 {
    250
}
fn default_grants() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(default_agent_name(), vec!["DEPLOY".to_string()])])
}
fn default_approval_required() -> Vec<ApprovalRule> {
    vec![ApprovalRule {
        action: "DEPLOY".to_string(),
        resource: "prod".to_string(),
    }]
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            approval_ttl_secs: default_approval_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            recheck_interval_secs: default_recheck_interval_secs(),
            stage_timeout_secs: None,
        }
    }
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled_agents(),
            work_ms: default_work_ms(),
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            grants: default_grants(),
            approval_required: default_approval_required(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions into runtime settings
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            approval_ttl: Duration::from_secs(self.gate.approval_ttl_secs),
            poll_interval: Duration::from_secs(self.gate.poll_interval_secs.max(1)),
            max_poll_attempts: self.gate.max_poll_attempts,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            agent_name: self.executor.agent_name.clone(),
            recheck_interval: Duration::from_secs(self.executor.recheck_interval_secs.max(1)),
            stage_timeout: self.executor.stage_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn role_policy(&self) -> RolePolicy {
        let mut policy = RolePolicy::new();
        for (agent, actions) in &self.policy.grants {
            for action in actions {
                policy.grant(agent, action);
            }
        }
        for rule in &self.policy.approval_required {
            policy.require_approval(&rule.action, &rule.resource);
        }
        policy
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.foreman/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".foreman").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `FOREMAN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FOREMAN_AGENT_NAME` | `executor.agent_name` |
/// | `FOREMAN_APPROVAL_TTL_SECS` | `gate.approval_ttl_secs` |
/// | `FOREMAN_POLL_INTERVAL_SECS` | `gate.poll_interval_secs` |
/// | `FOREMAN_MAX_POLL_ATTEMPTS` | `gate.max_poll_attempts` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FOREMAN_AGENT_NAME")
        && !v.trim().is_empty()
    {
        cfg.executor.agent_name = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("FOREMAN_APPROVAL_TTL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.gate.approval_ttl_secs = secs;
    }
    if let Ok(v) = std::env::var("FOREMAN_POLL_INTERVAL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.gate.poll_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("FOREMAN_MAX_POLL_ATTEMPTS")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.gate.max_poll_attempts = n;
    }
}

/// Save the config to disk, creating `~/.foreman/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
