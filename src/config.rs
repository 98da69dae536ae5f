//! Configuration loading and defaults for deepseek-agent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::permission::{ApprovalMode, FingerprintPolicy, FingerprintRule, ToolFamily};

pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MAX_STEPS: u32 = 100;

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub backoff_secs: Option<f64>,
    pub max_delay: Option<f64>,
}

/// Resolved retry policy: linear backoff of `attempt * backoff_secs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_secs: f64,
    pub max_delay: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_secs: 1.0,
            max_delay: 30.0,
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_secs * f64::from(attempt);
        let delay = delay.min(self.max_delay);
        // Clamp guards against NaN/negative from misconfigured values
        let delay = if delay.is_nan() { 0.0 } else { delay.clamp(0.0, 300.0) };
        Duration::from_secs_f64(delay)
    }
}

/// Per-family fingerprint rules from `[permissions.rules]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FingerprintRulesConfig {
    pub file: Option<FingerprintRule>,
    pub shell: Option<FingerprintRule>,
    pub network: Option<FingerprintRule>,
    pub mcp: Option<FingerprintRule>,
    pub other: Option<FingerprintRule>,
}

/// Raw `[permissions]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsConfig {
    /// `ask` (prompt before tools run) or `auto` (approve everything).
    pub approval_policy: Option<String>,
    #[serde(default)]
    pub rules: FingerprintRulesConfig,
    /// Extra tool-name to family assignments.
    #[serde(default)]
    pub tools: HashMap<String, ToolFamily>,
}

/// Resolved configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub mcp_config_path: Option<String>,
    pub workspace: Option<String>,
    pub max_steps: Option<u32>,
    pub retry: Option<RetryConfig>,
    pub permissions: Option<PermissionsConfig>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.map(expand_pathbuf).or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => load_config_file(path)?,
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Validate that critical config fields are sane.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        if let Some(retry) = &self.retry
            && retry.max_attempts == Some(0)
        {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.max_steps == Some(0) {
            anyhow::bail!("max_steps must be at least 1");
        }
        if let Some(policy) = self
            .permissions
            .as_ref()
            .and_then(|p| p.approval_policy.as_deref())
            && ApprovalMode::parse(policy).is_none()
        {
            anyhow::bail!("Invalid approval_policy '{policy}': expected ask or auto.");
        }
        Ok(())
    }

    /// API key, required for the hosted backend.
    pub fn api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("API key not configured. Set DEEPSEEK_API_KEY or api_key in config.toml")
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS)
    }

    #[must_use]
    pub fn mcp_config_path(&self) -> PathBuf {
        self.mcp_config_path
            .as_deref()
            .map(expand_path)
            .or_else(default_mcp_config_path)
            .unwrap_or_else(|| PathBuf::from("mcp.json"))
    }

    #[must_use]
    pub fn workspace(&self) -> PathBuf {
        self.workspace
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_attempts: cfg.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_secs: cfg.backoff_secs.unwrap_or(defaults.backoff_secs),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
        }
    }

    #[must_use]
    pub fn approval_mode(&self) -> ApprovalMode {
        self.permissions
            .as_ref()
            .and_then(|p| p.approval_policy.as_deref())
            .and_then(ApprovalMode::parse)
            .unwrap_or_default()
    }

    /// Fingerprint policy with configured rules layered over the defaults.
    #[must_use]
    pub fn fingerprint_policy(&self) -> FingerprintPolicy {
        let mut policy = FingerprintPolicy::default();
        let Some(permissions) = &self.permissions else {
            return policy;
        };

        let rules = &permissions.rules;
        for (family, rule) in [
            (ToolFamily::File, &rules.file),
            (ToolFamily::Shell, &rules.shell),
            (ToolFamily::Network, &rules.network),
            (ToolFamily::Mcp, &rules.mcp),
            (ToolFamily::Other, &rules.other),
        ] {
            if let Some(rule) = rule {
                policy.set_rule(family, rule.clone());
            }
        }
        for (tool, family) in &permissions.tools {
            policy.assign_tool(tool.clone(), *family);
        }
        policy
    }
}

// === Defaults ===

fn load_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    env_config_path().or_else(home_config_path)
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".deepseek").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    let path = std::env::var("DEEPSEEK_CONFIG_PATH").ok()?;
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(expand_path(trimmed))
}

fn default_mcp_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".deepseek").join("mcp.json"))
}

fn expand_pathbuf(path: PathBuf) -> PathBuf {
    if let Some(raw) = path.to_str() {
        return expand_path(raw);
    }
    path
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("DEEPSEEK_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = std::env::var("DEEPSEEK_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Ok(value) = std::env::var("DEEPSEEK_MODEL") {
        config.model = Some(value);
    }
    if let Ok(value) = std::env::var("DEEPSEEK_MCP_CONFIG") {
        config.mcp_config_path = Some(value);
    }
}
