use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration as StdDuration;

use crate::cancellation::{
    CancellationSettings, DEFAULT_BATCH_SIZE, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS,
};
use crate::policy::FeatureFlags;

const CANDIDATES: [&str; 4] = [
    "ci-autocancel.toml",
    "ci-autocancel.json",
    "ci-autocancel.yaml",
    "ci-autocancel.yml",
];

/// Configuration file structure for ci-autocancel.
///
/// Loaded from `--config` or from the current directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub gitlab: GitLabConfig,

    /// Redundant pipeline cancellation tuning
    #[serde(default)]
    pub cancellation: CancellationConfig,

    #[serde(default)]
    pub schedules: SchedulesConfig,

    /// Feature flags, globally or per project
    #[serde(default)]
    pub features: FeatureFlags,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitLabConfig {
    /// GitLab personal access token
    pub token: Option<String>,

    /// GitLab instance base URL, also used for pipeline links
    #[serde(default = "default_gitlab_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CancellationConfig {
    /// Candidates loaded per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How far back same-ref pipelines are considered
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,

    #[serde(default = "default_max_lock_attempts")]
    pub max_lock_attempts: u32,

    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulesConfig {
    /// Period of `sweep --watch`
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_gitlab_base_url(),
        }
    }
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lookback_hours: default_lookback_hours(),
            max_lock_attempts: default_max_lock_attempts(),
            lock_backoff_ms: default_lock_backoff_ms(),
        }
    }
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_gitlab_base_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_lookback_hours() -> u32 {
    24 * 7
}

fn default_max_lock_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_lock_backoff_ms() -> u64 {
    DEFAULT_BACKOFF.as_millis() as u64
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./ci-autocancel.toml
    /// 3. ./ci-autocancel.json
    /// 4. ./ci-autocancel.yaml
    /// 5. ./ci-autocancel.yml
    ///
    /// Returns default configuration if no file is found. An explicit path
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        for candidate in &CANDIDATES {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn cancellation_settings(&self) -> CancellationSettings {
        CancellationSettings {
            batch_size: self.cancellation.batch_size.max(1),
            lookback: chrono::Duration::hours(i64::from(self.cancellation.lookback_hours)),
            max_lock_attempts: self.cancellation.max_lock_attempts.max(1),
            lock_backoff: StdDuration::from_millis(self.cancellation.lock_backoff_ms),
            web_base_url: Some(self.gitlab.base_url.clone()),
        }
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.schedules.sweep_interval_secs.max(1))
    }
}
