use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::domain::{Build, Pipeline, PipelineSchedule, Project, RefHead, User};

/// Serialized contents of a [`MemoryStore`](super::MemoryStore).
///
/// The CLI keeps one snapshot file per workspace, by default at
/// - Linux: `~/.local/share/ci-autocancel/state.json`
/// - macOS: `~/Library/Application Support/ci-autocancel/state.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub refs: Vec<RefHead>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub builds: Vec<Build>,
    #[serde(default)]
    pub schedules: Vec<PipelineSchedule>,
}

impl StateSnapshot {
    /// Platform data directory location used when no `--state` is given.
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("No data directory found")?
            .join("ci-autocancel");

        fs::create_dir_all(&data_dir).with_context(|| {
            format!("Failed to create data directory: {}", data_dir.display())
        })?;

        Ok(data_dir.join("state.json"))
    }

    /// Loads a snapshot, or an empty one when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No state file at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parses a snapshot by file extension (TOML, JSON or YAML).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let snapshot = match extension(path) {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML state: {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML state: {}", path.display()))?,
            _ => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON state: {}", path.display()))?,
        };

        debug!("Loaded state from: {}", path.display());
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match extension(path) {
            "toml" => toml::to_string_pretty(self)?,
            "yaml" | "yml" => serde_yaml::to_string(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };

        fs::write(path, contents)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        debug!(
            "Saved {} pipelines to state: {}",
            self.pipelines.len(),
            path.display()
        );
        Ok(())
    }
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("")
}
