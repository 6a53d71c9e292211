//! Skill manifest parsing: one document per skill directory, at
//! `skill.yaml` / `skill.yml` / `skill.json` (first found wins in that
//! order). A sibling `SKILL.md` (or the overridden path) carries
//! human/agent-readable instructions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no skill.yaml, skill.yml, or skill.json found in {0}")]
    NotFound(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid skill name {0:?}: must match ^[a-z][a-z0-9-]*$")]
    InvalidName(String),
    #[error("description exceeds 200 characters")]
    DescriptionTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    BrokerOnly,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory_limit", rename = "memoryLimit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit", rename = "cpuLimit")]
    pub cpu_limit: String,
    #[serde(default = "default_timeout_seconds", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_network")]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

fn default_image() -> String {
    "seks/skill-runner:latest".to_string()
}
fn default_memory_limit() -> String {
    "512m".to_string()
}
fn default_cpu_limit() -> String {
    "1".to_string()
}
fn default_timeout_seconds() -> u64 {
    300
}
fn default_network() -> NetworkPolicy {
    NetworkPolicy::BrokerOnly
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            timeout_seconds: default_timeout_seconds(),
            network: default_network(),
            env: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub version: u32,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Vec<String>>,
    #[serde(default)]
    pub always: bool,
    #[serde(default, rename = "skillMdPath", skip_serializing_if = "Option::is_none")]
    pub skill_md_path: Option<String>,
}

impl SkillManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut chars = self.name.chars();
        let starts_lower = chars.next().map(|c| c.is_ascii_lowercase()).unwrap_or(false);
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !starts_lower || !rest_ok {
            return Err(ManifestError::InvalidName(self.name.clone()));
        }
        if self.description.chars().count() > 200 {
            return Err(ManifestError::DescriptionTooLong);
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.container.as_ref().map(|c| c.timeout_seconds).unwrap_or(default_timeout_seconds()),
        )
    }

    /// Load the manifest from a skill directory, trying `skill.yaml`,
    /// `skill.yml`, then `skill.json` in that order.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ManifestError> {
        for name in ["skill.yaml", "skill.yml"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                let text = std::fs::read_to_string(&candidate)?;
                let manifest: SkillManifest = serde_yaml::from_str(&text)?;
                manifest.validate()?;
                return Ok(manifest);
            }
        }
        let json_candidate = dir.join("skill.json");
        if json_candidate.is_file() {
            let text = std::fs::read_to_string(&json_candidate)?;
            let manifest: SkillManifest = serde_json::from_str(&text)?;
            manifest.validate()?;
            return Ok(manifest);
        }
        Err(ManifestError::NotFound(dir.to_path_buf()))
    }

    pub fn instructions_path(&self, dir: &Path) -> PathBuf {
        match &self.skill_md_path {
            Some(p) => dir.join(p),
            None => dir.join("SKILL.md"),
        }
    }
}
