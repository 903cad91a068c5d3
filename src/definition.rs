use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineDefinition {
    pub version: u32,
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Secret catalogue: secret name -> where its value comes from.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretSource>,
    pub stages: Vec<StageDefinition>,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline definition: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        Ok(definition)
    }

    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    /// Every secret name referenced anywhere in the definition.
    pub fn declared_secrets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.keys().cloned().collect();
        for stage in &self.stages {
            for action in &stage.actions {
                names.extend(action.secrets.iter().cloned());
            }
            if let Some(target) = &stage.target {
                names.extend(target.secrets.iter().cloned());
            }
        }
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretSource {
    /// Environment variable holding the value. Defaults to the secret name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Whether a failure of the stage blocks the stages that need it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    #[default]
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionSpec {
    pub name: String,
    pub run: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub produces: BTreeMap<String, ArtifactSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl ActionSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// How an action declares one of its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ArtifactSpec {
    /// File path (or glob) relative to the action's working directory.
    Path { path: String },
    /// Literal value, templates allowed.
    Value { value: String },
    /// Trimmed stdout of the action.
    Stdout { stdout: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Long-running child process owned by the engine.
    #[default]
    Process,
    /// Detached container started by a CLI whose stdout is the container id.
    Container,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetSpec {
    #[serde(default = "default_target_name")]
    pub name: String,
    #[serde(default)]
    pub kind: TargetKind,
    pub run: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Teardown command for container targets; `${{ target.id }}` is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<CommandSpec>,
    /// Address tests should talk to, exposed as `${{ target.address }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub probe: ProbeSpec,
}

fn default_target_name() -> String {
    "target".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandSpec {
    pub run: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_backoff")]
    pub backoff: f64,
    #[serde(default = "default_probe_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    30_000
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_probe_backoff() -> f64 {
    1.5
}

fn default_probe_max_interval_ms() -> u64 {
    5_000
}

/// The single check a probe performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    Tcp(String),
    Command(CommandSpec),
}

impl ProbeSpec {
    pub fn check(&self) -> Result<ProbeCheck> {
        match (&self.tcp, &self.command) {
            (Some(address), None) => Ok(ProbeCheck::Tcp(address.clone())),
            (None, Some(command)) => Ok(ProbeCheck::Command(command.clone())),
            (Some(_), Some(_)) => bail!("probe must declare either 'tcp' or 'command', not both"),
            (None, None) => bail!("probe must declare 'tcp' or 'command'"),
        }
    }
}
