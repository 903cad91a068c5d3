use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::definition::{ActionSpec, GatePolicy, PipelineDefinition, StageDefinition, TargetSpec};

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub definition_version: u32,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    pub gate: GatePolicy,
    pub actions: Vec<String>,
    /// SHA256 over the stage's actions and target, as canonical JSON.
    pub definition_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

pub fn build_lock(definition: &PipelineDefinition) -> PipelineLock {
    PipelineLock {
        definition_version: definition.version,
        pipeline: definition.name.clone(),
        generated_at: Utc::now(),
        stages: definition
            .stages
            .iter()
            .map(|stage| StageLock {
                id: stage.id.clone(),
                needs: stage.needs.clone(),
                gate: stage.gate,
                actions: stage.actions.iter().map(|a| a.name.clone()).collect(),
                definition_hash: hash_stage(stage),
                target: stage.target.as_ref().map(|t| t.name.clone()),
            })
            .collect(),
    }
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<PipelineLock> {
    let lock = build_lock(definition);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

#[derive(Serialize)]
struct HashedStage<'a> {
    actions: &'a [ActionSpec],
    target: Option<&'a TargetSpec>,
}

fn hash_stage(stage: &StageDefinition) -> String {
    let mut hasher = Sha256::new();
    // serde_json::Value maps are sorted, so the encoding is stable.
    let value = serde_json::to_value(HashedStage {
        actions: &stage.actions,
        target: stage.target.as_ref(),
    })
    .unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(stage.id.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
