use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactValue {
    Value(String),
    Path(PathBuf),
}

impl ArtifactValue {
    /// Text substituted for `${{ artifacts.<key> }}`.
    pub fn render(&self) -> String {
        match self {
            ArtifactValue::Value(value) => value.clone(),
            ArtifactValue::Path(path) => path.to_string_lossy().to_string(),
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            ArtifactValue::Path(path) => Some(path),
            ArtifactValue::Value(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub value: ArtifactValue,
    pub producer: String,
    pub published_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(value: ArtifactValue, producer: impl Into<String>) -> Self {
        Self {
            value,
            producer: producer.into(),
            published_at: Utc::now(),
        }
    }
}

/// Run-scoped store through which stages hand outputs to their dependents.
///
/// Clones share the same storage. Writes replace any previous artifact under
/// the same key.
#[derive(Debug, Clone, Default)]
pub struct ArtifactBus {
    inner: Arc<RwLock<HashMap<String, Artifact>>>,
}

impl ArtifactBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, artifact: Artifact) -> Option<Artifact> {
        let key = key.into();
        debug!(artifact = key.as_str(), producer = artifact.producer.as_str(), "Publishing artifact");
        self.write().insert(key, artifact)
    }

    /// Publishes a whole batch under one lock so dependents never observe a
    /// partially published stage.
    pub fn publish_all(&self, batch: Vec<(String, Artifact)>) {
        let mut guard = self.write();
        for (key, artifact) in batch {
            debug!(artifact = key.as_str(), producer = artifact.producer.as_str(), "Publishing artifact");
            guard.insert(key, artifact);
        }
    }

    pub fn get(&self, key: &str, requester: &str) -> PipelineResult<Artifact> {
        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::ArtifactUnavailable {
                key: key.to_string(),
                stage: requester.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<String, Artifact> {
        self.read()
            .iter()
            .map(|(key, artifact)| (key.clone(), artifact.clone()))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Artifact>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Artifact>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
