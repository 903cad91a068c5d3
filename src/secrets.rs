//! Named credential resolution.
//!
//! Values only ever leave this module as [`SecretValue`]s, whose `Debug`
//! output is redacted, and are handed to child processes as environment
//! variables. Nothing here logs or persists a value.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::definition::PipelineDefinition;
use crate::error::{PipelineError, PipelineResult};

pub const REDACTED: &str = "***";

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

pub trait SecretStore: Send + Sync {
    fn resolve(&self, name: &str) -> Option<SecretValue>;

    /// Environment variables that carry secret material in the engine's own
    /// process. They are removed from every child environment so an action
    /// cannot inherit a secret it did not declare.
    fn backing_env_vars(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Reads secrets from the process environment using the definition's
/// catalogue (secret name -> env var, defaulting to the secret name).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    sources: BTreeMap<String, String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definition(definition: &PipelineDefinition) -> Self {
        let mut store = Self::new();
        for name in definition.declared_secrets() {
            let var = definition
                .secrets
                .get(&name)
                .and_then(|source| source.env.clone())
                .unwrap_or_else(|| name.clone());
            store.sources.insert(name, var);
        }
        store
    }

    pub fn with_source(mut self, name: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.sources.insert(name.into(), env_var.into());
        self
    }

    fn env_var_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.sources.get(name).map(String::as_str).unwrap_or(name)
    }
}

impl SecretStore for EnvSecretStore {
    fn resolve(&self, name: &str) -> Option<SecretValue> {
        let var = self.env_var_for(name);
        let value = std::env::var(var).ok()?;
        debug!(secret = name, source = var, "Resolved secret from environment");
        Some(SecretValue::new(value))
    }

    fn backing_env_vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = self
            .sources
            .iter()
            .flat_map(|(name, var)| [name.clone(), var.clone()])
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }
}

/// Fixed name -> value map, loaded from a YAML secrets file or built in code.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    values: BTreeMap<String, SecretValue>,
}

impl StaticSecretStore {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), SecretValue::new(v)))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file: {}", path.display()))?;
        let values: BTreeMap<String, String> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets file: {}", path.display()))?;
        Ok(Self::from_pairs(values))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretStore for StaticSecretStore {
    fn resolve(&self, name: &str) -> Option<SecretValue> {
        self.values.get(name).cloned()
    }
}

/// First store that knows the name wins.
#[derive(Clone, Default)]
pub struct ChainSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.stores.push(store);
        self
    }
}

impl SecretStore for ChainSecretStore {
    fn resolve(&self, name: &str) -> Option<SecretValue> {
        self.stores.iter().find_map(|store| store.resolve(name))
    }

    fn backing_env_vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = self
            .stores
            .iter()
            .flat_map(|store| store.backing_env_vars())
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }
}

/// The secrets one action declared, resolved just before it runs.
#[derive(Debug, Clone, Default)]
pub struct ScopedSecrets {
    values: Vec<(String, SecretValue)>,
}

impl ScopedSecrets {
    pub fn resolve(store: &dyn SecretStore, declared: &[String]) -> PipelineResult<Self> {
        let mut values = Vec::with_capacity(declared.len());
        for name in declared {
            let value = store
                .resolve(name)
                .ok_or_else(|| PipelineError::SecretUnavailable(name.clone()))?;
            values.push((name.clone(), value));
        }
        Ok(Self { values })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replaces every occurrence of a secret value with `***`.
    pub fn redact(&self, text: &str) -> String {
        redact_values(text, self.values.iter().map(|(_, value)| value))
    }
}

/// Replaces every occurrence of any of `values` in `text` with `***`.
pub fn redact_values<'a>(text: &str, values: impl IntoIterator<Item = &'a SecretValue>) -> String {
    let mut redacted = text.to_string();
    for value in values {
        if !value.expose().is_empty() {
            redacted = redacted.replace(value.expose(), REDACTED);
        }
    }
    redacted
}
