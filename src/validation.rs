use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::definition::{ActionSpec, ArtifactSpec, PipelineDefinition, SUPPORTED_VERSION, StageDefinition};
use crate::scheduler::JobGraph;
use crate::template;

/// Larger factors reach `max_interval_ms` after one attempt anyway.
const MAX_PROBE_BACKOFF: f64 = 10.0;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks that need no tool, secret or network access.
pub fn validate_definition(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.version != SUPPORTED_VERSION {
        report.errors.push(format!(
            "Unsupported definition version: {} (expected {SUPPORTED_VERSION})",
            definition.version
        ));
    }
    if definition.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut seen = HashSet::new();
    for stage in &definition.stages {
        if !is_valid_id(&stage.id) {
            report.errors.push(format!(
                "Stage id '{}' must be non-empty and use only letters, digits, '-' or '_'",
                stage.id
            ));
        }
        if !seen.insert(stage.id.as_str()) {
            report
                .errors
                .push(format!("Stage id '{}' is declared more than once", stage.id));
        }
    }
    for stage in &definition.stages {
        for need in &stage.needs {
            if !seen.contains(need.as_str()) {
                report
                    .errors
                    .push(format!("Stage '{}' needs unknown stage '{need}'", stage.id));
            }
        }
    }

    // Structural errors above make the graph meaningless; report them alone.
    let graph = if report.is_ok() {
        match JobGraph::build(definition) {
            Ok(graph) => Some(graph),
            Err(err) => {
                report.errors.push(capitalize(&err.to_string()));
                None
            }
        }
    } else {
        None
    };

    let producers = artifact_producers(definition, &mut report);
    let secret_vars = secret_env_vars(definition);
    for stage in &definition.stages {
        let upstream = graph
            .as_ref()
            .map(|graph| graph.transitive_dependencies(&stage.id));
        report.merge(validate_stage(
            definition,
            stage,
            upstream.as_ref(),
            &producers,
            &secret_vars,
        ));
    }

    report
}

fn validate_stage(
    definition: &PipelineDefinition,
    stage: &StageDefinition,
    upstream: Option<&BTreeSet<String>>,
    producers: &BTreeMap<String, Vec<String>>,
    secret_vars: &BTreeSet<String>,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let ctx = format!("Stage '{}'", stage.id);

    if stage.actions.is_empty() {
        report.warnings.push(format!("{ctx} has no actions"));
    }

    if let Some(target) = &stage.target {
        let tctx = format!("{ctx} target '{}'", target.name);
        if target.run.trim().is_empty() {
            report.errors.push(format!("{tctx}: 'run' cannot be empty"));
        }
        if let Err(err) = target.probe.check() {
            report.errors.push(format!("{tctx}: {err}"));
        }
        if target.probe.timeout_ms == 0 {
            report
                .errors
                .push(format!("{tctx}: readiness timeout must be greater than zero"));
        }
        if target.probe.interval_ms == 0 {
            report
                .errors
                .push(format!("{tctx}: probe interval must be greater than zero"));
        }
        if !(1.0..=MAX_PROBE_BACKOFF).contains(&target.probe.backoff) {
            report.errors.push(format!(
                "{tctx}: probe backoff must be between 1.0 and {MAX_PROBE_BACKOFF} (got {})",
                target.probe.backoff
            ));
        }
        if target.probe.max_interval_ms < target.probe.interval_ms {
            report.warnings.push(format!(
                "{tctx}: max_interval_ms is below interval_ms; the interval will not grow"
            ));
        }
        let mut fields = vec![target.run.as_str()];
        fields.extend(target.args.iter().map(String::as_str));
        fields.extend(target.env.values().map(String::as_str));
        fields.extend(target.address.iter().map(String::as_str));
        check_expressions(&tctx, &fields, &mut report, |namespace, key| {
            check_reference(namespace, key, false, secret_vars, |artifact| {
                upstream_produces(upstream, producers, artifact)
            })
        });
        report.merge(check_catalogue(definition, &tctx, &target.secrets));
    }

    let mut action_names = HashSet::new();
    let mut produced_here: BTreeSet<&str> = BTreeSet::new();
    for (idx, action) in stage.actions.iter().enumerate() {
        let actx = format!("{ctx} action {} ('{}')", idx + 1, action.name);
        if !action_names.insert(action.name.as_str()) {
            report
                .warnings
                .push(format!("{ctx} declares action '{}' more than once", action.name));
        }
        if action.run.trim().is_empty() {
            report.errors.push(format!("{actx}: 'run' cannot be empty"));
        }
        if action.timeout_secs == Some(0) {
            report
                .errors
                .push(format!("{actx}: timeout_secs must be greater than zero"));
        }

        let has_target = stage.target.is_some();
        check_expressions(&actx, &action_fields(action), &mut report, |namespace, key| {
            check_reference(namespace, key, has_target, secret_vars, |artifact| {
                produced_here.contains(artifact) || upstream_produces(upstream, producers, artifact)
            })
        });
        report.merge(check_catalogue(definition, &actx, &action.secrets));
        produced_here.extend(action.produces.keys().map(String::as_str));
    }

    report
}

/// Every templated string of an action, including `value` outputs.
fn action_fields(action: &ActionSpec) -> Vec<&str> {
    let mut fields = vec![action.run.as_str()];
    fields.extend(action.args.iter().map(String::as_str));
    fields.extend(action.env.values().map(String::as_str));
    fields.extend(action.workdir.iter().map(String::as_str));
    for spec in action.produces.values() {
        match spec {
            ArtifactSpec::Path { path } => fields.push(path.as_str()),
            ArtifactSpec::Value { value } => fields.push(value.as_str()),
            ArtifactSpec::Stdout { .. } => {}
        }
    }
    fields
}

fn check_expressions<F>(ctx: &str, fields: &[&str], report: &mut ValidationReport, check: F)
where
    F: Fn(&str, &str) -> Option<String>,
{
    for field in fields {
        for expr in template::expressions(field) {
            if let Some(problem) = check(expr.namespace, expr.key) {
                report.errors.push(format!("{ctx}: {problem}"));
            }
        }
    }
}

fn check_reference(
    namespace: &str,
    key: &str,
    has_target: bool,
    secret_vars: &BTreeSet<String>,
    artifact_known: impl Fn(&str) -> bool,
) -> Option<String> {
    match namespace {
        "artifacts" if !artifact_known(key) => Some(format!(
            "artifact '{key}' is not produced by an earlier action or an upstream stage"
        )),
        "artifacts" => None,
        "secrets" => Some(format!(
            "secret '{key}' cannot be templated; declare it under 'secrets' and read it from the environment"
        )),
        "env" if secret_vars.contains(key) => Some(format!(
            "environment variable '{key}' carries a secret and cannot be templated"
        )),
        "env" => None,
        "run" | "stage" if key == "id" => None,
        "target" if !has_target => Some(format!(
            "'target.{key}' is only available in stages with a target"
        )),
        "target" if key == "id" || key == "address" => None,
        _ => Some(format!("unknown template expression '{namespace}.{key}'")),
    }
}

fn upstream_produces(
    upstream: Option<&BTreeSet<String>>,
    producers: &BTreeMap<String, Vec<String>>,
    artifact: &str,
) -> bool {
    match (upstream, producers.get(artifact)) {
        (_, None) => false,
        // Without a graph (cycle) only existence can be checked.
        (None, Some(_)) => true,
        (Some(upstream), Some(stages)) => stages.iter().any(|stage| upstream.contains(stage)),
    }
}

/// Artifact key -> producing stages; warns when several stages produce the same key.
fn artifact_producers(
    definition: &PipelineDefinition,
    report: &mut ValidationReport,
) -> BTreeMap<String, Vec<String>> {
    let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for stage in &definition.stages {
        let keys: BTreeSet<&String> = stage
            .actions
            .iter()
            .flat_map(|action| action.produces.keys())
            .collect();
        for key in keys {
            producers.entry(key.clone()).or_default().push(stage.id.clone());
        }
    }
    for (key, stages) in &producers {
        if stages.len() > 1 {
            report.warnings.push(format!(
                "Artifact '{key}' is produced by several stages ({}); the last to finish wins",
                stages.join(", ")
            ));
        }
    }
    producers
}

fn secret_env_vars(definition: &PipelineDefinition) -> BTreeSet<String> {
    definition
        .secrets
        .iter()
        .flat_map(|(name, source)| [Some(name.clone()), source.env.clone()])
        .flatten()
        .collect()
}

fn check_catalogue(definition: &PipelineDefinition, ctx: &str, secrets: &[String]) -> ValidationReport {
    let mut report = ValidationReport::default();
    if definition.secrets.is_empty() {
        return report;
    }
    for name in secrets {
        if !definition.secrets.contains_key(name) {
            report.warnings.push(format!(
                "{ctx}: secret '{name}' is not in the secrets catalogue; it will be read from ${name}"
            ));
        }
    }
    report
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
