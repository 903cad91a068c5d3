use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::definition::{
    ActionSpec, ArtifactSpec, GatePolicy, PipelineDefinition, ProbeSpec, SUPPORTED_VERSION,
    SecretSource, StageDefinition, TargetKind, TargetSpec,
};

pub const PRESETS: &[&str] = &["container-ci", "minimal"];

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = preset(name)?;

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset definition: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

pub fn preset(name: &str) -> Result<PipelineDefinition> {
    match name {
        "container-ci" => Ok(container_ci_preset()),
        "minimal" => Ok(minimal_preset()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

/// build+push -> vulnerability scan -> quality analysis (advisory) ->
/// integration tests against the freshly built container.
fn container_ci_preset() -> PipelineDefinition {
    let image = "localhost:5000/app:${{ run.id }}";

    let mut build = action("build-image", "docker", &["build", "-t", image, "."]);
    build.produces.insert("image".into(), ArtifactSpec::Value { value: image.into() });

    let mut push = action(
        "push-image",
        "sh",
        &[
            "-c",
            "printf '%s' \"$REGISTRY_TOKEN\" | docker login localhost:5000 -u ci --password-stdin && docker push \"$IMAGE\"",
        ],
    );
    push.env.insert("IMAGE".into(), "${{ artifacts.image }}".into());
    push.secrets.push("REGISTRY_TOKEN".into());
    push.timeout_secs = Some(600);

    let prepare = action("prepare-reports", "mkdir", &["-p", "reports"]);
    let mut trivy = action(
        "trivy",
        "trivy",
        &[
            "image",
            "--exit-code",
            "1",
            "--severity",
            "HIGH,CRITICAL",
            "--format",
            "sarif",
            "--output",
            "reports/trivy.sarif",
            "${{ artifacts.image }}",
        ],
    );
    trivy.produces.insert(
        "scan_report".into(),
        ArtifactSpec::Path {
            path: "reports/trivy.sarif".into(),
        },
    );

    let mut sonar = action(
        "sonar-scanner",
        "sonar-scanner",
        &["-Dsonar.projectKey=app", "-Dsonar.sarifReportPaths=${{ artifacts.scan_report }}"],
    );
    sonar.secrets.push("SONAR_TOKEN".into());

    let mut tests = action(
        "integration-tests",
        "sh",
        &["-c", "curl -fsS \"http://$APP_ADDRESS/health\""],
    );
    tests
        .env
        .insert("APP_ADDRESS".into(), "${{ target.address }}".into());

    let mut secrets = BTreeMap::new();
    secrets.insert(
        "REGISTRY_TOKEN".into(),
        SecretSource {
            env: Some("CI_REGISTRY_TOKEN".into()),
        },
    );
    secrets.insert("SONAR_TOKEN".into(), SecretSource::default());

    let mut analyze = stage("analyze", &["scan"], vec![sonar]);
    analyze.gate = GatePolicy::Advisory;

    let mut test = stage("test", &["analyze"], vec![tests]);
    test.target = Some(TargetSpec {
        name: "app".into(),
        kind: TargetKind::Container,
        run: "docker".into(),
        args: strings(&["run", "-d", "-p", "8080:8080", "${{ artifacts.image }}"]),
        env: BTreeMap::new(),
        secrets: Vec::new(),
        stop: None,
        address: Some("127.0.0.1:8080".into()),
        probe: ProbeSpec {
            tcp: Some("${{ target.address }}".into()),
            command: None,
            timeout_ms: 60_000,
            interval_ms: 500,
            backoff: 2.0,
            max_interval_ms: 5_000,
        },
    });

    PipelineDefinition {
        version: SUPPORTED_VERSION,
        name: "container-ci".into(),
        secrets,
        stages: vec![
            stage("build", &[], vec![build, push]),
            stage("scan", &["build"], vec![prepare, trivy]),
            analyze,
            test,
        ],
    }
}

fn minimal_preset() -> PipelineDefinition {
    PipelineDefinition {
        version: SUPPORTED_VERSION,
        name: "minimal".into(),
        secrets: BTreeMap::new(),
        stages: vec![
            stage("build", &[], vec![action("compile", "make", &["all"])]),
            stage("test", &["build"], vec![action("unit", "make", &["test"])]),
        ],
    }
}

fn stage(id: &str, needs: &[&str], actions: Vec<ActionSpec>) -> StageDefinition {
    StageDefinition {
        id: id.into(),
        needs: strings(needs),
        gate: GatePolicy::Blocking,
        target: None,
        actions,
    }
}

fn action(name: &str, run: &str, args: &[&str]) -> ActionSpec {
    ActionSpec {
        name: name.into(),
        run: run.into(),
        args: strings(args),
        env: BTreeMap::new(),
        secrets: Vec::new(),
        produces: BTreeMap::new(),
        timeout_secs: None,
        workdir: None,
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
