use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifacts::{Artifact, ArtifactBus, ArtifactValue};
use crate::definition::{ActionSpec, ArtifactSpec, CommandSpec, ProbeCheck, StageDefinition, TargetKind, TargetSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{Invocation, ToolExecutor, ToolOutput};
use crate::observability::MetricsCollector;
use crate::report::{ActionLog, RunRecord};
use crate::secrets::{ScopedSecrets, SecretStore};
use crate::target::{
    CommandLauncher, CommandProbe, EphemeralTarget, LaunchRequest, ProcessLauncher,
    ReadinessPolicy, ReadinessProbe, TargetHandle, TargetLauncher, TcpProbe, run_with_target,
};
use crate::template::{self, Expression, Resolve};

/// Captured output attached to a failure is cut to its last 16 KiB.
const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Launcher per target kind.
#[derive(Clone)]
pub struct Launchers {
    process: Arc<dyn TargetLauncher>,
    container: Arc<dyn TargetLauncher>,
}

impl Launchers {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            process: Arc::new(ProcessLauncher::new()),
            container: Arc::new(CommandLauncher::new(executor)),
        }
    }

    pub fn with(mut self, kind: TargetKind, launcher: Arc<dyn TargetLauncher>) -> Self {
        match kind {
            TargetKind::Process => self.process = launcher,
            TargetKind::Container => self.container = launcher,
        }
        self
    }

    pub fn for_kind(&self, kind: TargetKind) -> Arc<dyn TargetLauncher> {
        match kind {
            TargetKind::Process => self.process.clone(),
            TargetKind::Container => self.container.clone(),
        }
    }
}

/// Executes the action list of one stage.
#[derive(Clone)]
pub struct StageRunner {
    executor: Arc<dyn ToolExecutor>,
    launchers: Launchers,
    run_id: String,
    project_dir: PathBuf,
    log_dir: PathBuf,
    metrics: MetricsCollector,
}

#[derive(Debug, Default)]
struct ActionsOutcome {
    logs: Vec<ActionLog>,
    pending: Vec<(String, Artifact)>,
    failure: Option<(PipelineError, String)>,
}

impl ActionsOutcome {
    fn failed(error: PipelineError) -> Self {
        Self {
            failure: Some((error, String::new())),
            ..Self::default()
        }
    }
}

impl StageRunner {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        launchers: Launchers,
        run_id: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            executor,
            launchers,
            run_id: run_id.into(),
            project_dir: project_dir.into(),
            log_dir: log_dir.into(),
            metrics,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs the stage to completion and returns its finalized record. Declared
    /// artifacts reach `bus` only if every action succeeded; an ephemeral
    /// target is torn down before the record is finalized.
    #[instrument(skip_all, fields(stage = %stage.id))]
    pub async fn execute(
        &self,
        stage: &StageDefinition,
        bus: &ArtifactBus,
        secrets: Arc<dyn SecretStore>,
        cancel: &CancellationToken,
    ) -> RunRecord {
        let _timer = self.metrics.start_stage(&stage.id);
        let mut record = RunRecord::pending(&stage.id, stage.gate);
        record.start();
        info!(actions = stage.actions.len(), "Stage started");

        let outcome = match &stage.target {
            None => {
                self.clone()
                    .run_actions(stage.clone(), bus.clone(), secrets, None, cancel.clone())
                    .await
            }
            Some(target) => {
                self.run_targeted(stage, target, bus, secrets, cancel, &mut record)
                    .await
            }
        };

        record.actions = outcome.logs;
        match outcome.failure {
            None => {
                record.artifacts = outcome.pending.iter().map(|(key, _)| key.clone()).collect();
                bus.publish_all(outcome.pending);
                record.succeed();
                info!(artifacts = record.artifacts.len(), "Stage succeeded");
            }
            Some((error, output)) => {
                warn!(error = %error, "Stage failed");
                record.fail(&error, output);
            }
        }
        self.metrics.record_outcome(record.status);
        record
    }

    async fn run_targeted(
        &self,
        stage: &StageDefinition,
        spec: &TargetSpec,
        bus: &ArtifactBus,
        secrets: Arc<dyn SecretStore>,
        cancel: &CancellationToken,
        record: &mut RunRecord,
    ) -> ActionsOutcome {
        let scrub = secrets.backing_env_vars();
        let prepared = {
            let scope = Scope {
                run_id: &self.run_id,
                stage_id: &stage.id,
                action: &spec.name,
                bus,
                pending: &[],
                target: None,
                blocked_env: &scrub,
            };
            self.launch_request(stage, spec, &scope, secrets.as_ref(), &scrub)
                .and_then(|request| Ok((request, self.build_probe(spec, &scope)?)))
        };
        let (request, probe) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => return ActionsOutcome::failed(error),
        };

        let policy = ReadinessPolicy::from_spec(&spec.probe);
        let mut target = EphemeralTarget::new(self.launchers.for_kind(spec.kind), request);
        let body = {
            let runner = self.clone();
            let stage = stage.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            move |handle: TargetHandle| runner.run_actions(stage, bus, secrets, Some(handle), cancel)
        };
        let run = run_with_target(&mut target, probe.as_ref(), &policy, cancel, body).await;

        if let Some(readiness) = run.readiness {
            self.metrics.record_readiness_wait(readiness.waited);
        }
        if run.teardown.is_leak() {
            self.metrics.record_teardown_failure();
        }
        record.readiness = run.readiness;
        record.teardown = Some(run.teardown);

        run.outcome.unwrap_or_else(ActionsOutcome::failed)
    }

    async fn run_actions(
        self,
        stage: StageDefinition,
        bus: ArtifactBus,
        secrets: Arc<dyn SecretStore>,
        target: Option<TargetHandle>,
        cancel: CancellationToken,
    ) -> ActionsOutcome {
        let scrub = secrets.backing_env_vars();
        let mut outcome = ActionsOutcome::default();

        for (index, action) in stage.actions.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.failure = Some((PipelineError::Cancelled, String::new()));
                break;
            }

            let scope = Scope {
                run_id: &self.run_id,
                stage_id: &stage.id,
                action: &action.name,
                bus: &bus,
                pending: &outcome.pending,
                target: target.as_ref(),
                blocked_env: &scrub,
            };
            let (invocation, scoped) = match self.prepare(action, &scope, secrets.as_ref(), &scrub) {
                Ok(prepared) => prepared,
                Err(error) => {
                    outcome.failure = Some((error, String::new()));
                    break;
                }
            };

            debug!(action = action.name.as_str(), secrets = ?scoped.names(), "Running action");
            let result = self.executor.execute(&invocation, &cancel).await;
            self.metrics.record_action();

            let output = match result {
                Ok(output) => output,
                Err(error) => {
                    outcome.logs.push(ActionLog {
                        action: action.name.clone(),
                        exit_code: None,
                        log_path: None,
                    });
                    let error = error.map_detail(|text| scoped.redact(text));
                    outcome.failure = Some((error, String::new()));
                    break;
                }
            };

            let log_path = match self.write_log(&stage.id, index, &invocation, &output, &scoped) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(action = action.name.as_str(), error = %err, "Failed to write action log");
                    None
                }
            };
            outcome.logs.push(ActionLog {
                action: action.name.clone(),
                exit_code: output.exit_code,
                log_path,
            });

            if !output.success() {
                let reason = match output.exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                };
                outcome.failure = Some((
                    PipelineError::ActionExecutionFailed {
                        action: action.name.clone(),
                        reason,
                    },
                    diagnostic(&scoped, &output),
                ));
                break;
            }

            let workdir = invocation
                .workdir
                .clone()
                .unwrap_or_else(|| self.project_dir.clone());
            match collect_outputs(&stage.id, action, &scope, &output, &scoped, &workdir) {
                Ok(items) => outcome.pending.extend(items),
                Err(error) => {
                    outcome.failure = Some((error, diagnostic(&scoped, &output)));
                    break;
                }
            }
        }

        outcome
    }

    fn prepare(
        &self,
        action: &ActionSpec,
        scope: &Scope<'_>,
        secrets: &dyn SecretStore,
        scrub: &[String],
    ) -> PipelineResult<(Invocation, ScopedSecrets)> {
        let program = template::render(&action.run, scope)?;
        let args = render_all(&action.args, scope)?;
        let mut env = BTreeMap::new();
        for (key, value) in &action.env {
            env.insert(key.clone(), template::render(value, scope)?);
        }
        let workdir = match &action.workdir {
            Some(dir) => self.project_dir.join(template::render(dir, scope)?),
            None => self.project_dir.clone(),
        };
        let scoped = ScopedSecrets::resolve(secrets, &action.secrets)?;
        let secret_env = scoped
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();

        Ok((
            Invocation {
                action: action.name.clone(),
                program,
                args,
                env,
                secret_env,
                scrub_env: scrub.to_vec(),
                workdir: Some(workdir),
                timeout: action.timeout(),
            },
            scoped,
        ))
    }

    fn launch_request(
        &self,
        stage: &StageDefinition,
        spec: &TargetSpec,
        scope: &Scope<'_>,
        secrets: &dyn SecretStore,
        scrub: &[String],
    ) -> PipelineResult<LaunchRequest> {
        let mut env = BTreeMap::new();
        for (key, value) in &spec.env {
            env.insert(key.clone(), template::render(value, scope)?);
        }
        let scoped = ScopedSecrets::resolve(secrets, &spec.secrets)?;
        let stop = match &spec.stop {
            Some(stop) => Some(CommandSpec {
                run: template::render(&stop.run, scope)?,
                args: render_all(&stop.args, scope)?,
            }),
            None => None,
        };
        let stage_dir = self.log_dir.join(&stage.id);
        fs::create_dir_all(&stage_dir)?;

        Ok(LaunchRequest {
            name: spec.name.clone(),
            program: template::render(&spec.run, scope)?,
            args: render_all(&spec.args, scope)?,
            env,
            secret_env: scoped
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            scrub_env: scrub.to_vec(),
            address: spec
                .address
                .as_deref()
                .map(|address| template::render(address, scope))
                .transpose()?,
            stop,
            log_path: Some(stage_dir.join(format!("{}.target.log", sanitize(&spec.name)))),
        })
    }

    fn build_probe(&self, spec: &TargetSpec, scope: &Scope<'_>) -> PipelineResult<Box<dyn ReadinessProbe>> {
        let check = spec
            .probe
            .check()
            .map_err(|err| PipelineError::LaunchFailed(err.to_string()))?;
        Ok(match check {
            ProbeCheck::Tcp(address) => Box::new(TcpProbe::new(template::render(&address, scope)?)),
            ProbeCheck::Command(command) => Box::new(CommandProbe::new(
                CommandSpec {
                    run: template::render(&command.run, scope)?,
                    args: render_all(&command.args, scope)?,
                },
                self.executor.clone(),
            )),
        })
    }

    fn write_log(
        &self,
        stage_id: &str,
        index: usize,
        invocation: &Invocation,
        output: &ToolOutput,
        scoped: &ScopedSecrets,
    ) -> std::io::Result<PathBuf> {
        let dir = self.log_dir.join(stage_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{:02}-{}.log", index + 1, sanitize(&invocation.action)));
        let exit = output
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let content = format!(
            "$ {}\nexit: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
            scoped.redact(&invocation.command_line()),
            exit,
            scoped.redact(&output.stdout),
            scoped.redact(&output.stderr),
        );
        fs::write(&path, content)?;
        Ok(path)
    }
}

/// Template scope for one action.
struct Scope<'a> {
    run_id: &'a str,
    stage_id: &'a str,
    action: &'a str,
    bus: &'a ArtifactBus,
    pending: &'a [(String, Artifact)],
    target: Option<&'a TargetHandle>,
    blocked_env: &'a [String],
}

impl Scope<'_> {
    fn reject(&self, reason: String) -> PipelineError {
        PipelineError::ActionExecutionFailed {
            action: self.action.to_string(),
            reason,
        }
    }
}

impl Resolve for Scope<'_> {
    fn resolve(&self, expr: Expression<'_>) -> PipelineResult<Option<String>> {
        match expr.namespace {
            "artifacts" => {
                if let Some((_, artifact)) = self.pending.iter().rev().find(|(key, _)| key == expr.key) {
                    return Ok(Some(artifact.value.render()));
                }
                let artifact = self.bus.get(expr.key, self.stage_id)?;
                Ok(Some(artifact.value.render()))
            }
            "run" if expr.key == "id" => Ok(Some(self.run_id.to_string())),
            "stage" if expr.key == "id" => Ok(Some(self.stage_id.to_string())),
            "target" => match self.target {
                Some(handle) => handle.resolve(expr),
                None => Ok(None),
            },
            "env" => {
                if self.blocked_env.iter().any(|var| var == expr.key) {
                    return Err(self.reject(format!(
                        "environment variable '{}' carries a secret; declare it under 'secrets'",
                        expr.key
                    )));
                }
                Ok(Some(std::env::var(expr.key).unwrap_or_default()))
            }
            "secrets" => Err(self.reject(format!(
                "secret '{}' cannot be templated; secrets are passed as environment variables",
                expr.key
            ))),
            other => Err(self.reject(format!(
                "unknown template expression '{other}.{}'",
                expr.key
            ))),
        }
    }
}

fn render_all(values: &[String], scope: &Scope<'_>) -> PipelineResult<Vec<String>> {
    values
        .iter()
        .map(|value| template::render(value, scope))
        .collect()
}

fn collect_outputs(
    stage_id: &str,
    action: &ActionSpec,
    scope: &Scope<'_>,
    output: &ToolOutput,
    scoped: &ScopedSecrets,
    workdir: &Path,
) -> PipelineResult<Vec<(String, Artifact)>> {
    let mut items = Vec::with_capacity(action.produces.len());
    for (key, spec) in &action.produces {
        let value = match spec {
            ArtifactSpec::Value { value } => ArtifactValue::Value(template::render(value, scope)?),
            ArtifactSpec::Stdout { stdout: true } => {
                ArtifactValue::Value(scoped.redact(output.stdout.trim()))
            }
            ArtifactSpec::Stdout { stdout: false } => continue,
            ArtifactSpec::Path { path } => {
                let rendered = template::render(path, scope)?;
                let resolved = resolve_declared_path(workdir, &rendered).ok_or_else(|| {
                    PipelineError::ActionExecutionFailed {
                        action: action.name.clone(),
                        reason: format!("declared output '{key}' ({rendered}) was not produced"),
                    }
                })?;
                ArtifactValue::Path(resolved)
            }
        };
        items.push((key.clone(), Artifact::new(value, stage_id)));
    }
    Ok(items)
}

/// Existing file for a declared path, first match for a glob.
fn resolve_declared_path(workdir: &Path, declared: &str) -> Option<PathBuf> {
    let candidate = workdir.join(declared);
    if declared.contains(['*', '?', '[']) {
        let pattern = candidate.to_string_lossy().to_string();
        let mut matches: Vec<PathBuf> = glob::glob(&pattern)
            .ok()?
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();
        matches.sort();
        matches.into_iter().next()
    } else if candidate.exists() {
        Some(candidate)
    } else {
        None
    }
}

fn diagnostic(scoped: &ScopedSecrets, output: &ToolOutput) -> String {
    let mut combined = String::new();
    if !output.stdout.trim().is_empty() {
        combined.push_str(output.stdout.trim_end());
        combined.push('\n');
    }
    if !output.stderr.trim().is_empty() {
        combined.push_str(output.stderr.trim_end());
        combined.push('\n');
    }
    tail(&scoped.redact(&combined), MAX_DIAGNOSTIC_BYTES).to_string()
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::definition::{GatePolicy, PipelineDefinition};
    use crate::report::StageStatus;
    use crate::secrets::StaticSecretStore;

    /// Records invocations; fails programs named `fail`.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl ToolExecutor for Recorder {
        async fn execute(
            &self,
            invocation: &Invocation,
            _cancel: &CancellationToken,
        ) -> PipelineResult<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            let stdout = invocation
                .secret_env
                .iter()
                .map(|(_, value)| value.expose().to_string())
                .chain(std::iter::once(format!("ran {}", invocation.program)))
                .collect::<Vec<_>>()
                .join(" ");
            Ok(ToolOutput {
                exit_code: Some(if invocation.program == "fail" { 1 } else { 0 }),
                stdout,
                stderr: String::new(),
            })
        }
    }

    fn runner(executor: Arc<Recorder>, dir: &Path) -> StageRunner {
        StageRunner::new(
            executor.clone(),
            Launchers::new(executor),
            "run-7",
            dir,
            dir.join("logs"),
            MetricsCollector::new(),
        )
    }

    fn stage(yaml: &str) -> StageDefinition {
        let definition = PipelineDefinition::from_yaml(yaml).unwrap();
        definition.stages.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn publishes_artifacts_only_after_success() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor.clone(), temp.path());
        let bus = ArtifactBus::new();
        let secrets: Arc<dyn SecretStore> = Arc::new(StaticSecretStore::default());

        let stage = stage(
            r#"
version: 1
stages:
  - id: build
    actions:
      - name: tag
        run: echo
        produces:
          image: { value: "app:${{ run.id }}" }
      - name: push
        run: fail
        args: ["${{ artifacts.image }}"]
"#,
        );
        let record = runner
            .execute(&stage, &bus, secrets, &CancellationToken::new())
            .await;

        assert_eq!(record.status, StageStatus::Failed);
        assert!(bus.is_empty(), "failed stage must not publish");
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[1].args, vec!["app:run-7".to_string()]);
        let error = record.error.unwrap();
        assert_eq!(error.kind, "action_execution_failed");
        assert!(error.output.contains("ran fail"));
        assert_eq!(record.actions.len(), 2);
        assert!(record.actions[0].log_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn first_failure_stops_remaining_actions() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor.clone(), temp.path());
        let stage = stage(
            r#"
version: 1
stages:
  - id: scan
    actions:
      - { name: one, run: fail }
      - { name: two, run: echo }
"#,
        );
        let record = runner
            .execute(
                &stage,
                &ArtifactBus::new(),
                Arc::new(StaticSecretStore::default()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn secrets_are_scoped_and_redacted() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor.clone(), temp.path());
        let bus = ArtifactBus::new();
        let secrets: Arc<dyn SecretStore> =
            Arc::new(StaticSecretStore::from_pairs([("TOKEN", "tok-123"), ("OTHER", "zzz")]));
        let stage = stage(
            r#"
version: 1
stages:
  - id: publish
    actions:
      - name: login
        run: login
        secrets: [TOKEN]
        produces:
          banner: { stdout: true }
      - name: plain
        run: echo
"#,
        );
        let record = runner
            .execute(&stage, &bus, secrets, &CancellationToken::new())
            .await;
        assert_eq!(record.status, StageStatus::Succeeded);

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[0].secret_env.len(), 1);
        assert_eq!(calls[0].secret_env[0].0, "TOKEN");
        assert!(calls[1].secret_env.is_empty());

        assert_eq!(bus.get("banner", "x").unwrap().value.render(), "*** ran login");
        let log = fs::read_to_string(record.actions[0].log_path.as_ref().unwrap()).unwrap();
        assert!(!log.contains("tok-123"));
    }

    #[tokio::test]
    async fn missing_artifact_fails_stage_as_configuration_error() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor.clone(), temp.path());
        let stage = stage(
            r#"
version: 1
stages:
  - id: test
    actions:
      - { name: run, run: echo, args: ["${{ artifacts.image }}"] }
"#,
        );
        let record = runner
            .execute(
                &stage,
                &ArtifactBus::new(),
                Arc::new(StaticSecretStore::default()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "artifact_unavailable");
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn secrets_cannot_be_templated() {
        let temp = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor.clone(), temp.path());
        let stage = stage(
            r#"
version: 1
stages:
  - id: leak
    gate: advisory
    actions:
      - { name: run, run: echo, args: ["${{ secrets.TOKEN }}"], secrets: [TOKEN] }
"#,
        );
        let record = runner
            .execute(
                &stage,
                &ArtifactBus::new(),
                Arc::new(StaticSecretStore::from_pairs([("TOKEN", "x")])),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(record.gate, GatePolicy::Advisory);
        assert_eq!(record.status, StageStatus::Failed);
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn declared_file_outputs_must_exist() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("reports")).unwrap();
        fs::write(temp.path().join("reports/scan.sarif"), "{}").unwrap();
        let executor = Arc::new(Recorder::default());
        let runner = runner(executor, temp.path());
        let bus = ArtifactBus::new();
        let stage = stage(
            r#"
version: 1
stages:
  - id: scan
    actions:
      - name: trivy
        run: trivy
        produces:
          report: { path: "reports/*.sarif" }
          missing: { path: "reports/none.txt" }
"#,
        );
        let record = runner
            .execute(
                &stage,
                &bus,
                Arc::new(StaticSecretStore::default()),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.error.unwrap().message.contains("missing"));
        assert!(bus.is_empty());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 4), "llo");
        assert_eq!(tail("abc", 10), "abc");
    }
}
