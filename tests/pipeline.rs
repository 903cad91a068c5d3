use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipewright::definition::{PipelineDefinition, TargetKind};
use pipewright::error::{PipelineError, PipelineResult};
use pipewright::executor::{Invocation, ToolExecutor, ToolOutput};
use pipewright::pipeline::{EngineOptions, PipelineEngine};
use pipewright::report::{StageStatus, Verdict};
use pipewright::secrets::{SecretStore, SecretValue, StaticSecretStore};
use pipewright::target::{LaunchRequest, TargetHandle, TargetLauncher, TeardownOutcome};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Records every invocation; actions listed in `failing` exit 1. Stdout
/// echoes the secrets the action received; a failing action repeats them on
/// stderr.
#[derive(Default)]
struct ScriptedExecutor {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedExecutor {
    fn failing(actions: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            failing: actions.to_vec(),
            ..Self::default()
        })
    }

    fn actions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.action.clone())
            .filter(|action| action != "readiness-probe")
            .collect()
    }

    fn call(&self, action: &str) -> Invocation {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|call| call.action == action)
            .cloned()
            .unwrap_or_else(|| panic!("action '{action}' never ran"))
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        _cancel: &CancellationToken,
    ) -> PipelineResult<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let failed = self.failing.contains(&invocation.action.as_str());
        let stdout = invocation
            .secret_env
            .iter()
            .map(|(name, value)| format!("{name}={}", value.expose()))
            .collect::<Vec<_>>()
            .join("\n");
        let stderr = if failed { format!("boom\n{stdout}") } else { String::new() };
        Ok(ToolOutput {
            exit_code: Some(if failed { 1 } else { 0 }),
            stdout,
            stderr,
        })
    }
}

#[derive(Default)]
struct FakeLauncher {
    launched: Mutex<Vec<LaunchRequest>>,
    terminated: AtomicU32,
}

#[async_trait]
impl TargetLauncher for FakeLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        _cancel: &CancellationToken,
    ) -> PipelineResult<TargetHandle> {
        self.launched.lock().unwrap().push(request.clone());
        Ok(TargetHandle {
            id: "c0ffee".into(),
            address: request.address.clone(),
        })
    }

    async fn terminate(&self, _handle: &TargetHandle) -> PipelineResult<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Remembers which secret names were asked for.
struct RecordingStore {
    inner: StaticSecretStore,
    requested: Mutex<Vec<String>>,
}

impl SecretStore for RecordingStore {
    fn resolve(&self, name: &str) -> Option<SecretValue> {
        self.requested.lock().unwrap().push(name.to_string());
        self.inner.resolve(name)
    }
}

fn engine(yaml: &str, dir: &Path, executor: Arc<ScriptedExecutor>) -> PipelineEngine {
    PipelineEngine::new(
        PipelineDefinition::from_yaml(yaml).unwrap(),
        EngineOptions {
            project_dir: dir.to_path_buf(),
            state_dir: dir.join(".pipewright"),
            max_parallel: 4,
            run_id: Some("test-run".into()),
        },
    )
    .with_executor(executor)
    .with_secrets(Arc::new(StaticSecretStore::default()))
}

const RELEASE: &str = r#"
version: 1
name: release
stages:
  - id: build
    actions:
      - name: build-image
        run: docker
        args: [build, -t, "app:${{ run.id }}", .]
        produces:
          image: { value: "app:${{ run.id }}" }
  - id: scan
    needs: [build]
    actions:
      - { name: trivy, run: trivy, args: [image, "${{ artifacts.image }}"] }
  - id: analyze
    needs: [scan]
    actions:
      - { name: sonar, run: sonar-scanner }
  - id: test
    needs: [analyze]
    actions:
      - { name: pytest, run: pytest }
"#;

#[tokio::test]
async fn failing_scan_skips_analyze_and_test() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["trivy"]);
    let report = engine(RELEASE, temp.path(), executor.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Failed);
    let failure = report.first_failure.as_ref().unwrap();
    assert_eq!(failure.stage, "scan");
    assert_eq!(failure.kind, "action_execution_failed");
    assert!(failure.output.contains("boom"));

    assert_eq!(report.status_of("build"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("scan"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("analyze"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("test"), Some(StageStatus::Skipped));
    assert_eq!(
        report.stage("test").unwrap().skip_reason.as_deref(),
        Some("dependency 'analyze' skipped")
    );

    assert_eq!(executor.actions(), vec!["build-image", "trivy"]);
    assert_eq!(executor.call("trivy").args, vec!["image", "app:test-run"]);

    let ids: Vec<&str> = report.stages.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(ids, vec!["build", "scan", "analyze", "test"]);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].producer, "build");
}

#[tokio::test]
async fn independent_branch_is_unaffected_by_sibling_failure() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["trivy"]);
    let report = engine(
        r#"
version: 1
stages:
  - { id: build, actions: [{ name: compile, run: make }] }
  - { id: scan, needs: [build], actions: [{ name: trivy, run: trivy }] }
  - { id: lint, needs: [build], actions: [{ name: clippy, run: cargo }] }
  - { id: docs, needs: [lint], actions: [{ name: rustdoc, run: cargo }] }
  - { id: deploy, needs: [scan, docs], actions: [{ name: ship, run: ./deploy.sh }] }
"#,
        temp.path(),
        executor.clone(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.status_of("lint"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("docs"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("deploy"), Some(StageStatus::Skipped));
    assert!(!executor.actions().contains(&"ship".to_string()));
    assert_eq!(report.first_failure.unwrap().stage, "scan");
}

#[tokio::test]
async fn cycle_is_rejected_before_any_execution() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&[]);
    let err = engine(
        r#"
version: 1
stages:
  - { id: build, needs: [test], actions: [{ name: compile, run: make }] }
  - { id: test, needs: [build], actions: [{ name: unit, run: make }] }
"#,
        temp.path(),
        executor.clone(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap_err();

    match err {
        PipelineError::CycleDetected { cycle } => {
            assert_eq!(cycle, vec!["build", "test", "build"]);
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(executor.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn actions_only_receive_declared_secrets() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&[]);
    let store = Arc::new(RecordingStore {
        inner: StaticSecretStore::from_pairs([
            ("REGISTRY_TOKEN", "reg-s3cret"),
            ("SONAR_TOKEN", "sonar-s3cret"),
            ("UNUSED", "never"),
        ]),
        requested: Mutex::new(Vec::new()),
    });
    let report = engine(
        r#"
version: 1
stages:
  - id: build
    actions:
      - name: push
        run: docker
        secrets: [REGISTRY_TOKEN]
        produces:
          push_log: { stdout: true }
  - id: scan
    needs: [build]
    actions:
      - { name: trivy, run: trivy }
  - id: analyze
    needs: [build]
    actions:
      - { name: sonar, run: sonar-scanner, secrets: [SONAR_TOKEN] }
"#,
        temp.path(),
        executor.clone(),
    )
    .with_secrets(store.clone())
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert!(report.is_success());
    let names = |action: &str| -> Vec<String> {
        executor
            .call(action)
            .secret_env
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    };
    assert_eq!(names("push"), vec!["REGISTRY_TOKEN"]);
    assert!(names("trivy").is_empty());
    assert_eq!(names("sonar"), vec!["SONAR_TOKEN"]);

    let mut requested = store.requested.lock().unwrap().clone();
    requested.sort();
    assert_eq!(requested, vec!["REGISTRY_TOKEN", "SONAR_TOKEN"]);

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("REGISTRY_TOKEN=***"));
    assert!(!json.contains("reg-s3cret"));
    for record in &report.stages {
        for action in &record.actions {
            let log = std::fs::read_to_string(action.log_path.as_ref().unwrap()).unwrap();
            assert!(!log.contains("s3cret"), "secret leaked into {}", action.action);
        }
    }
}

#[tokio::test]
async fn failed_target_start_keeps_its_secrets_out_of_the_report() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["web:start"]);
    let report = engine(
        r#"
version: 1
stages:
  - id: smoke
    target:
      name: web
      kind: container
      run: docker
      args: [run, -d, web:latest]
      secrets: [TOKEN]
      probe: { tcp: "127.0.0.1:9", timeout_ms: 50, interval_ms: 5 }
    actions:
      - { name: curl, run: curl }
"#,
        temp.path(),
        executor.clone(),
    )
    .with_secrets(Arc::new(StaticSecretStore::from_pairs([("TOKEN", "tok-s3cret")])))
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(executor.call("web:start").secret_env.len(), 1);
    let smoke = report.stage("smoke").unwrap();
    assert_eq!(smoke.status, StageStatus::Failed);
    let error = smoke.error.as_ref().unwrap();
    assert_eq!(error.kind, "launch_failed");
    assert!(error.message.contains("TOKEN=***"), "{}", error.message);
    assert!(!executor.actions().contains(&"curl".to_string()));

    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains("tok-s3cret"), "{json}");
    assert_eq!(report.first_failure.as_ref().unwrap().kind, "launch_failed");
}

#[tokio::test]
async fn unresolvable_secret_fails_only_that_stage() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&[]);
    let report = engine(
        r#"
version: 1
stages:
  - { id: publish, actions: [{ name: push, run: docker, secrets: [MISSING] }] }
  - { id: notify, needs: [publish], actions: [{ name: slack, run: curl }] }
  - { id: lint, actions: [{ name: clippy, run: cargo }] }
"#,
        temp.path(),
        executor.clone(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    let publish = report.stage("publish").unwrap();
    assert_eq!(publish.error.as_ref().unwrap().kind, "secret_unavailable");
    assert_eq!(report.status_of("notify"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("lint"), Some(StageStatus::Succeeded));
    assert_eq!(executor.actions(), vec!["clippy"]);
}

#[tokio::test]
async fn advisory_failure_does_not_block_dependents() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["sonar"]);
    let report = engine(
        &RELEASE.replace("    needs: [scan]\n", "    needs: [scan]\n    gate: advisory\n"),
        temp.path(),
        executor.clone(),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.status_of("analyze"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("test"), Some(StageStatus::Succeeded));
    assert_eq!(report.verdict, Verdict::Succeeded);
    assert!(report.first_failure.is_none());
    assert_eq!(report.advisory_failures, vec!["analyze"]);
}

const TARGETED: &str = r#"
version: 1
stages:
  - id: build
    actions:
      - name: build-image
        run: docker
        produces:
          image: { value: "app:1" }
  - id: test
    needs: [build]
    target:
      name: app
      kind: container
      run: docker
      args: [run, -d, "${{ artifacts.image }}"]
      address: "127.0.0.1:18080"
      probe:
        command: { run: curl, args: ["http://${{ target.address }}/health"] }
        timeout_ms: 15
        interval_ms: 2
        max_interval_ms: 4
    actions:
      - { name: integration, run: pytest, args: ["--base-url=http://${{ target.address }}"] }
"#;

#[tokio::test]
async fn readiness_timeout_fails_stage_and_tears_target_down() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["readiness-probe"]);
    let launcher = Arc::new(FakeLauncher::default());
    let report = engine(TARGETED, temp.path(), executor.clone())
        .with_launcher(TargetKind::Container, launcher.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let test = report.stage("test").unwrap();
    assert_eq!(test.status, StageStatus::Failed);
    assert_eq!(test.error.as_ref().unwrap().kind, "readiness_timeout");
    assert_eq!(test.teardown, Some(TeardownOutcome::Stopped));
    assert!(test.readiness.is_none());
    assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.first_failure.as_ref().unwrap().stage, "test");
    assert!(!executor.actions().contains(&"integration".to_string()));

    let probe = executor.call("readiness-probe");
    assert_eq!(probe.args, vec!["http://127.0.0.1:18080/health"]);
}

#[tokio::test]
async fn tests_run_against_ready_target_then_it_stops() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&[]);
    let launcher = Arc::new(FakeLauncher::default());
    let report = engine(TARGETED, temp.path(), executor.clone())
        .with_launcher(TargetKind::Container, launcher.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let test = report.stage("test").unwrap();
    assert_eq!(test.teardown, Some(TeardownOutcome::Stopped));
    assert_eq!(test.readiness.unwrap().attempts, 1);
    assert_eq!(
        executor.call("integration").args,
        vec!["--base-url=http://127.0.0.1:18080"]
    );
    let launched = launcher.launched.lock().unwrap();
    assert_eq!(launched[0].args, vec!["run", "-d", "app:1"]);
    assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_tests_still_stop_the_target_once() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&["integration"]);
    let launcher = Arc::new(FakeLauncher::default());
    let report = engine(TARGETED, temp.path(), executor)
        .with_launcher(TargetKind::Container, launcher.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let test = report.stage("test").unwrap();
    assert_eq!(test.status, StageStatus::Failed);
    assert_eq!(test.teardown, Some(TeardownOutcome::Stopped));
    assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
    assert!(report.leaks.is_empty());
}

#[tokio::test]
async fn cancelled_run_skips_everything() {
    let temp = tempdir().unwrap();
    let executor = ScriptedExecutor::failing(&[]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = engine(RELEASE, temp.path(), executor.clone())
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Failed);
    assert!(report.stages.iter().all(|r| r.status == StageStatus::Skipped));
    assert_eq!(report.stage("build").unwrap().skip_reason.as_deref(), Some("run cancelled"));
    assert!(executor.calls.lock().unwrap().is_empty());
}
