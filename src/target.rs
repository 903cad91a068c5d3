//! Ephemeral test targets: launch, readiness polling and guaranteed teardown.
//!
//! ```text
//! NotStarted -> Starting -> Ready -> InUse -> Stopping -> Stopped
//!      \____________\__________\_______\__________\-----> Failed
//! ```
//!
//! [`run_with_target`] is the entry point used by the stage runner: whatever
//! happens between `start` and the end of the test body (probe timeout, test
//! failure, panic, cancellation) the target is stopped before it returns.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definition::{CommandSpec, ProbeSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{Invocation, ToolExecutor};
use crate::secrets::{SecretValue, redact_values};
use crate::template::{self, Expression, Resolve};

/// Grace period between SIGKILL and giving up on a process target.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Upper bound for a single probe attempt.
const PROBE_ATTEMPT_LIMIT: Duration = Duration::from_secs(5);

/// Timeout for the detached start / stop commands of container targets.
const CONTAINER_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    NotStarted,
    Starting,
    Ready,
    InUse,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHandle {
    /// Process id or container id.
    pub id: String,
    pub address: Option<String>,
}

impl Resolve for TargetHandle {
    fn resolve(&self, expr: Expression<'_>) -> PipelineResult<Option<String>> {
        Ok(match (expr.namespace, expr.key) {
            ("target", "id") => Some(self.id.clone()),
            ("target", "address") => Some(self.address.clone().unwrap_or_default()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TeardownOutcome {
    /// Nothing was ever launched.
    NotNeeded,
    Stopped,
    /// `stop` was called again on a stopped target.
    AlreadyStopped,
    Failed { reason: String },
}

impl TeardownOutcome {
    pub fn is_leak(&self) -> bool {
        matches!(self, TeardownOutcome::Failed { .. })
    }
}

/// Rendered launch parameters for one target.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secret_env: Vec<(String, SecretValue)>,
    pub scrub_env: Vec<String>,
    pub address: Option<String>,
    pub stop: Option<CommandSpec>,
    /// Where a process target's stdout/stderr go.
    pub log_path: Option<PathBuf>,
}

impl LaunchRequest {
    /// Masks the values of the secrets handed to this target.
    pub fn redact(&self, text: &str) -> String {
        redact_values(text, self.secret_env.iter().map(|(_, value)| value))
    }

    /// Rewrites the captured target log with secret values masked.
    fn redact_log(&self) -> std::io::Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        if self.secret_env.is_empty() || !path.exists() {
            return Ok(());
        }
        let content = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&content);
        let redacted = self.redact(&text);
        if redacted != text {
            std::fs::write(path, redacted)?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait TargetLauncher: Send + Sync {
    /// `cancel` aborts a launch still in flight; teardown never takes it.
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<TargetHandle>;

    async fn terminate(&self, handle: &TargetHandle) -> PipelineResult<()>;

    /// Lets readiness polling fail fast when the target died on its own.
    async fn is_running(&self, _handle: &TargetHandle) -> bool {
        true
    }
}

/// Runs the target as a child process of the engine.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_child(&self, id: &str) -> Option<Child> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }
}

#[async_trait]
impl TargetLauncher for ProcessLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        _cancel: &CancellationToken,
    ) -> PipelineResult<TargetHandle> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).stdin(Stdio::null()).kill_on_drop(true);
        for var in &request.scrub_env {
            cmd.env_remove(var);
        }
        cmd.envs(&request.env);
        for (name, value) in &request.secret_env {
            cmd.env(name, value.expose());
        }
        match &request.log_path {
            Some(path) => {
                let stdout = File::create(path)?;
                let stderr = stdout.try_clone()?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|err| {
            PipelineError::LaunchFailed(format!("failed to spawn '{}': {err}", request.program))
        })?;
        let pid = child.id().ok_or_else(|| {
            PipelineError::LaunchFailed(format!("'{}' exited immediately", request.program))
        })?;
        let id = pid.to_string();
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), child);
        info!(target_name = request.name.as_str(), pid, "Process target launched");

        Ok(TargetHandle {
            id,
            address: request.address.clone(),
        })
    }

    async fn terminate(&self, handle: &TargetHandle) -> PipelineResult<()> {
        let Some(mut child) = self.take_child(&handle.id) else {
            debug!(pid = handle.id.as_str(), "Process already reaped");
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid = handle.id.as_str(), ?status, "Process target already exited");
            return Ok(());
        }
        child.start_kill().map_err(|err| PipelineError::TeardownFailed {
            target: handle.id.clone(),
            reason: format!("kill failed: {err}"),
        })?;
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(PipelineError::TeardownFailed {
                target: handle.id.clone(),
                reason: format!("wait failed: {err}"),
            }),
            Err(_) => Err(PipelineError::TeardownFailed {
                target: handle.id.clone(),
                reason: format!("still running {}s after kill", KILL_GRACE.as_secs()),
            }),
        }
    }

    async fn is_running(&self, handle: &TargetHandle) -> bool {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match children.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Starts a detached container through a CLI (`docker run -d ...`) whose
/// stdout is the container id, and removes it with the configured stop
/// command (default `<run> rm -f <id>`).
pub struct CommandLauncher {
    executor: Arc<dyn ToolExecutor>,
    stops: Mutex<HashMap<String, Teardown>>,
}

/// Registered at launch, consumed by `terminate`.
struct Teardown {
    name: String,
    stop: CommandSpec,
    scrub_env: Vec<String>,
}

impl CommandLauncher {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            executor,
            stops: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TargetLauncher for CommandLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<TargetHandle> {
        let invocation = Invocation {
            action: format!("{}:start", request.name),
            program: request.program.clone(),
            args: request.args.clone(),
            env: request.env.clone(),
            secret_env: request.secret_env.clone(),
            scrub_env: request.scrub_env.clone(),
            workdir: None,
            timeout: Some(CONTAINER_COMMAND_TIMEOUT),
        };
        let output = self
            .executor
            .execute(&invocation, cancel)
            .await
            .map_err(|err| match err {
                PipelineError::Cancelled => err,
                other => PipelineError::LaunchFailed(request.redact(&other.to_string())),
            })?;
        if !output.success() {
            return Err(PipelineError::LaunchFailed(format!(
                "'{}' exited with {:?}: {}",
                invocation.command_line(),
                output.exit_code,
                request.redact(output.stderr.trim())
            )));
        }
        let id = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| {
                PipelineError::LaunchFailed(format!(
                    "'{}' printed no container id",
                    invocation.command_line()
                ))
            })?
            .to_string();

        let stop = request.stop.clone().unwrap_or_else(|| CommandSpec {
            run: request.program.clone(),
            args: vec!["rm".into(), "-f".into(), "${{ target.id }}".into()],
        });
        self.stops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                id.clone(),
                Teardown {
                    name: request.name.clone(),
                    stop,
                    scrub_env: request.scrub_env.clone(),
                },
            );
        info!(target_name = request.name.as_str(), container = id.as_str(), "Container target launched");

        Ok(TargetHandle {
            id,
            address: request.address.clone(),
        })
    }

    async fn terminate(&self, handle: &TargetHandle) -> PipelineResult<()> {
        let entry = self
            .stops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&handle.id);
        let Some(Teardown {
            name,
            stop,
            scrub_env,
        }) = entry
        else {
            debug!(container = handle.id.as_str(), "No teardown registered");
            return Ok(());
        };
        let args = stop
            .args
            .iter()
            .map(|arg| template::render(arg, handle))
            .collect::<PipelineResult<Vec<_>>>()?;
        let invocation = Invocation {
            action: format!("{name}:stop"),
            program: stop.run.clone(),
            args,
            scrub_env,
            timeout: Some(CONTAINER_COMMAND_TIMEOUT),
            ..Invocation::default()
        };
        let failed = |reason: String| PipelineError::TeardownFailed {
            target: handle.id.clone(),
            reason,
        };
        let output = self
            .executor
            .execute(&invocation, &CancellationToken::new())
            .await
            .map_err(|err| failed(err.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(failed(format!(
                "'{}' exited with {:?}: {}",
                invocation.command_line(),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, handle: &TargetHandle, cancel: &CancellationToken) -> bool;

    fn describe(&self) -> String;
}

pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn check(&self, handle: &TargetHandle, cancel: &CancellationToken) -> bool {
        let address = match template::render(&self.address, handle) {
            Ok(address) => address,
            Err(_) => return false,
        };
        tokio::select! {
            connected = TcpStream::connect(address.as_str()) => connected.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}

/// Ready once the command exits with status 0.
pub struct CommandProbe {
    command: CommandSpec,
    executor: Arc<dyn ToolExecutor>,
}

impl CommandProbe {
    pub fn new(command: CommandSpec, executor: Arc<dyn ToolExecutor>) -> Self {
        Self { command, executor }
    }
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn check(&self, handle: &TargetHandle, cancel: &CancellationToken) -> bool {
        let args = match self
            .command
            .args
            .iter()
            .map(|arg| template::render(arg, handle))
            .collect::<PipelineResult<Vec<_>>>()
        {
            Ok(args) => args,
            Err(_) => return false,
        };
        let invocation = Invocation {
            action: "readiness-probe".into(),
            program: self.command.run.clone(),
            args,
            timeout: Some(PROBE_ATTEMPT_LIMIT),
            ..Invocation::default()
        };
        match self.executor.execute(&invocation, cancel).await {
            Ok(output) => output.success(),
            Err(err) => {
                debug!(error = %err, "Readiness probe command errored");
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("command {}", self.command.run)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub backoff: f64,
    pub max_interval: Duration,
}

impl ReadinessPolicy {
    pub fn from_spec(spec: &ProbeSpec) -> Self {
        Self {
            timeout: Duration::from_millis(spec.timeout_ms),
            interval: Duration::from_millis(spec.interval_ms),
            backoff: spec.backoff,
            max_interval: Duration::from_millis(spec.max_interval_ms),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            1.0
        };
        let cap = self.max_interval.max(self.interval);
        // Overflowing products saturate at the cap.
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .map_or(cap, |next| next.min(cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadyReport {
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub waited: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Lifecycle manager for one ephemeral target.
pub struct EphemeralTarget {
    name: String,
    launcher: Arc<dyn TargetLauncher>,
    request: LaunchRequest,
    state: TargetState,
    handle: Option<TargetHandle>,
}

impl EphemeralTarget {
    pub fn new(launcher: Arc<dyn TargetLauncher>, request: LaunchRequest) -> Self {
        Self {
            name: request.name.clone(),
            launcher,
            request,
            state: TargetState::NotStarted,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn handle(&self) -> Option<&TargetHandle> {
        self.handle.as_ref()
    }

    pub async fn start(&mut self, cancel: &CancellationToken) -> PipelineResult<TargetHandle> {
        if self.state != TargetState::NotStarted {
            return Err(PipelineError::LaunchFailed(format!(
                "target '{}' cannot start from state {:?}",
                self.name, self.state
            )));
        }
        self.state = TargetState::Starting;
        match self.launcher.launch(&self.request, cancel).await {
            Ok(handle) => {
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            Err(err) => {
                let err = err.map_detail(|text| self.request.redact(text));
                warn!(target_name = self.name.as_str(), error = %err, "Target launch failed");
                self.state = TargetState::Failed;
                Err(err)
            }
        }
    }

    /// Polls `probe` until it passes or `policy.timeout` elapses, sleeping
    /// between attempts with exponential backoff.
    pub async fn wait_ready(
        &mut self,
        probe: &dyn ReadinessProbe,
        policy: &ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> PipelineResult<ReadyReport> {
        let handle = match (&self.state, &self.handle) {
            (TargetState::Starting, Some(handle)) => handle.clone(),
            _ => {
                return Err(PipelineError::LaunchFailed(format!(
                    "target '{}' is {:?}, expected starting",
                    self.name, self.state
                )));
            }
        };

        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut interval = policy.interval;
        let mut attempts = 0u32;
        debug!(target_name = self.name.as_str(), probe = %probe.describe(), "Waiting for readiness");

        loop {
            attempts += 1;
            let window = deadline
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), PROBE_ATTEMPT_LIMIT);
            let ready = tokio::time::timeout(window, probe.check(&handle, cancel))
                .await
                .unwrap_or(false);
            if ready {
                self.state = TargetState::Ready;
                let report = ReadyReport {
                    attempts,
                    waited: started.elapsed(),
                };
                info!(
                    target_name = self.name.as_str(),
                    attempts,
                    waited_ms = report.waited.as_millis() as u64,
                    "Target ready"
                );
                return Ok(report);
            }

            if !self.launcher.is_running(&handle).await {
                self.state = TargetState::Failed;
                return Err(PipelineError::LaunchFailed(format!(
                    "target '{}' exited before becoming ready",
                    self.name
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                self.state = TargetState::Failed;
                warn!(target_name = self.name.as_str(), attempts, "Readiness timeout");
                return Err(PipelineError::ReadinessTimeout {
                    target: self.name.clone(),
                    timeout: policy.timeout,
                    attempts,
                });
            }

            let pause = interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => {
                    self.state = TargetState::Failed;
                    return Err(PipelineError::Cancelled);
                }
            }
            interval = policy.next_interval(interval);
        }
    }

    pub fn mark_in_use(&mut self) {
        if self.state == TargetState::Ready {
            self.state = TargetState::InUse;
        }
    }

    /// Best-effort teardown. Calling it on a stopped target is a no-op.
    pub async fn stop(&mut self) -> TeardownOutcome {
        match self.state {
            TargetState::Stopped => {
                debug!(target_name = self.name.as_str(), "Target already stopped");
                return TeardownOutcome::AlreadyStopped;
            }
            TargetState::NotStarted => {
                self.state = TargetState::Stopped;
                return TeardownOutcome::NotNeeded;
            }
            _ => {}
        }
        let Some(handle) = self.handle.clone() else {
            self.state = TargetState::Stopped;
            return TeardownOutcome::NotNeeded;
        };

        self.state = TargetState::Stopping;
        let result = self.launcher.terminate(&handle).await;
        if let Err(err) = self.request.redact_log() {
            warn!(target_name = self.name.as_str(), error = %err, "Failed to redact target log");
        }
        match result.map_err(|err| err.map_detail(|text| self.request.redact(text))) {
            Ok(()) => {
                self.state = TargetState::Stopped;
                self.handle = None;
                info!(target_name = self.name.as_str(), id = handle.id.as_str(), "Target stopped");
                TeardownOutcome::Stopped
            }
            Err(err) => {
                self.state = TargetState::Failed;
                warn!(
                    target_name = self.name.as_str(),
                    id = handle.id.as_str(),
                    error = %err,
                    "Target teardown failed; resource may have leaked"
                );
                TeardownOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

impl Drop for EphemeralTarget {
    fn drop(&mut self) {
        if matches!(self.state, TargetState::Stopped | TargetState::NotStarted) {
            return;
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        warn!(
            target_name = self.name.as_str(),
            id = handle.id.as_str(),
            "Target dropped while live; scheduling teardown"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let launcher = self.launcher.clone();
            runtime.spawn(async move {
                if let Err(err) = launcher.terminate(&handle).await {
                    warn!(id = handle.id.as_str(), error = %err, "Deferred teardown failed");
                }
            });
        }
    }
}

pub struct TargetRun<T> {
    pub outcome: PipelineResult<T>,
    pub readiness: Option<ReadyReport>,
    pub teardown: TeardownOutcome,
}

/// Starts the target, waits for readiness, runs `body` on its own task and
/// stops the target on every exit path.
pub async fn run_with_target<F, Fut, T>(
    target: &mut EphemeralTarget,
    probe: &dyn ReadinessProbe,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
    body: F,
) -> TargetRun<T>
where
    F: FnOnce(TargetHandle) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut readiness = None;
    let outcome = match target.start(cancel).await {
        Err(err) => Err(err),
        Ok(handle) => match target.wait_ready(probe, policy, cancel).await {
            Err(err) => Err(err),
            Ok(report) => {
                readiness = Some(report);
                target.mark_in_use();
                match tokio::spawn(body(handle)).await {
                    Ok(value) => Ok(value),
                    Err(join_err) => {
                        warn!(target_name = target.name(), error = %join_err, "Test body crashed");
                        Err(PipelineError::ActionExecutionFailed {
                            action: format!("{} (test body)", target.name()),
                            reason: format!("crashed: {join_err}"),
                        })
                    }
                }
            }
        },
    };

    let teardown = target.stop().await;
    TargetRun {
        outcome,
        readiness,
        teardown,
    }
}
