use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::secrets::SecretValue;

/// One fully rendered external-tool call.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub action: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secret_env: Vec<(String, SecretValue)>,
    /// Variables removed from the inherited environment before spawning.
    pub scrub_env: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(action: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external tools. The engine never talks to `std::process` directly so
/// tests can substitute a scripted executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Returns the captured output of a process that ran to completion,
    /// whatever its exit code. Spawn failures, timeouts and cancellation are
    /// errors.
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> PipelineResult<ToolOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

#[async_trait]
impl ToolExecutor for CommandExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> PipelineResult<ToolOutput> {
        debug!(
            action = invocation.action.as_str(),
            program = invocation.program.as_str(),
            args = invocation.args.len(),
            secrets = invocation.secret_env.len(),
            "Spawning tool"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &invocation.scrub_env {
            cmd.env_remove(var);
        }
        cmd.envs(&invocation.env);
        for (name, value) in &invocation.secret_env {
            cmd.env(name, value.expose());
        }
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|err| PipelineError::ActionExecutionFailed {
                action: invocation.action.clone(),
                reason: format!("failed to spawn '{}': {err}", invocation.program),
            })?;

        let deadline = async {
            match invocation.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping the wait future drops the child, and `kill_on_drop` kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|err| {
                PipelineError::ActionExecutionFailed {
                    action: invocation.action.clone(),
                    reason: format!("failed to wait for '{}': {err}", invocation.program),
                }
            })?,
            _ = deadline => {
                warn!(action = invocation.action.as_str(), "Tool timed out; killing");
                return Err(PipelineError::ActionTimeout {
                    action: invocation.action.clone(),
                    timeout: invocation.timeout.unwrap_or_default(),
                });
            }
            _ = cancel.cancelled() => {
                warn!(action = invocation.action.as_str(), "Cancellation requested; killing tool");
                return Err(PipelineError::Cancelled);
            }
        };

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("script", "sh").args(["-c", script])
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let output = CommandExecutor
            .execute(&sh("echo out; echo err >&2; exit 3"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn injects_secrets_and_scrubs_inherited_vars() {
        let mut invocation = sh("echo \"$TOKEN:${HOME:-unset}\"");
        invocation
            .secret_env
            .push(("TOKEN".into(), SecretValue::new("abc")));
        invocation.scrub_env.push("HOME".into());
        let output = CommandExecutor
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "abc:unset");
    }

    #[tokio::test]
    async fn times_out() {
        let mut invocation = sh("sleep 5");
        invocation.timeout = Some(Duration::from_millis(50));
        let err = CommandExecutor
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ActionTimeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_running_tool() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CommandExecutor.execute(&sh("sleep 5"), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn spawn_failure_is_action_failure() {
        let err = CommandExecutor
            .execute(
                &Invocation::new("missing", "definitely-not-a-real-binary-xyz"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ActionExecutionFailed { .. }));
    }
}
