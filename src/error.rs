use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("stage '{stage}' needs unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("stage id '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("artifact '{key}' is not available (requested by stage '{stage}')")]
    ArtifactUnavailable { key: String, stage: String },

    #[error("secret '{0}' could not be resolved")]
    SecretUnavailable(String),

    #[error("action '{action}' failed: {reason}")]
    ActionExecutionFailed { action: String, reason: String },

    #[error("action '{action}' timed out after {}s", .timeout.as_secs())]
    ActionTimeout { action: String, timeout: Duration },

    #[error("failed to launch target: {0}")]
    LaunchFailed(String),

    #[error("target '{target}' not ready after {}ms ({attempts} probe attempt(s))", .timeout.as_millis())]
    ReadinessTimeout {
        target: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("teardown of target '{target}' failed: {reason}")]
    TeardownFailed { target: String, reason: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Definition-time errors abort the run before any stage executes.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            PipelineError::CycleDetected { .. }
                | PipelineError::UnknownDependency { .. }
                | PipelineError::DuplicateStage(_)
        )
    }

    /// Rewrites the free-text detail (usually captured command output) the
    /// error carries, leaving its kind untouched.
    pub fn map_detail(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            PipelineError::ActionExecutionFailed { action, reason } => {
                PipelineError::ActionExecutionFailed {
                    action,
                    reason: f(&reason),
                }
            }
            PipelineError::LaunchFailed(message) => PipelineError::LaunchFailed(f(&message)),
            PipelineError::TeardownFailed { target, reason } => PipelineError::TeardownFailed {
                target,
                reason: f(&reason),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::CycleDetected { .. } => "cycle_detected",
            PipelineError::UnknownDependency { .. } => "unknown_dependency",
            PipelineError::DuplicateStage(_) => "duplicate_stage",
            PipelineError::ArtifactUnavailable { .. } => "artifact_unavailable",
            PipelineError::SecretUnavailable(_) => "secret_unavailable",
            PipelineError::ActionExecutionFailed { .. } => "action_execution_failed",
            PipelineError::ActionTimeout { .. } => "action_timeout",
            PipelineError::LaunchFailed(_) => "launch_failed",
            PipelineError::ReadinessTimeout { .. } => "readiness_timeout",
            PipelineError::TeardownFailed { .. } => "teardown_failed",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Io(_) => "io",
        }
    }
}
