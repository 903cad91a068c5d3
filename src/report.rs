use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifacts::ArtifactValue;
use crate::definition::GatePolicy;
use crate::error::PipelineError;
use crate::target::{ReadyReport, TeardownOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionLog {
    pub action: String,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub kind: String,
    pub message: String,
    /// Captured (redacted) output of the failing action, if any.
    pub output: String,
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub stage: String,
    pub status: StageStatus,
    pub gate: GatePolicy,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionLog>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownOutcome>,
}

impl RunRecord {
    pub fn pending(stage: impl Into<String>, gate: GatePolicy) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            gate,
            started_at: None,
            finished_at: None,
            actions: Vec::new(),
            artifacts: Vec::new(),
            error: None,
            skip_reason: None,
            readiness: None,
            teardown: None,
        }
    }

    pub fn skipped(stage: impl Into<String>, gate: GatePolicy, reason: impl Into<String>) -> Self {
        let mut record = Self::pending(stage, gate);
        record.status = StageStatus::Skipped;
        record.skip_reason = Some(reason.into());
        record.finished_at = Some(Utc::now());
        record
    }

    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &PipelineError, output: impl Into<String>) {
        self.status = StageStatus::Failed;
        self.error = Some(StageFailure {
            kind: error.kind().to_string(),
            message: error.to_string(),
            output: output.into(),
        });
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        Some((end - start).num_microseconds().unwrap_or_default() as f64 / 1_000.0)
    }

    /// Whether dependents may run after this stage finished.
    pub fn unblocks_dependents(&self) -> bool {
        match self.status {
            StageStatus::Succeeded => true,
            StageStatus::Failed => self.gate == GatePolicy::Advisory,
            _ => false,
        }
    }

    pub fn counts_against_verdict(&self) -> bool {
        match self.status {
            StageStatus::Succeeded => false,
            StageStatus::Failed => self.gate == GatePolicy::Blocking,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub stage: String,
    pub kind: String,
    pub message: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub key: String,
    pub producer: String,
    pub value: ArtifactValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakWarning {
    pub stage: String,
    pub reason: String,
}

/// The single externally consumed result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub run_id: String,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<FailureSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisory_failures: Vec<String>,
    /// Stage records in definition order.
    pub stages: Vec<RunRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub leaks: Vec<LeakWarning>,
}

impl PipelineReport {
    /// Builds the report from records in completion order; `stage_order`
    /// gives the definition order used for presentation.
    pub fn assemble(
        pipeline: impl Into<String>,
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        completed: Vec<RunRecord>,
        stage_order: &[String],
        artifacts: Vec<ArtifactRecord>,
    ) -> Self {
        let verdict = if completed.iter().any(RunRecord::counts_against_verdict) {
            Verdict::Failed
        } else {
            Verdict::Succeeded
        };

        let first_failure = completed
            .iter()
            .find(|record| record.status == StageStatus::Failed && record.gate == GatePolicy::Blocking)
            .or_else(|| {
                completed
                    .iter()
                    .find(|record| record.status == StageStatus::Skipped)
            })
            .filter(|_| verdict == Verdict::Failed)
            .map(|record| match &record.error {
                Some(error) => FailureSummary {
                    stage: record.stage.clone(),
                    kind: error.kind.clone(),
                    message: error.message.clone(),
                    output: error.output.clone(),
                },
                None => FailureSummary {
                    stage: record.stage.clone(),
                    kind: "skipped".to_string(),
                    message: record.skip_reason.clone().unwrap_or_default(),
                    output: String::new(),
                },
            });

        let advisory_failures = completed
            .iter()
            .filter(|record| record.status == StageStatus::Failed && record.gate == GatePolicy::Advisory)
            .map(|record| record.stage.clone())
            .collect();

        let leaks = completed
            .iter()
            .filter_map(|record| match &record.teardown {
                Some(TeardownOutcome::Failed { reason }) => Some(LeakWarning {
                    stage: record.stage.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();

        let mut stages = completed;
        stages.sort_by_key(|record| {
            stage_order
                .iter()
                .position(|id| id == &record.stage)
                .unwrap_or(usize::MAX)
        });

        Self {
            pipeline: pipeline.into(),
            run_id: run_id.into(),
            verdict,
            started_at,
            finished_at: Utc::now(),
            first_failure,
            advisory_failures,
            stages,
            artifacts,
            leaks,
        }
    }

    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }

    pub fn stage(&self, id: &str) -> Option<&RunRecord> {
        self.stages.iter().find(|record| record.stage == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StageStatus> {
        self.stage(id).map(|record| record.status)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        Ok(())
    }
}
