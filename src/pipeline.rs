use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::artifacts::{ArtifactBus, ArtifactValue};
use crate::definition::{PipelineDefinition, StageDefinition, TargetKind};
use crate::digest::compute_sha256;
use crate::error::PipelineResult;
use crate::executor::{CommandExecutor, ToolExecutor};
use crate::observability::MetricsCollector;
use crate::report::{ArtifactRecord, PipelineReport, RunRecord};
use crate::runner::{Launchers, StageRunner};
use crate::scheduler::{JobGraph, Scheduler, StageExecutor};
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::target::TargetLauncher;

pub const DEFAULT_STATE_DIR: &str = ".pipewright";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Working directory for actions and base for relative artifact paths.
    pub project_dir: PathBuf,
    /// Action logs land in `<state_dir>/runs/<run id>/`.
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    /// Generated when unset.
    pub run_id: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            max_parallel: std::thread::available_parallelism().map_or(4, |n| n.get()),
            run_id: None,
        }
    }
}

/// Composition root: wires secrets, executor, target launchers, the
/// artifact bus and the scheduler together for one definition.
pub struct PipelineEngine {
    definition: PipelineDefinition,
    options: EngineOptions,
    executor: Arc<dyn ToolExecutor>,
    secrets: Arc<dyn SecretStore>,
    launchers: Launchers,
    metrics: MetricsCollector,
}

impl PipelineEngine {
    pub fn new(definition: PipelineDefinition, options: EngineOptions) -> Self {
        let executor: Arc<dyn ToolExecutor> = Arc::new(CommandExecutor);
        let secrets = Arc::new(EnvSecretStore::from_definition(&definition));
        Self {
            definition,
            options,
            launchers: Launchers::new(executor.clone()),
            executor,
            secrets,
            metrics: MetricsCollector::new(),
        }
    }

    /// Also rebuilds the default launchers around `executor`; call before
    /// `with_launcher`.
    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.launchers = Launchers::new(executor.clone());
        self.executor = executor;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_launcher(mut self, kind: TargetKind, launcher: Arc<dyn TargetLauncher>) -> Self {
        self.launchers = self.launchers.with(kind, launcher);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Executes the whole graph. Definition errors (cycles, unknown or
    /// duplicate stages) are returned before any stage runs; every other
    /// failure is captured in the report.
    #[instrument(skip_all, fields(pipeline = %self.definition.name))]
    pub async fn run(&self, cancel: CancellationToken) -> PipelineResult<PipelineReport> {
        let graph = JobGraph::build(&self.definition)?;
        let run_id = self
            .options
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let log_dir = self.options.state_dir.join("runs").join(&run_id);
        fs::create_dir_all(&log_dir)?;

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            run_id = run_id.as_str(),
            stages = graph.len(),
            max_parallel = self.options.max_parallel,
            "Pipeline run started"
        );

        let bus = ArtifactBus::new();
        let bound = Arc::new(BoundStages {
            runner: StageRunner::new(
                self.executor.clone(),
                self.launchers.clone(),
                run_id.clone(),
                self.options.project_dir.clone(),
                log_dir,
                self.metrics.clone(),
            ),
            bus: bus.clone(),
            secrets: self.secrets.clone(),
        });
        let records = Scheduler::new(self.options.max_parallel)
            .run(&graph, bound, &cancel)
            .await;

        let artifacts = artifact_records(&bus);
        let report = PipelineReport::assemble(
            self.definition.name.clone(),
            run_id,
            started_at,
            records,
            &graph.stage_ids(),
            artifacts,
        );
        self.metrics.record_total_duration(clock.elapsed());

        for leak in &report.leaks {
            warn!(stage = leak.stage.as_str(), reason = leak.reason.as_str(), "Ephemeral target may have leaked");
        }
        match &report.first_failure {
            Some(failure) => info!(
                verdict = ?report.verdict,
                stage = failure.stage.as_str(),
                kind = failure.kind.as_str(),
                "Pipeline run finished"
            ),
            None => info!(verdict = ?report.verdict, "Pipeline run finished"),
        }
        Ok(report)
    }
}

/// Stage runner bound to one run's bus and secret store.
struct BoundStages {
    runner: StageRunner,
    bus: ArtifactBus,
    secrets: Arc<dyn SecretStore>,
}

#[async_trait]
impl StageExecutor for BoundStages {
    async fn run_stage(&self, stage: &StageDefinition, cancel: &CancellationToken) -> RunRecord {
        self.runner
            .execute(stage, &self.bus, self.secrets.clone(), cancel)
            .await
    }
}

fn artifact_records(bus: &ArtifactBus) -> Vec<ArtifactRecord> {
    bus.snapshot()
        .into_iter()
        .map(|(key, artifact)| {
            let sha256 = match &artifact.value {
                ArtifactValue::Path(path) if path.is_file() => match compute_sha256(path) {
                    Ok(digest) => Some(digest),
                    Err(err) => {
                        warn!(artifact = key.as_str(), error = %err, "Failed to hash artifact");
                        None
                    }
                },
                _ => None,
            };
            ArtifactRecord {
                key,
                producer: artifact.producer,
                value: artifact.value,
                sha256,
            }
        })
        .collect()
}
