use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pipewright::definition::{GatePolicy, PipelineDefinition};
use pipewright::digest::{compute_sha256, write_checksums, write_sha256};
use pipewright::lockfile::generate_lock;
use pipewright::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use pipewright::observability::server::MetricsServer;
use pipewright::pipeline::{DEFAULT_STATE_DIR, EngineOptions, PipelineEngine};
use pipewright::presets::generate_preset;
use pipewright::report::{PipelineReport, StageStatus};
use pipewright::scheduler::JobGraph;
use pipewright::secrets::{ChainSecretStore, EnvSecretStore, StaticSecretStore};
use pipewright::validation::{ValidationReport, validate_definition};
use serde_json::to_writer_pretty;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Validate { definition } => validate_cmd(&definition),
        Commands::Plan { definition } => plan_cmd(&definition),
        Commands::Lock { definition, output } => lock_cmd(&definition, output),
        Commands::New { preset, output } => {
            let destination = output.unwrap_or_else(|| PathBuf::from(format!("{preset}.pipeline.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset definition generated"
            );
            Ok(())
        }
        Commands::Lint { definitions } => lint_definitions(&definitions),
        Commands::Digest { path, output } => digest_cmd(&path, output.as_deref()),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "pipewright", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries plans, summaries and completions.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "pipewright")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let definition = PipelineDefinition::load(&args.definition)?;
    let validation = validate_definition(&definition);
    log_validation(&args.definition, &validation);
    if !validation.is_ok() {
        bail!(
            "Pipeline definition is invalid ({} error(s))",
            validation.errors.len()
        );
    }

    if args.dry_run {
        let graph = JobGraph::build(&definition)?;
        print_plan(&definition, &graph);
        info!(stages = graph.len(), "Dry run complete; nothing executed");
        return Ok(());
    }

    let workdir = args.workdir.unwrap_or_else(|| PathBuf::from("."));
    let state_dir = if args.state_dir.is_absolute() {
        args.state_dir
    } else {
        workdir.join(&args.state_dir)
    };
    let run_id = args
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut options = EngineOptions {
        project_dir: workdir,
        state_dir: state_dir.clone(),
        run_id: Some(run_id.clone()),
        ..EngineOptions::default()
    };
    if let Some(max_parallel) = args.max_parallel {
        options.max_parallel = max_parallel;
    }

    let metrics = MetricsCollector::global().clone();
    metrics.reset();
    let mut engine = PipelineEngine::new(definition, options).with_metrics(metrics.clone());
    if let Some(path) = &args.secrets_file {
        let file_store = StaticSecretStore::load(path)?;
        info!(secrets = file_store.len(), file = %path.display(), "Loaded secrets file");
        let chain = ChainSecretStore::new()
            .push(Arc::new(file_store))
            .push(Arc::new(EnvSecretStore::from_definition(engine.definition())));
        engine = engine.with_secrets(Arc::new(chain));
    }

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let report: PipelineReport = runtime.block_on(async {
        #[cfg(feature = "metrics-server")]
        let mut metrics_server = match &args.metrics_listen {
            Some(addr_str) => {
                let addr: SocketAddr = addr_str
                    .parse()
                    .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
                Some(MetricsServer::spawn(addr, metrics.clone())?)
            }
            None => None,
        };

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling run");
                interrupt.cancel();
            }
        });

        let result = engine.run(cancel).await;

        #[cfg(feature = "metrics-server")]
        if let Some(server) = metrics_server.as_mut() {
            server.stop().await;
        }

        result.map_err(anyhow::Error::from)
    })?;

    let report_path = args
        .report
        .unwrap_or_else(|| state_dir.join("runs").join(&run_id).join("report.json"));
    report.write_json(&report_path)?;
    info!(report = %report_path.display(), "Run report written");

    if let Some(path) = &args.checksums {
        let written = write_checksums(&report.artifacts, path)?;
        info!(checksums = %path.display(), files = written, "Artifact checksums written");
    }

    write_metrics(
        &metrics,
        args.print_metrics,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;

    print_summary(&report);
    match &report.first_failure {
        None => Ok(()),
        Some(failure) => Err(anyhow!(
            "Pipeline '{}' failed at stage '{}': {}",
            report.pipeline,
            failure.stage,
            failure.message
        )),
    }
}

fn write_metrics(
    metrics: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if !print_metrics && metrics_json.is_none() && metrics_prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        create_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!(
        "Pipeline '{}' (run {}): {}",
        report.pipeline,
        report.run_id,
        if report.is_success() { "SUCCEEDED" } else { "FAILED" }
    );
    let width = report
        .stages
        .iter()
        .map(|record| record.stage.len())
        .max()
        .unwrap_or(0);
    for record in &report.stages {
        let duration = record
            .duration_ms()
            .filter(|_| record.status != StageStatus::Skipped)
            .map(|ms| format!("{:.1}s", ms / 1_000.0))
            .unwrap_or_default();
        let detail = match (&record.error, &record.skip_reason) {
            (Some(error), _) => error.message.clone(),
            (None, Some(reason)) => reason.clone(),
            (None, None) => String::new(),
        };
        println!(
            "  {:<width$}  {:<9}  {:>7}  {}",
            record.stage,
            record.status.as_str(),
            duration,
            detail
        );
    }
    if !report.advisory_failures.is_empty() {
        println!("Advisory failures: {}", report.advisory_failures.join(", "));
    }
    for leak in &report.leaks {
        println!("Possible leaked target in stage '{}': {}", leak.stage, leak.reason);
    }
    if let Some(failure) = &report.first_failure {
        println!(
            "First failure: {} ({}): {}",
            failure.stage, failure.kind, failure.message
        );
        if !failure.output.trim().is_empty() {
            println!("{}", failure.output.trim_end());
        }
    }
}

fn log_validation(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

fn validate_cmd(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    let report = validate_definition(&definition);
    log_validation(path, &report);

    if report.is_ok() {
        info!(file = %path.display(), "Pipeline validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn plan_cmd(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    let graph = JobGraph::build(&definition)?;
    print_plan(&definition, &graph);
    Ok(())
}

fn print_plan(definition: &PipelineDefinition, graph: &JobGraph) {
    println!("Plan for '{}' ({} stage(s)):", definition.name, graph.len());
    for (idx, batch) in graph.batches().iter().enumerate() {
        let labels: Vec<String> = batch
            .iter()
            .map(|id| {
                let mut label = id.to_string();
                if let Some(stage) = definition.stage(id) {
                    if stage.target.is_some() {
                        label.push_str(" [target]");
                    }
                    if stage.gate == GatePolicy::Advisory {
                        label.push_str(" [advisory]");
                    }
                }
                label
            })
            .collect();
        println!("  batch {}: {}", idx + 1, labels.join(", "));
    }
}

fn lock_cmd(path: &Path, output: Option<PathBuf>) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    let report = validate_definition(&definition);
    log_validation(path, &report);
    if !report.is_ok() {
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    let output_path = output.unwrap_or_else(|| path.with_extension("lock"));
    create_parent(&output_path)?;
    let lock = generate_lock(&definition, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        stages = lock.stages.len(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn lint_definitions(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        bail!("No pipeline definitions supplied for linting");
    }

    let mut failures = 0usize;
    for path in paths {
        match PipelineDefinition::load(path) {
            Ok(definition) => {
                let report = validate_definition(&definition);
                log_validation(path, &report);
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline definition: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} definition(s)");
    }

    info!("All pipeline lint checks passed");
    Ok(())
}

fn digest_cmd(path: &Path, output: Option<&Path>) -> Result<()> {
    if let Some(out_path) = output {
        let digest = write_sha256(path, out_path)?;
        println!("{}  {}", digest, path.display());
        info!(
            file = %path.display(),
            digest_output = %out_path.display(),
            "SHA256 digest written"
        );
    } else {
        let digest = compute_sha256(path)?;
        println!("{}  {}", digest, path.display());
        info!(file = %path.display(), "SHA256 computed");
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Run CI/CD pipelines as a dependency graph of stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition.
    Run(RunArgs),
    /// Check a definition without running anything.
    Validate { definition: PathBuf },
    /// Print the stages grouped into concurrent batches.
    Plan { definition: PathBuf },
    /// Write a lockfile with per-stage definition hashes.
    Lock {
        definition: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate a definition from a preset.
    New {
        /// container-ci or minimal.
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        definitions: Vec<PathBuf>,
    },
    /// Print (and optionally write) the SHA256 of a file.
    Digest {
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    definition: PathBuf,
    /// Working directory for actions; relative artifact paths resolve here.
    #[arg(long, env = "PIPEWRIGHT_WORKDIR")]
    workdir: Option<PathBuf>,
    /// Relative paths resolve against the working directory.
    #[arg(long, env = "PIPEWRIGHT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    /// Defaults to `<state-dir>/runs/<run-id>/report.json`.
    #[arg(long, env = "PIPEWRIGHT_REPORT")]
    report: Option<PathBuf>,
    #[arg(long, env = "PIPEWRIGHT_MAX_PARALLEL")]
    max_parallel: Option<usize>,
    /// YAML map of secret name to value, consulted before the environment.
    #[arg(long, env = "PIPEWRIGHT_SECRETS_FILE")]
    secrets_file: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
    /// Write a sha256sum-compatible listing of file artifacts.
    #[arg(long)]
    checksums: Option<PathBuf>,
}
