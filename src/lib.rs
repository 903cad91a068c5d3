pub mod artifacts;
pub mod definition;
pub mod digest;
pub mod error;
pub mod executor;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod secrets;
pub mod target;
pub mod template;
pub mod validation;

pub use artifacts::{Artifact, ArtifactBus, ArtifactValue};
pub use definition::PipelineDefinition;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{EngineOptions, PipelineEngine};
pub use report::{PipelineReport, RunRecord, StageStatus, Verdict};
pub use secrets::{SecretStore, SecretValue};
