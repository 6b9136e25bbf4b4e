//! Tuneline Core
//!
//! File-based pipeline for preparing, fine-tuning and probing small language
//! models:
//! - Pinning a dataset contract and catalog (`contract`)
//! - Validating JSONL splits into a data report (`validate`)
//! - Planning one training run per model (`matrix`)
//! - Registering, fusing and quantizing run outputs (`registry`, `convert`)
//! - Probing generations and locking a generation policy (`probe`, `metrics`)
//!
//! Every step reads and writes plain files under the configured directories,
//! so steps can be run one at a time through [`StepRegistry`].

pub mod config;
pub mod contract;
pub mod convert;
pub mod corpus;
pub mod error;
pub mod hashing;
pub mod layout;
pub mod matrix;
pub mod metrics;
pub mod persist;
pub mod probe;
pub mod registry;
pub mod schema;
pub mod steps;
pub mod validate;

pub use config::{ConfigLoader, LayeredConfig, PipelineConfig};
pub use contract::{Catalog, Contract, ContractOutcome, finalize_data_dir};
pub use convert::{CommandRunner, ConvertSummary, ExternalCommand, ProcessRunner, StageOutcome, run_fuse_quantize};
pub use error::{PipelineError, PipelineResult};
pub use layout::{RunLayout, model_tag};
pub use matrix::{ExperimentRow, HyperParams, MatrixOutcome, run_matrix};
pub use metrics::{Analysis, MetricsOutcome, run_metrics};
pub use probe::{ArtifactKind, CommandGenerator, Generator, GenerationRecord, ProbeSummary, PromptVariant, run_probe};
pub use registry::{ArtifactRegistry, RunEntry, register_runs};
pub use steps::{StepContext, StepDefinition, StepId, StepOutcome, StepRegistry};
pub use validate::{ValidationReport, run_validation};
