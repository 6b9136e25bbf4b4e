//! Step registry.
//!
//! Maps step ids to a parameter check and a handler. The check always runs
//! against the loaded configuration before the handler does.

use crate::config::PipelineConfig;
use crate::contract::{ContractOutcome, finalize_data_dir};
use crate::convert::{CommandRunner, ConvertSummary, run_fuse_quantize};
use crate::error::{PipelineError, PipelineResult};
use crate::matrix::{MatrixOutcome, run_matrix};
use crate::metrics::{MetricsOutcome, run_metrics};
use crate::probe::{Generator, ProbeSummary, run_probe};
use crate::registry::{ArtifactRegistry, register_runs};
use crate::validate::{ValidationReport, run_validation};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepId {
    Contract,
    Validate,
    Matrix,
    Register,
    FuseQuantize,
    Probe,
    Metrics,
}

impl StepId {
    pub const ALL: [Self; 7] =
        [Self::Contract, Self::Validate, Self::Matrix, Self::Register, Self::FuseQuantize, Self::Probe, Self::Metrics];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Validate => "validate",
            Self::Matrix => "matrix",
            Self::Register => "register",
            Self::FuseQuantize => "fuse-quantize",
            Self::Probe => "probe",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|id| id.as_str() == wanted).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|id| id.as_str()).collect();
            PipelineError::Config(format!("unknown step `{s}` (known: {})", known.join(", ")))
        })
    }
}

/// Collaborators a step may need besides the configuration.
pub struct StepContext<'a> {
    pub config: &'a PipelineConfig,
    pub runner: &'a mut dyn CommandRunner,
    pub generator: &'a mut dyn Generator,
}

#[derive(Debug)]
pub enum StepOutcome {
    Contract(Box<ContractOutcome>),
    Validate(ValidationReport),
    Matrix(MatrixOutcome),
    Register(ArtifactRegistry),
    FuseQuantize(ConvertSummary),
    Probe(ProbeSummary),
    Metrics(Box<MetricsOutcome>),
}

pub type StepCheck = fn(&PipelineConfig) -> PipelineResult<()>;
pub type StepHandler = fn(&mut StepContext<'_>) -> PipelineResult<StepOutcome>;

pub struct StepDefinition {
    pub id: StepId,
    pub summary: &'static str,
    pub check: StepCheck,
    pub run: StepHandler,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition").field("id", &self.id).field("summary", &self.summary).finish_non_exhaustive()
    }
}

fn no_check(_: &PipelineConfig) -> PipelineResult<()> {
    Ok(())
}

fn check_contract(config: &PipelineConfig) -> PipelineResult<()> {
    if config.files.train.trim().is_empty() || config.files.valid.trim().is_empty() {
        return Err(PipelineError::Config("files.train and files.valid must be set".to_string()));
    }
    Ok(())
}

fn check_convert(config: &PipelineConfig) -> PipelineResult<()> {
    let convert = &config.convert;
    if convert.python.trim().is_empty() {
        return Err(PipelineError::Config("convert.python must be set".to_string()));
    }
    if convert.dtype.trim().is_empty() {
        return Err(PipelineError::Config("convert.dtype must be set".to_string()));
    }
    Ok(())
}

fn check_probe(config: &PipelineConfig) -> PipelineResult<()> {
    let probe = &config.probe;
    if probe.prompts.iter().all(|p| p.trim().is_empty()) {
        return Err(PipelineError::Config("probe.prompts must list at least one prompt".to_string()));
    }
    if probe.variants.is_empty() {
        return Err(PipelineError::Config("probe.variants must list at least one variant".to_string()));
    }
    if probe.python.trim().is_empty() {
        return Err(PipelineError::Config("probe.python must be set".to_string()));
    }
    Ok(())
}

fn run_contract_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    finalize_data_dir(ctx.config).map(|o| StepOutcome::Contract(Box::new(o)))
}

fn run_validate_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    run_validation(ctx.config).map(StepOutcome::Validate)
}

fn run_matrix_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    run_matrix(ctx.config).map(StepOutcome::Matrix)
}

fn run_register_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    register_runs(ctx.config).map(StepOutcome::Register)
}

fn run_convert_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    run_fuse_quantize(ctx.config, ctx.runner).map(StepOutcome::FuseQuantize)
}

fn run_probe_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    run_probe(ctx.config, ctx.generator).map(StepOutcome::Probe)
}

fn run_metrics_step(ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
    run_metrics(ctx.config).map(|o| StepOutcome::Metrics(Box::new(o)))
}

#[derive(Debug)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
}

impl StepRegistry {
    /// Every pipeline step, in run order.
    #[must_use]
    pub fn standard() -> Self {
        let steps = vec![
            StepDefinition {
                id: StepId::Contract,
                summary: "write data_contract.json and data_catalog.json",
                check: check_contract,
                run: run_contract_step,
            },
            StepDefinition {
                id: StepId::Validate,
                summary: "scan every split and write data_report.json",
                check: no_check,
                run: run_validate_step,
            },
            StepDefinition {
                id: StepId::Matrix,
                summary: "plan one training run per model in experiments.csv",
                check: no_check,
                run: run_matrix_step,
            },
            StepDefinition {
                id: StepId::Register,
                summary: "hash run outputs into artifacts.json",
                check: no_check,
                run: run_register_step,
            },
            StepDefinition {
                id: StepId::FuseQuantize,
                summary: "fuse adapters and rebuild quantized models",
                check: check_convert,
                run: run_convert_step,
            },
            StepDefinition {
                id: StepId::Probe,
                summary: "sample generations per artifact and prompt variant",
                check: check_probe,
                run: run_probe_step,
            },
            StepDefinition {
                id: StepId::Metrics,
                summary: "score generations and lock a generation policy",
                check: no_check,
                run: run_metrics_step,
            },
        ];
        Self { steps }
    }

    #[must_use]
    pub fn get(&self, id: StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    /// Validate the step's parameters, then run it.
    pub fn run(&self, id: StepId, ctx: &mut StepContext<'_>) -> PipelineResult<StepOutcome> {
        let step = self
            .get(id)
            .ok_or_else(|| PipelineError::Config(format!("step `{id}` is not registered")))?;
        (step.check)(ctx.config)?;
        tracing::info!(step = %id, "running step");
        (step.run)(ctx)
    }
}
