//! Fuse and quantize driver.
//!
//! Per registry entry: fuse the adapter into the base model when no fused
//! directory exists yet, then rebuild the quantized directory from scratch.
//! A failing entry is recorded and skipped; the batch always continues.

use crate::config::{ConvertConfig, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::persist::utc_now;
use crate::registry::{ArtifactRegistry, RunEntry};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

pub type ConvertOptions = ConvertConfig;

/// A program and its arguments, spawned without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Value following `flag`, if present.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandStatus {
    #[must_use]
    pub fn ok() -> Self {
        Self { success: true, code: Some(0) }
    }

    #[must_use]
    pub fn failed(code: i32) -> Self {
        Self { success: false, code: Some(code) }
    }
}

/// Runs external commands to completion.
pub trait CommandRunner {
    fn run(&mut self, command: &ExternalCommand) -> PipelineResult<CommandStatus>;
}

/// Spawns real processes and blocks until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, command: &ExternalCommand) -> PipelineResult<CommandStatus> {
        let status = Command::new(&command.program)
            .args(&command.args)
            .status()
            .map_err(|source| PipelineError::Command { program: command.program.clone(), source })?;
        Ok(CommandStatus { success: status.success(), code: status.code() })
    }
}

#[must_use]
pub fn fuse_command(options: &ConvertOptions, entry: &RunEntry, fused: &std::path::Path) -> ExternalCommand {
    ExternalCommand::new(&options.python)
        .arg("-m")
        .arg(&options.fuse_module)
        .arg("--model")
        .arg(&entry.model_id)
        .arg("--adapter-path")
        .arg(&entry.adapter_dir)
        .arg("--save-path")
        .arg(fused.display().to_string())
}

#[must_use]
pub fn quantize_command(
    options: &ConvertOptions,
    fused: &std::path::Path,
    quantized: &std::path::Path,
) -> ExternalCommand {
    ExternalCommand::new(&options.python)
        .arg("-m")
        .arg(&options.convert_module)
        .arg("--hf-path")
        .arg(fused.display().to_string())
        .arg("--mlx-path")
        .arg(quantized.display().to_string())
        .arg("--q-bits")
        .arg(options.q_bits.to_string())
        .arg("--q-group-size")
        .arg(options.q_group_size.to_string())
        .arg("--dtype")
        .arg(&options.dtype)
        .arg("-q")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Fusing is disabled and nothing was found on disk.
    NotRequested,
    /// Output already on disk; re-hashed only.
    AlreadyPresent,
    /// Dry run: the command was logged, not executed.
    Planned(String),
    Completed,
    Failed(String),
    Skipped(String),
}

impl StageOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotRequested => "not requested",
            Self::AlreadyPresent => "present",
            Self::Planned(_) => "planned",
            Self::Completed => "done",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConvertOutcome {
    pub model_id: String,
    pub fuse: StageOutcome,
    pub quantize: StageOutcome,
}

#[derive(Debug, Clone)]
pub struct ConvertSummary {
    pub artifacts_path: PathBuf,
    /// True when the registry was rewritten.
    pub updated: bool,
    pub runs: Vec<RunConvertOutcome>,
}

fn describe_failure(status: PipelineResult<CommandStatus>) -> Option<String> {
    match status {
        Ok(s) if s.success => None,
        Ok(s) => Some(s.code.map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"))),
        Err(e) => Some(e.to_string()),
    }
}

fn fuse_stage(
    entry: &mut RunEntry,
    options: &ConvertOptions,
    runner: &mut dyn CommandRunner,
) -> PipelineResult<(StageOutcome, bool)> {
    let fused = entry.fused_path();
    if fused.exists() {
        entry.refresh_fused()?;
        return Ok((StageOutcome::AlreadyPresent, false));
    }
    if !options.do_fuse {
        return Ok((StageOutcome::NotRequested, false));
    }

    let cmd = fuse_command(options, entry, &fused);
    if options.dry_run {
        tracing::info!(model_id = %entry.model_id, command = %cmd, "dry run; not executing fuse");
        return Ok((StageOutcome::Planned(cmd.to_string()), false));
    }

    if let Some(parent) = fused.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(model_id = %entry.model_id, command = %cmd, "fusing adapter");
    if let Some(reason) = describe_failure(runner.run(&cmd)) {
        tracing::warn!(model_id = %entry.model_id, %reason, "fuse failed");
        return Ok((StageOutcome::Failed(reason), false));
    }
    entry.refresh_fused()?;
    if entry.files.fused.is_absent() {
        let reason = format!("{} missing after fuse", fused.display());
        tracing::warn!(model_id = %entry.model_id, %reason, "fuse failed");
        return Ok((StageOutcome::Failed(reason), false));
    }
    Ok((StageOutcome::Completed, true))
}

fn quantize_stage(
    entry: &mut RunEntry,
    options: &ConvertOptions,
    runner: &mut dyn CommandRunner,
) -> PipelineResult<(StageOutcome, bool)> {
    let fused = entry.fused_path();
    if !fused.exists() {
        tracing::info!(model_id = %entry.model_id, "skipping quantize: fused dir missing");
        return Ok((StageOutcome::Skipped("fused dir missing".to_string()), false));
    }

    let quantized = entry.quantized_path();
    let cmd = quantize_command(options, &fused, &quantized);
    if options.dry_run {
        if quantized.exists() {
            tracing::info!(path = %quantized.display(), "dry run; would remove existing quantized dir");
        }
        tracing::info!(model_id = %entry.model_id, command = %cmd, "dry run; not executing quantize");
        return Ok((StageOutcome::Planned(cmd.to_string()), false));
    }

    // The converter refuses to write into an existing destination.
    if quantized.exists() {
        tracing::info!(path = %quantized.display(), "removing pre-existing quantized dir");
        if let Err(e) = std::fs::remove_dir_all(&quantized) {
            let reason = format!("cannot remove {}: {e}", quantized.display());
            tracing::warn!(model_id = %entry.model_id, %reason, "quantize skipped");
            return Ok((StageOutcome::Failed(reason), false));
        }
    }

    tracing::info!(model_id = %entry.model_id, command = %cmd, "quantizing");
    if let Some(reason) = describe_failure(runner.run(&cmd)) {
        tracing::warn!(model_id = %entry.model_id, %reason, "quantize failed");
        entry.refresh_quantized()?;
        return Ok((StageOutcome::Failed(reason), true));
    }

    entry.refresh_quantized()?;
    if entry.files.quantized.is_absent() {
        let reason = format!("{} missing after conversion", quantized.display());
        tracing::warn!(model_id = %entry.model_id, %reason, "quantize failed");
        return Ok((StageOutcome::Failed(reason), true));
    }
    entry.quantize_bits = Some(options.q_bits);
    entry.q_group_size = Some(options.q_group_size);
    Ok((StageOutcome::Completed, true))
}

/// Drive both stages over every run entry, mutating `registry` in place.
///
/// Returns the per-run outcomes and whether anything in the registry changed.
/// Dry runs never execute, delete, or mark the registry changed.
pub fn fuse_and_quantize(
    registry: &mut ArtifactRegistry,
    options: &ConvertOptions,
    runner: &mut dyn CommandRunner,
) -> PipelineResult<(Vec<RunConvertOutcome>, bool)> {
    let mut updated = false;
    let mut outcomes = Vec::with_capacity(registry.runs.len());

    for entry in &mut registry.runs {
        let (fuse, fused_changed) = fuse_stage(entry, options, runner)?;
        updated |= fused_changed;

        let quantize = if matches!(fuse, StageOutcome::Failed(_)) {
            StageOutcome::Skipped("fuse failed".to_string())
        } else {
            let (outcome, changed) = quantize_stage(entry, options, runner)?;
            updated |= changed;
            outcome
        };

        outcomes.push(RunConvertOutcome { model_id: entry.model_id.clone(), fuse, quantize });
    }

    if updated {
        registry.updated_utc = Some(utc_now());
    }
    Ok((outcomes, updated))
}

/// Load `artifacts.json`, run both stages and save it when something changed.
pub fn run_fuse_quantize(config: &PipelineConfig, runner: &mut dyn CommandRunner) -> PipelineResult<ConvertSummary> {
    let artifacts_path = config.artifacts_path();
    let mut registry = ArtifactRegistry::load(&artifacts_path)?;
    if registry.runs.is_empty() {
        return Err(PipelineError::Artifact(format!("no runs in {}", artifacts_path.display())));
    }

    let (runs, updated) = fuse_and_quantize(&mut registry, &config.convert, runner)?;
    if updated {
        registry.save(&artifacts_path)?;
        tracing::info!(path = %artifacts_path.display(), "updated artifact registry");
    }
    Ok(ConvertSummary { artifacts_path, updated, runs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArtifactState, RunFiles, TrainingParams, scan_dir};
    use std::path::Path;
    use tempfile::TempDir;

    /// Creates the output directory of each command and records every call.
    #[derive(Default)]
    struct FakeRunner {
        calls: Vec<ExternalCommand>,
        fail_fuse_for: Option<String>,
        quantized_existed_at_call: Vec<bool>,
    }

    impl CommandRunner for FakeRunner {
        fn run(&mut self, command: &ExternalCommand) -> PipelineResult<CommandStatus> {
            self.calls.push(command.clone());
            if let Some(save) = command.flag_value("--save-path") {
                if self.fail_fuse_for.as_deref() == command.flag_value("--model") {
                    return Ok(CommandStatus::failed(1));
                }
                std::fs::create_dir_all(save).unwrap();
                std::fs::write(Path::new(save).join("model.safetensors"), b"fused").unwrap();
            }
            if let Some(out) = command.flag_value("--mlx-path") {
                self.quantized_existed_at_call.push(Path::new(out).exists());
                std::fs::create_dir_all(out).unwrap();
                std::fs::write(Path::new(out).join("model.safetensors"), b"q4").unwrap();
            }
            Ok(CommandStatus::ok())
        }
    }

    fn entry(root: &Path, model_id: &str) -> RunEntry {
        let out = root.join(model_id.replace('/', "--"));
        std::fs::create_dir_all(out.join("adapter")).unwrap();
        RunEntry {
            model_id: model_id.to_string(),
            output_root: out.display().to_string(),
            adapter_dir: out.join("adapter").display().to_string(),
            logs_dir: out.join("logs").display().to_string(),
            fused_dir: None,
            quantized_dir: None,
            files: RunFiles::default(),
            training_params: TrainingParams::default(),
            quantize_bits: None,
            q_group_size: None,
        }
    }

    fn registry(root: &Path, models: &[&str]) -> ArtifactRegistry {
        ArtifactRegistry {
            created_utc: "t".to_string(),
            updated_utc: None,
            runs: models.iter().map(|m| entry(root, m)).collect(),
        }
    }

    #[test]
    fn test_fuse_then_quantize() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a"]);
        let mut runner = FakeRunner::default();

        let (outcomes, updated) = fuse_and_quantize(&mut reg, &ConvertOptions::default(), &mut runner).unwrap();

        assert!(updated);
        assert!(reg.updated_utc.is_some());
        assert_eq!(outcomes[0].fuse, StageOutcome::Completed);
        assert_eq!(outcomes[0].quantize, StageOutcome::Completed);
        assert_eq!(runner.calls.len(), 2);
        assert_eq!(runner.calls[0].args[..2], ["-m".to_string(), "mlx_lm.fuse".to_string()]);
        assert_eq!(runner.calls[1].flag_value("--q-bits"), Some("4"));
        assert_eq!(runner.calls[1].args.last().map(String::as_str), Some("-q"));

        let run = &reg.runs[0];
        assert_eq!(run.files.fused.len(), 1);
        assert_eq!(run.files.quantized.len(), 1);
        assert_eq!(run.quantize_bits, Some(4));
        assert_eq!(run.q_group_size, Some(64));
        assert!(run.fused_dir.as_deref().unwrap().ends_with("fused/model"));
    }

    #[test]
    fn test_existing_quantized_dir_is_removed_before_convert() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a"]);
        let fused = reg.runs[0].fused_path();
        let quantized = reg.runs[0].quantized_path();
        std::fs::create_dir_all(&fused).unwrap();
        std::fs::write(fused.join("w.bin"), b"w").unwrap();
        std::fs::create_dir_all(&quantized).unwrap();
        std::fs::write(quantized.join("stale.bin"), b"old").unwrap();

        let mut runner = FakeRunner::default();
        let (outcomes, _) = fuse_and_quantize(&mut reg, &ConvertOptions::default(), &mut runner).unwrap();

        assert_eq!(outcomes[0].fuse, StageOutcome::AlreadyPresent);
        assert_eq!(runner.calls.len(), 1);
        assert_eq!(runner.quantized_existed_at_call, vec![false]);
        assert!(!quantized.join("stale.bin").exists());
        let rels: Vec<&str> = reg.runs[0].files.quantized.files().iter().map(|f| f.rel.as_str()).collect();
        assert_eq!(rels, vec!["model.safetensors"]);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a", "org/b"]);
        let fused = reg.runs[1].fused_path();
        let quantized = reg.runs[1].quantized_path();
        std::fs::create_dir_all(&fused).unwrap();
        std::fs::create_dir_all(&quantized).unwrap();
        std::fs::write(quantized.join("keep.bin"), b"k").unwrap();

        let options = ConvertOptions { dry_run: true, ..ConvertOptions::default() };
        let mut runner = FakeRunner::default();
        let (outcomes, updated) = fuse_and_quantize(&mut reg, &options, &mut runner).unwrap();

        assert!(runner.calls.is_empty());
        assert!(!updated);
        assert!(reg.updated_utc.is_none());
        assert!(matches!(outcomes[0].fuse, StageOutcome::Planned(_)));
        assert!(matches!(outcomes[0].quantize, StageOutcome::Skipped(_)));
        assert!(matches!(outcomes[1].quantize, StageOutcome::Planned(_)));
        assert!(quantized.join("keep.bin").exists());
        assert!(!reg.runs[0].fused_path().exists());
    }

    #[test]
    fn test_fuse_failure_skips_quantize_and_continues() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a", "org/b"]);
        let mut runner = FakeRunner { fail_fuse_for: Some("org/a".to_string()), ..FakeRunner::default() };

        let (outcomes, updated) = fuse_and_quantize(&mut reg, &ConvertOptions::default(), &mut runner).unwrap();

        assert!(updated);
        assert_eq!(outcomes[0].fuse, StageOutcome::Failed("exit code 1".to_string()));
        assert_eq!(outcomes[0].quantize, StageOutcome::Skipped("fuse failed".to_string()));
        assert_eq!(outcomes[1].quantize, StageOutcome::Completed);
        assert!(reg.runs[0].files.quantized.is_absent());
        assert_eq!(scan_dir(&reg.runs[1].quantized_path()).unwrap().len(), 1);
    }

    /// Exits cleanly without producing anything.
    struct SilentRunner {
        calls: usize,
    }

    impl CommandRunner for SilentRunner {
        fn run(&mut self, _command: &ExternalCommand) -> PipelineResult<CommandStatus> {
            self.calls += 1;
            Ok(CommandStatus::ok())
        }
    }

    #[test]
    fn test_fuse_without_output_dir_is_failure() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a"]);
        let mut runner = SilentRunner { calls: 0 };

        let (outcomes, updated) = fuse_and_quantize(&mut reg, &ConvertOptions::default(), &mut runner).unwrap();

        assert_eq!(runner.calls, 1);
        assert!(!updated);
        assert!(reg.updated_utc.is_none());
        assert!(matches!(&outcomes[0].fuse, StageOutcome::Failed(r) if r.ends_with("missing after fuse")));
        assert_eq!(outcomes[0].quantize, StageOutcome::Skipped("fuse failed".to_string()));
        assert!(reg.runs[0].fused_dir.is_none());
        assert!(reg.runs[0].files.fused.is_absent());
    }

    #[test]
    fn test_fuse_disabled_without_fused_dir() {
        let temp = TempDir::new().unwrap();
        let mut reg = registry(temp.path(), &["org/a"]);
        let options = ConvertOptions { do_fuse: false, ..ConvertOptions::default() };
        let mut runner = FakeRunner::default();
        let (outcomes, updated) = fuse_and_quantize(&mut reg, &options, &mut runner).unwrap();

        assert!(!updated);
        assert_eq!(outcomes[0].fuse, StageOutcome::NotRequested);
        assert!(matches!(outcomes[0].quantize, StageOutcome::Skipped(_)));
        assert_eq!(reg.runs[0].files.fused, ArtifactState::Absent);
    }

    #[test]
    fn test_command_display_quotes_spaces() {
        let cmd = ExternalCommand::new("python3").arg("-m").arg("a b");
        assert_eq!(cmd.to_string(), "python3 -m \"a b\"");
    }
}
