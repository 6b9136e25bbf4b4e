//! Run command implementation.
//!
//! Loads the configuration once, runs a single step through the standard
//! registry and prints a summary of what it produced.

use super::ConfigSource;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use tuneline_core::contract::ContractOutcome;
use tuneline_core::metrics::MetricsOutcome;
use tuneline_core::persist::WriteOutcome;
use tuneline_core::{
    ArtifactRegistry, CommandGenerator, ConvertSummary, MatrixOutcome, ProbeSummary, ProcessRunner, StageOutcome,
    StepContext, StepId, StepOutcome, StepRegistry, ValidationReport,
};

/// Environment variable naming the step when none is given on the command line.
pub const STEP_ENV: &str = "STEP_NAME";

pub fn execute(source: &ConfigSource, step: Option<String>) -> Result<()> {
    let name = match step {
        Some(s) => s,
        None => match std::env::var(STEP_ENV) {
            Ok(s) if !s.trim().is_empty() => s,
            _ => bail!("No step given. Pass one to `tuneline run` or set {}", STEP_ENV),
        },
    };
    let id: StepId = name.parse()?;
    let config = source.load()?;

    let registry = StepRegistry::standard();
    let mut runner = ProcessRunner;
    let mut generator = CommandGenerator::from_config(&config.probe);
    let mut ctx = StepContext { config: &config, runner: &mut runner, generator: &mut generator };

    let outcome = registry.run(id, &mut ctx).with_context(|| format!("Step `{}` failed", id))?;

    println!();
    match outcome {
        StepOutcome::Contract(o) => print_contract(&o),
        StepOutcome::Validate(report) => print_validation(&report),
        StepOutcome::Matrix(o) => print_matrix(&o),
        StepOutcome::Register(registry) => print_registry(&registry),
        StepOutcome::FuseQuantize(summary) => print_convert(&summary),
        StepOutcome::Probe(summary) => print_probe(&summary),
        StepOutcome::Metrics(o) => print_metrics(&o),
    }
    println!();
    Ok(())
}

fn write_label(outcome: WriteOutcome) -> colored::ColoredString {
    match outcome {
        WriteOutcome::Written => "written".green(),
        WriteOutcome::Skipped => "kept existing".yellow(),
    }
}

fn print_contract(o: &ContractOutcome) {
    println!("{}", "Data Contract".bold().cyan());
    println!("  {} {} ({})", "✓".green(), o.contract_path.display(), write_label(o.contract_write));
    println!("  {} {} ({})", "✓".green(), o.catalog_path.display(), write_label(o.catalog_write));
    println!("  {:<8} lines={} bytes={}", "train:", o.train.newline_count, o.train.bytes);
    println!("  {:<8} lines={} bytes={}", "valid:", o.valid.newline_count, o.valid.bytes);
    println!("  {:<8} {}", "field:", o.contract.text_field().cyan());
}

fn print_validation(report: &ValidationReport) {
    println!("{}", "Validation Report".bold().cyan());
    println!("  {} {}", "text field:".dimmed(), report.text_field);
    for (split, stats) in &report.splits {
        println!("  {}", stats.summary_line(split));
    }
}

fn print_matrix(o: &MatrixOutcome) {
    println!("{}", format!("Experiment Matrix ({} runs)", o.rows.len()).bold().cyan());
    println!(
        "  {} train={} valid={} ({:?})",
        "counts:".dimmed(),
        o.counts.train,
        o.counts.valid,
        o.counts.source
    );
    println!();
    println!("  {:<36} {:>7} {:>6} {:>12}", "Model", "Iters", "Batch", "Est tokens");
    println!("  {}", "─".repeat(64));
    for row in &o.rows {
        println!("  {:<36} {:>7} {:>6} {:>12}", row.model_id.cyan(), row.iters, row.batch_size, row.est_tokens);
    }
    println!();
    println!("  {} {}", "✓".green(), o.path.display());
}

fn print_registry(registry: &ArtifactRegistry) {
    println!("{}", format!("Artifact Registry ({} runs)", registry.runs.len()).bold().cyan());
    println!();
    println!("  {:<36} {:>8} {:>6} {:>6} {:>10}", "Model", "Adapter", "Logs", "Fused", "Quantized");
    println!("  {}", "─".repeat(72));
    for run in &registry.runs {
        println!(
            "  {:<36} {:>8} {:>6} {:>6} {:>10}",
            run.model_id.cyan(),
            run.files.adapter.len(),
            run.files.logs.len(),
            run.files.fused.len(),
            run.files.quantized.len()
        );
    }
}

fn stage_label(stage: &StageOutcome) -> colored::ColoredString {
    match stage {
        StageOutcome::Completed => stage.label().green(),
        StageOutcome::Failed(_) => stage.label().red(),
        StageOutcome::Planned(_) | StageOutcome::Skipped(_) => stage.label().yellow(),
        StageOutcome::NotRequested | StageOutcome::AlreadyPresent => stage.label().dimmed(),
    }
}

fn print_convert(summary: &ConvertSummary) {
    println!("{}", "Fuse and Quantize".bold().cyan());
    println!();
    for run in &summary.runs {
        println!("  {:<36} fuse={} quantize={}", run.model_id.cyan(), stage_label(&run.fuse), stage_label(&run.quantize));
        for stage in [&run.fuse, &run.quantize] {
            match stage {
                StageOutcome::Planned(cmd) => println!("    {} {}", "would run:".dimmed(), cmd),
                StageOutcome::Failed(reason) | StageOutcome::Skipped(reason) => {
                    println!("    {}", reason.dimmed());
                }
                _ => {}
            }
        }
    }
    println!();
    if summary.updated {
        println!("  {} {}", "✓".green(), summary.artifacts_path.display());
    } else {
        println!("  {}", "Registry unchanged.".dimmed());
    }
}

fn print_probe(summary: &ProbeSummary) {
    println!("{}", "Generation Probe".bold().cyan());
    println!("  {} {} records -> {}", "✓".green(), summary.records, summary.path.display());
    for failed in &summary.failed_artifacts {
        println!("  {} {}", "✗".red(), failed);
    }
}

fn print_metrics(o: &MetricsOutcome) {
    println!("{}", "Generation Metrics".bold().cyan());
    println!();
    println!("  {:<14} {:<10} {:>4} {:>7} {:>9} {:>9}", "Artifact", "Variant", "N", "Empty", "Sent-end", "Avg words");
    println!("  {}", "─".repeat(58));
    for g in &o.analysis.groups {
        println!(
            "  {:<14} {:<10} {:>4} {:>7.3} {:>9.3} {:>9.2}",
            g.artifact.label(),
            g.prompt_variant.label(),
            g.n,
            g.empty_rate,
            g.sent_end_rate,
            g.avg_len_words
        );
    }
    println!();
    match &o.analysis.winner {
        Some(w) => println!(
            "  {} {} + {}",
            "winner:".bold(),
            w.artifact.label().green(),
            w.prompt_variant.label().green()
        ),
        None => println!("  {}", "No generations to score.".yellow()),
    }
    for note in &o.analysis.notes {
        println!("  {}", note.dimmed());
    }
    if let Some(path) = &o.policy_path {
        println!("  {} {}", "✓".green(), path.display());
    }
}
