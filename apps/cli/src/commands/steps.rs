//! Steps command implementation.

use anyhow::Result;
use colored::Colorize;
use tuneline_core::StepRegistry;

pub fn execute() -> Result<()> {
    let registry = StepRegistry::standard();

    println!();
    println!("{}", "Pipeline Steps".bold().cyan());
    println!();
    for (i, step) in registry.iter().enumerate() {
        println!("  {}. {:<15} {}", i + 1, step.id.as_str().cyan(), step.summary.dimmed());
    }
    println!();
    println!("  {}", "Run one with `tuneline run <STEP>` or set STEP_NAME.".dimmed());
    println!();
    Ok(())
}
