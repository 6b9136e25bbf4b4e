//! Config command implementation.

use super::ConfigSource;
use super::types::ConfigCommand;
use anyhow::{Result, bail};
use colored::Colorize;

pub fn execute(source: &ConfigSource, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show { path } => show(source, path.as_deref()),
        ConfigCommand::Check => check(source),
    }
}

fn show(source: &ConfigSource, path: Option<&str>) -> Result<()> {
    let layered = source.load_layered()?;
    let value = match path {
        Some(p) => match layered.get(p) {
            Some(v) => v,
            None => bail!("No configuration value at `{}`", p),
        },
        None => layered.as_value(),
    };
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    println!("{} {}", "✓".green(), "Configuration is valid".bold());
    println!("  {:<10} {}", "models:", config.matrix.models.join(", ").cyan());
    println!("  {:<10} {}", "data:", config.paths.data_dir.display().to_string().dimmed());
    println!("  {:<10} {}", "runs:", config.paths.run_dir.display().to_string().dimmed());
    println!("  {:<10} {}", "eval:", config.paths.eval_dir.display().to_string().dimmed());
    Ok(())
}
