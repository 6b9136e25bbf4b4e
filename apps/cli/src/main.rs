//! Tuneline CLI - command-line driver for the fine-tuning pipeline
//!
//! Every pipeline step reads its parameters from the layered configuration;
//! the CLI only picks the step and the configuration sources.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tuneline_core::config::{DEFAULT_BASE_PATH, DEFAULT_LOCAL_PATH};

use commands::types::ConfigCommand;
use commands::{ConfigSource, config, run, steps};

/// Tuneline - file-based fine-tuning pipeline for small language models
#[derive(Parser, Debug)]
#[command(
    name = "tuneline",
    author,
    version,
    about = "Tuneline - dataset contracts, run planning, conversion and generation probes",
    long_about = "Tuneline prepares JSONL datasets, plans one fine-tuning run per model, registers and converts the \
                  resulting artifacts, and probes generations to lock a generation policy.\nEach step reads and \
                  writes plain files; run them one at a time with `tuneline run <STEP>`."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base configuration file (must exist)
    #[arg(short, long, default_value = DEFAULT_BASE_PATH, global = true)]
    config: PathBuf,

    /// Local override file (optional)
    #[arg(long, default_value = DEFAULT_LOCAL_PATH, global = true)]
    local: PathBuf,

    /// Override a configuration value: `section.key=value` (value is JSON-decoded)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one pipeline step
    ///
    /// The step may also be named by the STEP_NAME environment variable.
    Run {
        /// Step id (contract, validate, matrix, register, fuse-quantize, probe, metrics)
        step: Option<String>,
    },

    /// List registered pipeline steps
    Steps,

    /// Inspect the layered configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let source = ConfigSource { base: args.config, local: args.local, overrides: args.set };

    match args.command {
        Some(Command::Run { step }) => run::execute(&source, step),
        Some(Command::Steps) => steps::execute(),
        Some(Command::Config(command)) => config::execute(&source, command),
        None => {
            Args::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
