//! Command implementations for the Tuneline CLI.

pub mod config;
pub mod run;
pub mod steps;
pub mod types;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tuneline_core::{ConfigLoader, LayeredConfig, PipelineConfig};

/// Where the layered configuration comes from, as given on the command line.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub base: PathBuf,
    pub local: PathBuf,
    pub overrides: Vec<String>,
}

impl ConfigSource {
    fn loader(&self) -> ConfigLoader {
        ConfigLoader::new(&self.base).with_local(&self.local).with_overrides(self.overrides.iter().cloned())
    }

    pub fn load_layered(&self) -> Result<LayeredConfig> {
        self.loader()
            .load_layered()
            .with_context(|| format!("Failed to load configuration from {}", self.base.display()))
    }

    pub fn load(&self) -> Result<PipelineConfig> {
        self.loader().load().with_context(|| format!("Invalid configuration in {}", self.base.display()))
    }
}
