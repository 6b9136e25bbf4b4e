use crate::error::PipelineResult;
use std::path::{Path, PathBuf};

/// Filesystem-safe tag for a model id: every `/` becomes `--`.
#[must_use]
pub fn model_tag(model_id: &str) -> String {
    model_id.replace('/', "--")
}

/// Filesystem layout for per-model run outputs.
///
/// Layout is `<run_dir>/<model_tag>/{adapter,logs,fused/model,quantized}`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn output_root(&self, model_id: &str) -> PathBuf {
        self.root.join(model_tag(model_id))
    }

    #[must_use]
    pub fn adapter_dir(&self, model_id: &str) -> PathBuf {
        self.output_root(model_id).join("adapter")
    }

    #[must_use]
    pub fn logs_dir(&self, model_id: &str) -> PathBuf {
        self.output_root(model_id).join("logs")
    }

    #[must_use]
    pub fn fused_dir(&self, model_id: &str) -> PathBuf {
        fused_dir_under(&self.output_root(model_id))
    }

    #[must_use]
    pub fn quantized_dir(&self, model_id: &str) -> PathBuf {
        quantized_dir_under(&self.output_root(model_id))
    }

    /// Create the output root plus the parents of the fused and quantized dirs.
    ///
    /// The fused and quantized directories themselves are left absent; their
    /// existence is what marks a stage as done.
    pub fn ensure_run_dirs(&self, model_id: &str) -> PipelineResult<()> {
        let out_root = self.output_root(model_id);
        std::fs::create_dir_all(&out_root)?;
        if let Some(parent) = self.fused_dir(model_id).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[must_use]
pub fn fused_dir_under(output_root: &Path) -> PathBuf {
    output_root.join("fused").join("model")
}

#[must_use]
pub fn quantized_dir_under(output_root: &Path) -> PathBuf {
    output_root.join("quantized")
}
