//! Artifact registry (`artifacts.json`).
//!
//! One entry per experiment row. Every artifact directory is described by an
//! [`ArtifactState`]: absent, or present with a hash manifest of every regular
//! file under it. States are always recomputed from the filesystem.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::hashing::count_lines_bytes_sha;
use crate::layout::{RunLayout, fused_dir_under, quantized_dir_under};
use crate::matrix::{ExperimentRow, read_experiments_csv};
use crate::persist::{format_utc, read_json, utc_now, write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path.
    pub path: String,
    /// Path relative to the scanned directory, `/`-separated.
    pub rel: String,
    pub bytes: u64,
    pub sha256: String,
    pub mtime_utc: String,
}

/// State of one artifact directory.
///
/// Serialized as the bare file list; `Absent` writes `[]`. A bare `[]` reads
/// back as an empty `Present`; [`ArtifactRegistry::load`] restores `Absent`
/// for directories that do not exist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<FileRecord>", into = "Vec<FileRecord>")]
pub enum ArtifactState {
    #[default]
    Absent,
    Present(Vec<FileRecord>),
}

impl ArtifactState {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    #[must_use]
    pub fn files(&self) -> &[FileRecord] {
        match self {
            Self::Absent => &[],
            Self::Present(files) => files,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }
}

impl From<Vec<FileRecord>> for ArtifactState {
    fn from(files: Vec<FileRecord>) -> Self {
        Self::Present(files)
    }
}

impl From<ArtifactState> for Vec<FileRecord> {
    fn from(state: ArtifactState) -> Self {
        match state {
            ArtifactState::Absent => Vec::new(),
            ArtifactState::Present(files) => files,
        }
    }
}

/// Absolute form of `path`, resolving symlinks when it exists.
pub fn absolutize(path: &Path) -> PipelineResult<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(_) => Ok(std::path::absolute(path)?),
    }
}

/// Hash every regular file under `root`, in sorted path order.
///
/// A missing directory is `Absent`, never an error.
pub fn scan_dir(root: &Path) -> PipelineResult<ArtifactState> {
    if !root.is_dir() {
        return Ok(ArtifactState::Absent);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = entry.metadata()?;
        let digest = count_lines_bytes_sha(path)?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        files.push(FileRecord {
            path: absolutize(path)?.display().to_string(),
            rel,
            bytes: metadata.len(),
            sha256: digest.sha256,
            mtime_utc: metadata.modified().map(format_utc).unwrap_or_default(),
        });
    }
    Ok(ArtifactState::Present(files))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFiles {
    pub adapter: ArtifactState,
    pub logs: ArtifactState,
    #[serde(default, skip_serializing_if = "ArtifactState::is_absent")]
    pub fused: ArtifactState,
    #[serde(default, skip_serializing_if = "ArtifactState::is_absent")]
    pub quantized: ArtifactState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub iters: u64,
    pub batch_size: u32,
    pub max_seq_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub model_id: String,
    pub output_root: String,
    pub adapter_dir: String,
    pub logs_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantized_dir: Option<String>,
    pub files: RunFiles,
    pub training_params: TrainingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantize_bits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q_group_size: Option<u32>,
}

impl RunEntry {
    #[must_use]
    pub fn output_root(&self) -> PathBuf {
        PathBuf::from(&self.output_root)
    }

    #[must_use]
    pub fn adapter_path(&self) -> PathBuf {
        PathBuf::from(&self.adapter_dir)
    }

    /// Recorded fused directory, or its default location under the output root.
    #[must_use]
    pub fn fused_path(&self) -> PathBuf {
        self.fused_dir.as_ref().map_or_else(|| fused_dir_under(&self.output_root()), PathBuf::from)
    }

    #[must_use]
    pub fn quantized_path(&self) -> PathBuf {
        self.quantized_dir
            .as_ref()
            .map_or_else(|| quantized_dir_under(&self.output_root()), PathBuf::from)
    }

    /// Mark every empty artifact whose directory is missing as `Absent`.
    pub fn restore_absent_states(&mut self) {
        let dirs = [self.adapter_path(), PathBuf::from(&self.logs_dir), self.fused_path(), self.quantized_path()];
        let states = [
            &mut self.files.adapter,
            &mut self.files.logs,
            &mut self.files.fused,
            &mut self.files.quantized,
        ];
        for (state, dir) in states.into_iter().zip(dirs) {
            if state.is_empty() && !dir.is_dir() {
                *state = ArtifactState::Absent;
            }
        }
    }

    /// Re-hash the fused directory and record its path when present.
    pub fn refresh_fused(&mut self) -> PipelineResult<()> {
        let dir = self.fused_path();
        self.files.fused = scan_dir(&dir)?;
        if !self.files.fused.is_absent() {
            self.fused_dir = Some(absolutize(&dir)?.display().to_string());
        }
        Ok(())
    }

    /// Re-hash the quantized directory; forget bits and group size when it is gone.
    pub fn refresh_quantized(&mut self) -> PipelineResult<()> {
        let dir = self.quantized_path();
        self.files.quantized = scan_dir(&dir)?;
        if self.files.quantized.is_absent() {
            self.quantized_dir = None;
            self.quantize_bits = None;
            self.q_group_size = None;
        } else {
            self.quantized_dir = Some(absolutize(&dir)?.display().to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRegistry {
    pub created_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_utc: Option<String>,
    pub runs: Vec<RunEntry>,
}

impl ArtifactRegistry {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let mut registry: Self = read_json(path)?;
        for run in &mut registry.runs {
            run.restore_absent_states();
        }
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        write_json(path, self)
    }

    #[must_use]
    pub fn find(&self, model_id: &str) -> Option<&RunEntry> {
        self.runs.iter().find(|r| r.model_id == model_id)
    }
}

/// Point `<output_root>/<link>` at the sibling `target` directory.
///
/// Failures are logged and ignored.
pub fn refresh_latest_link(output_root: &Path, link: &str, target: &Path) {
    let Some(name) = target.file_name() else {
        return;
    };
    let link_path = output_root.join(link);
    if link_path.symlink_metadata().is_ok() {
        if let Err(e) = std::fs::remove_file(&link_path) {
            tracing::debug!(path = %link_path.display(), error = %e, "cannot remove old link");
            return;
        }
    }

    #[cfg(unix)]
    if let Err(e) = std::os::unix::fs::symlink(name, &link_path) {
        tracing::debug!(path = %link_path.display(), error = %e, "symlink not created");
    }

    #[cfg(not(unix))]
    tracing::debug!(path = %link_path.display(), target = ?name, "symlinks unsupported; skipped");
}

/// Build a fresh entry for one experiment row, scanning every artifact dir.
pub fn entry_for_row(row: &ExperimentRow, layout: &RunLayout) -> PipelineResult<RunEntry> {
    layout.ensure_run_dirs(&row.model_id)?;
    let out_root = layout.output_root(&row.model_id);
    let adapter_dir = row.adapter_dir();
    let logs_dir = row.logs_dir();

    refresh_latest_link(&out_root, "latest_adapter", &adapter_dir);
    refresh_latest_link(&out_root, "latest_logs", &logs_dir);

    let mut entry = RunEntry {
        model_id: row.model_id.clone(),
        output_root: absolutize(&out_root)?.display().to_string(),
        adapter_dir: absolutize(&adapter_dir)?.display().to_string(),
        logs_dir: absolutize(&logs_dir)?.display().to_string(),
        fused_dir: None,
        quantized_dir: None,
        files: RunFiles { adapter: scan_dir(&adapter_dir)?, logs: scan_dir(&logs_dir)?, ..RunFiles::default() },
        training_params: TrainingParams {
            iters: row.iters,
            batch_size: row.batch_size,
            max_seq_length: row.max_seq_length,
        },
        quantize_bits: None,
        q_group_size: None,
    };
    entry.refresh_fused()?;
    entry.refresh_quantized()?;
    Ok(entry)
}

/// Rebuild `artifacts.json` from `experiments.csv` and the filesystem.
///
/// Quantization parameters are carried over from a prior registry while the
/// quantized directory still exists.
pub fn register_runs(config: &PipelineConfig) -> PipelineResult<ArtifactRegistry> {
    let experiments = config.experiments_path();
    let rows = read_experiments_csv(&experiments)?;
    if rows.is_empty() {
        return Err(PipelineError::Dataset(format!("{} has no rows", experiments.display())));
    }

    let artifacts_path = config.artifacts_path();
    let prior = if artifacts_path.exists() {
        match ArtifactRegistry::load(&artifacts_path) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(path = %artifacts_path.display(), error = %e, "ignoring unreadable registry");
                None
            }
        }
    } else {
        None
    };

    let layout = RunLayout::new(config.paths.run_dir.clone());
    let mut runs = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut entry = entry_for_row(row, &layout)?;
        if let Some(old) = prior.as_ref().and_then(|p| p.find(&row.model_id)) {
            if !entry.files.quantized.is_absent() {
                entry.quantize_bits = old.quantize_bits;
                entry.q_group_size = old.q_group_size;
            }
        }
        tracing::info!(
            model_id = %entry.model_id,
            adapter_files = entry.files.adapter.len(),
            log_files = entry.files.logs.len(),
            "registered run"
        );
        runs.push(entry);
    }

    let registry = ArtifactRegistry { created_utc: utc_now(), updated_utc: None, runs };
    registry.save(&artifacts_path)?;
    tracing::info!(path = %artifacts_path.display(), runs = registry.runs.len(), "wrote artifact registry");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_dir_is_absent() {
        let temp = TempDir::new().unwrap();
        assert_eq!(scan_dir(&temp.path().join("nope")).unwrap(), ArtifactState::Absent);
    }

    #[test]
    fn test_rescan_is_stable_and_picks_up_new_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("adapter");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("adapters.safetensors"), b"weights").unwrap();
        std::fs::write(dir.join("nested/config.json"), b"{}").unwrap();

        let first = scan_dir(&dir).unwrap();
        let second = scan_dir(&dir).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.files()[1].rel, "nested/config.json");

        std::fs::write(dir.join("extra.txt"), b"abc").unwrap();
        let third = scan_dir(&dir).unwrap();
        assert_eq!(third.len(), 3);
        let extra = third.files().iter().find(|f| f.rel == "extra.txt").unwrap();
        assert_eq!(extra.sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(extra.bytes, 3);
        for old in first.files() {
            let again = third.files().iter().find(|f| f.rel == old.rel).unwrap();
            assert_eq!(again.sha256, old.sha256);
            assert_eq!(again.bytes, old.bytes);
        }
    }

    #[test]
    fn test_absent_states_serialize() {
        let files = RunFiles::default();
        let value = serde_json::to_value(&files).unwrap();
        assert_eq!(value["adapter"], serde_json::json!([]));
        assert!(value.get("fused").is_none());
        assert!(value.get("quantized").is_none());
    }

    #[test]
    fn test_load_restores_absent_states() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("org--m");
        std::fs::create_dir_all(out.join("adapter")).unwrap();
        let mut entry = RunEntry {
            model_id: "org/m".to_string(),
            output_root: out.display().to_string(),
            adapter_dir: out.join("adapter").display().to_string(),
            logs_dir: out.join("logs").display().to_string(),
            fused_dir: None,
            quantized_dir: None,
            files: RunFiles::default(),
            training_params: TrainingParams::default(),
            quantize_bits: None,
            q_group_size: None,
        };
        entry.files.adapter = scan_dir(&out.join("adapter")).unwrap();
        entry.files.logs = scan_dir(&out.join("logs")).unwrap();
        assert_eq!(entry.files.adapter, ArtifactState::Present(Vec::new()));
        assert!(entry.files.logs.is_absent());

        let registry = ArtifactRegistry { created_utc: "t".to_string(), updated_utc: None, runs: vec![entry] };
        let path = temp.path().join("artifacts.json");
        registry.save(&path).unwrap();

        let loaded = ArtifactRegistry::load(&path).unwrap();
        assert_eq!(loaded, registry);
        assert!(loaded.runs[0].files.logs.is_absent());
        assert!(!loaded.runs[0].files.adapter.is_absent());
        assert!(loaded.runs[0].files.fused.is_absent());
    }

    #[test]
    fn test_entry_for_row_scans_and_links() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path().join("runs"));
        let adapter = layout.adapter_dir("org/m");
        std::fs::create_dir_all(&adapter).unwrap();
        std::fs::write(adapter.join("a.bin"), b"x").unwrap();

        let row = ExperimentRow {
            model_id: "org/m".to_string(),
            data_dir: "d".to_string(),
            train_file: String::new(),
            valid_file: String::new(),
            train_examples: 1,
            valid_examples: 1,
            epochs: 1,
            iters: 9,
            batch_size: 2,
            grad_accum: 1,
            max_seq_length: 64,
            learning_rate: 1e-4,
            bf16: 0,
            adapter_path: adapter.display().to_string(),
            log_dir: layout.logs_dir("org/m").display().to_string(),
            est_tokens: 0,
        };
        let entry = entry_for_row(&row, &layout).unwrap();

        assert_eq!(entry.files.adapter.len(), 1);
        assert!(entry.files.logs.is_absent());
        assert!(entry.fused_dir.is_none());
        assert_eq!(entry.training_params.iters, 9);

        #[cfg(unix)]
        {
            let link = layout.output_root("org/m").join("latest_adapter");
            assert_eq!(std::fs::read_link(link).unwrap(), PathBuf::from("adapter"));
        }

        // A second pass replaces the existing links without failing.
        assert!(entry_for_row(&row, &layout).is_ok());
    }
}
