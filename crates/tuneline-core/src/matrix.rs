//! Experiment matrix: one training plan row per candidate base model.

use crate::config::PipelineConfig;
use crate::contract::{Catalog, Contract};
use crate::error::{PipelineError, PipelineResult};
use crate::layout::RunLayout;
use crate::validate::ValidationReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::layout::model_tag;

/// Hyperparameters shared by every row of the matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub epochs: u32,
    pub batch_size: u32,
    pub grad_accum: u32,
    pub max_seq_length: u32,
    pub learning_rate: f64,
    pub bf16: bool,
    pub iters_floor: u64,
    pub iters_override: u64,
}

impl HyperParams {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.epochs == 0 {
            return Err(PipelineError::Config("matrix.epochs must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(PipelineError::Config("matrix.learning_rate must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("matrix.batch_size must be >= 1".to_string()));
        }
        if self.grad_accum == 0 {
            return Err(PipelineError::Config("matrix.grad_accum must be >= 1".to_string()));
        }
        if self.max_seq_length == 0 {
            return Err(PipelineError::Config("matrix.max_seq_length must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Iteration count for `train_count` training records.
    ///
    /// `ceil(epochs * max(1, n) / max(1, batch * accum))`, raised to the floor.
    /// A non-zero `iters_override` replaces the estimate entirely.
    #[must_use]
    pub fn iterations(&self, train_count: u64) -> u64 {
        if self.iters_override > 0 {
            return self.iters_override;
        }
        estimate_iterations(train_count, self.epochs, self.batch_size, self.grad_accum).max(self.iters_floor)
    }

    /// Capacity estimate, not a count of real tokens.
    #[must_use]
    pub fn estimated_tokens(&self, iters: u64) -> u64 {
        u64::from(self.max_seq_length)
            .saturating_mul(u64::from(self.batch_size))
            .saturating_mul(u64::from(self.grad_accum))
            .saturating_mul(iters)
    }
}

/// Unclamped iteration estimate; never below 1.
#[must_use]
pub fn estimate_iterations(train_count: u64, epochs: u32, batch_size: u32, grad_accum: u32) -> u64 {
    let numerator = u64::from(epochs).saturating_mul(train_count.max(1));
    let denominator = (u64::from(batch_size) * u64::from(grad_accum)).max(1);
    numerator.div_ceil(denominator).max(1)
}

/// Where the training counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    /// Newline counts from the catalog.
    CatalogNewlines,
    /// Decoded-record counts from the validation report.
    ReportRecords,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainCounts {
    pub train: u64,
    pub valid: u64,
    pub source: CountSource,
}

impl TrainCounts {
    #[must_use]
    pub fn from_catalog(catalog: &Catalog) -> Option<Self> {
        let train = catalog.newline_count("train")?;
        let valid = catalog.newline_count("valid").unwrap_or(0);
        Some(Self { train, valid, source: CountSource::CatalogNewlines })
    }

    #[must_use]
    pub fn from_report(report: &ValidationReport) -> Option<Self> {
        let train = report.valid_examples("train")?;
        let valid = report.valid_examples("valid").unwrap_or(0);
        Some(Self { train, valid, source: CountSource::ReportRecords })
    }

    /// Catalog first, validation report second.
    pub fn resolve(catalog_path: &Path, report_path: &Path) -> PipelineResult<Self> {
        if catalog_path.exists() {
            if let Some(counts) = Self::from_catalog(&Catalog::load(catalog_path)?) {
                return Ok(counts);
            }
            tracing::warn!(path = %catalog_path.display(), "catalog has no train entry; trying report");
        }
        let report = ValidationReport::load(report_path)?;
        Self::from_report(&report).ok_or_else(|| {
            PipelineError::Dataset(format!("{} has no train split", report_path.display()))
        })
    }
}

/// One row of `experiments.csv`. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRow {
    pub model_id: String,
    pub data_dir: String,
    pub train_file: String,
    pub valid_file: String,
    pub train_examples: u64,
    pub valid_examples: u64,
    pub epochs: u32,
    pub iters: u64,
    pub batch_size: u32,
    pub grad_accum: u32,
    pub max_seq_length: u32,
    pub learning_rate: f64,
    /// 0 or 1.
    pub bf16: u8,
    pub adapter_path: String,
    pub log_dir: String,
    pub est_tokens: u64,
}

impl ExperimentRow {
    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        PathBuf::from(&self.adapter_path)
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

fn split_file(contract: &Contract, split: &str) -> String {
    contract.split_path(split).map(|p| p.display().to_string()).unwrap_or_default()
}

/// Build one row per model. Models with a blank id are skipped.
#[must_use]
pub fn build_matrix(
    contract: &Contract,
    counts: &TrainCounts,
    models: &[String],
    params: &HyperParams,
    layout: &RunLayout,
) -> Vec<ExperimentRow> {
    let train_file = split_file(contract, "train");
    let valid_file = split_file(contract, "valid");
    let iters = params.iterations(counts.train);

    models
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(|model_id| ExperimentRow {
            model_id: model_id.to_string(),
            data_dir: contract.data_dir.clone(),
            train_file: train_file.clone(),
            valid_file: valid_file.clone(),
            train_examples: counts.train,
            valid_examples: counts.valid,
            epochs: params.epochs,
            iters,
            batch_size: params.batch_size,
            grad_accum: params.grad_accum,
            max_seq_length: params.max_seq_length,
            learning_rate: params.learning_rate,
            bf16: u8::from(params.bf16),
            adapter_path: layout.adapter_dir(model_id).display().to_string(),
            log_dir: layout.logs_dir(model_id).display().to_string(),
            est_tokens: params.estimated_tokens(iters),
        })
        .collect()
}

pub fn write_experiments_csv(path: &Path, rows: &[ExperimentRow]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_experiments_csv(path: &Path) -> PipelineResult<Vec<ExperimentRow>> {
    PipelineError::require(path)?;
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<ExperimentRow>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct MatrixOutcome {
    pub path: PathBuf,
    pub counts: TrainCounts,
    pub rows: Vec<ExperimentRow>,
}

/// Resolve counts, build the matrix and write `experiments.csv`.
pub fn run_matrix(config: &PipelineConfig) -> PipelineResult<MatrixOutcome> {
    let contract = Contract::load(&config.contract_path())?;
    let counts = TrainCounts::resolve(&config.catalog_path(), &config.report_path())?;
    let layout = RunLayout::new(config.paths.run_dir.clone());
    let rows = build_matrix(&contract, &counts, &config.matrix.models, &config.matrix.hyperparams(), &layout);

    let path = config.experiments_path();
    write_experiments_csv(&path, &rows)?;
    tracing::info!(
        path = %path.display(),
        rows = rows.len(),
        train = counts.train,
        valid = counts.valid,
        source = ?counts.source,
        "wrote experiment matrix"
    );
    Ok(MatrixOutcome { path, counts, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn params(floor: u64) -> HyperParams {
        HyperParams {
            epochs: 1,
            batch_size: 1,
            grad_accum: 8,
            max_seq_length: 512,
            learning_rate: 2e-4,
            bf16: true,
            iters_floor: floor,
            iters_override: 0,
        }
    }

    fn contract() -> Contract {
        let mut filenames = BTreeMap::new();
        for split in ["train", "valid"] {
            filenames.insert(
                split.to_string(),
                crate::contract::ChosenFile {
                    chosen: format!("{split}.jsonl"),
                    resolved: format!("/data/{split}.jsonl"),
                },
            );
        }
        Contract {
            created_utc: "t".to_string(),
            data_dir: "/data".to_string(),
            filenames,
            schema: Schema::jsonl_text("text"),
        }
    }

    #[test]
    fn test_iterations_ceil_then_floor() {
        assert_eq!(estimate_iterations(1000, 1, 1, 8), 125);
        assert_eq!(params(100).iterations(1000), 125);
        assert_eq!(params(10_000).iterations(1000), 10_000);
        assert_eq!(estimate_iterations(1001, 1, 1, 8), 126);
    }

    #[test]
    fn test_iterations_zero_inputs() {
        assert_eq!(estimate_iterations(0, 1, 0, 0), 1);
        let mut p = params(0);
        p.iters_override = 7;
        assert_eq!(p.iterations(1000), 7);
    }

    #[test]
    fn test_validate_rejects_zero_epochs() {
        let mut p = params(1);
        p.epochs = 0;
        assert!(p.validate().is_err());
        assert!(params(1).validate().is_ok());
    }

    #[test]
    fn test_build_matrix_rows() {
        let counts = TrainCounts { train: 1000, valid: 10, source: CountSource::CatalogNewlines };
        let models = vec!["org/a".to_string(), "  ".to_string(), "b".to_string()];
        let layout = RunLayout::new(PathBuf::from("runs"));
        let rows = build_matrix(&contract(), &counts, &models, &params(100), &layout);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].iters, 125);
        assert_eq!(rows[0].est_tokens, 512 * 8 * 125);
        assert_eq!(rows[0].adapter_path, "runs/org--a/adapter");
        assert_eq!(rows[0].log_dir, "runs/org--a/logs");
        assert_eq!(rows[0].valid_file, "/data/valid.jsonl");
        assert_eq!(rows[1].bf16, 1);
    }

    #[test]
    fn test_csv_header_and_reread() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runs/experiments.csv");
        let counts = TrainCounts { train: 20, valid: 2, source: CountSource::ReportRecords };
        let layout = RunLayout::new(temp.path().join("runs"));
        let rows = build_matrix(&contract(), &counts, &["org/a".to_string()], &params(5), &layout);

        write_experiments_csv(&path, &rows).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "model_id,data_dir,train_file,valid_file,train_examples,valid_examples,epochs,iters,\
             batch_size,grad_accum,max_seq_length,learning_rate,bf16,adapter_path,log_dir,est_tokens\n"
        ));
        assert_eq!(read_experiments_csv(&path).unwrap(), rows);
    }

    #[test]
    fn test_counts_fall_back_to_report() {
        let temp = TempDir::new().unwrap();
        let report_path = temp.path().join("data_report.json");
        std::fs::write(
            &report_path,
            r#"{"created_utc":"t","data_dir":"d","text_field":"text","splits":{"train":{
                "path":"p","lines":5,"valid_examples":4,
                "errors":{"bad_json":1,"missing_field":0,"non_string_field":0},
                "empties":{"empty_exact":0,"whitespace_only":0,"leading_whitespace":0,"trailing_whitespace":0},
                "control_char_lines":0,
                "duplicates":{"duplicate_example_count":0,"sha256_examples":[]},
                "length_chars":{"count":4,"min":1,"max":3,"mean":2.0,"median":2.0,
                  "percentiles":{"p5":1,"p25":1,"p50":2,"p75":3,"p95":3}},
                "eos_markers_hits":{"</s>":0},
                "samples":{"good_first3":[],"bad_first3":[]}}}}"#,
        )
        .unwrap();

        let counts = TrainCounts::resolve(&temp.path().join("absent.json"), &report_path).unwrap();
        assert_eq!(counts.train, 4);
        assert_eq!(counts.valid, 0);
        assert_eq!(counts.source, CountSource::ReportRecords);
    }

    #[test]
    fn test_counts_missing_everywhere() {
        let temp = TempDir::new().unwrap();
        let err = TrainCounts::resolve(&temp.path().join("a.json"), &temp.path().join("b.json")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
