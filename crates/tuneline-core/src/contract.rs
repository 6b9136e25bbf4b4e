//! Data contract and catalog for a pair of JSONL splits.
//!
//! The contract pins which files were used and which field holds the text.
//! The catalog pins their size, newline count and SHA-256. Both are written
//! once and reused on later runs unless `force` is set.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::hashing::{FileDigest, count_lines_bytes_sha};
use crate::persist::{WriteOutcome, read_json, utc_now, write_json_unless_exists};
use crate::schema::{Schema, sniff_schema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenFile {
    pub chosen: String,
    pub resolved: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub created_utc: String,
    pub data_dir: String,
    pub filenames: BTreeMap<String, ChosenFile>,
    pub schema: Schema,
}

impl Contract {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        read_json(path)
    }

    #[must_use]
    pub fn text_field(&self) -> &str {
        self.schema.text_field()
    }

    /// Resolved path of a split, accepting `val` for `valid`.
    #[must_use]
    pub fn split_path(&self, split: &str) -> Option<PathBuf> {
        let entry = match split {
            "valid" | "val" | "validation" => self.filenames.get("valid").or_else(|| self.filenames.get("val")),
            other => self.filenames.get(other),
        }?;
        (!entry.resolved.is_empty()).then(|| PathBuf::from(&entry.resolved))
    }

    /// Every split with a resolved path, in name order.
    pub fn splits(&self) -> impl Iterator<Item = (&str, PathBuf)> {
        self.filenames
            .iter()
            .filter(|(_, f)| !f.resolved.is_empty())
            .map(|(name, f)| (name.as_str(), PathBuf::from(&f.resolved)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub path: String,
    #[serde(rename = "lines")]
    pub newline_count: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Legacy `entries` view. `num_valid_examples` is the newline count, kept
/// under that name for older consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyStats {
    pub num_valid_examples: u64,
    pub num_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEntry {
    pub path: String,
    pub stats: LegacyStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub created_utc: String,
    pub files: BTreeMap<String, CatalogFile>,
    pub entries: BTreeMap<String, LegacyEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        read_json(path)
    }

    /// Newline count of a split, read from the legacy view like older consumers do.
    #[must_use]
    pub fn newline_count(&self, split: &str) -> Option<u64> {
        let entry = match split {
            "valid" | "val" => self.entries.get("valid").or_else(|| self.entries.get("val")),
            other => self.entries.get(other),
        }?;
        Some(entry.stats.num_valid_examples)
    }

    /// Recorded digest of a split, accepting `val` for `valid`.
    #[must_use]
    pub fn digest(&self, split: &str) -> Option<FileDigest> {
        let file = match split {
            "valid" | "val" => self.files.get("valid").or_else(|| self.files.get("val")),
            other => self.files.get(other),
        }?;
        Some(FileDigest { newline_count: file.newline_count, bytes: file.bytes, sha256: file.sha256.clone() })
    }

    fn insert(&mut self, split: &str, path: &str, digest: &FileDigest) {
        self.files.insert(
            split.to_string(),
            CatalogFile {
                path: path.to_string(),
                newline_count: digest.newline_count,
                bytes: digest.bytes,
                sha256: digest.sha256.clone(),
            },
        );
        self.entries.insert(
            split.to_string(),
            LegacyEntry {
                path: path.to_string(),
                stats: LegacyStats {
                    num_valid_examples: digest.newline_count,
                    num_bytes: digest.bytes,
                    sha256: digest.sha256.clone(),
                },
            },
        );
    }
}

/// Everything produced by one contract/catalog run.
#[derive(Debug, Clone)]
pub struct ContractOutcome {
    pub contract_path: PathBuf,
    pub catalog_path: PathBuf,
    pub contract: Contract,
    pub catalog: Catalog,
    pub contract_write: WriteOutcome,
    pub catalog_write: WriteOutcome,
    pub train: FileDigest,
    pub valid: FileDigest,
}

fn resolve(path: &Path) -> PipelineResult<PathBuf> {
    PipelineError::require(path)?;
    Ok(std::fs::canonicalize(path)?)
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Build the contract and catalog for `train`/`valid` without writing them.
///
/// The schema is sniffed from the train split only; valid is assumed to match.
pub fn build_contract_and_catalog(
    data_dir: &Path,
    train: &Path,
    valid: &Path,
    created_utc: &str,
) -> PipelineResult<(Contract, Catalog, FileDigest, FileDigest)> {
    let train = resolve(train)?;
    let valid = resolve(valid)?;
    let data_dir = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());

    let schema = sniff_schema(&train);

    let mut filenames = BTreeMap::new();
    for (split, path) in [("train", &train), ("valid", &valid)] {
        filenames.insert(
            split.to_string(),
            ChosenFile { chosen: file_name(path), resolved: path.display().to_string() },
        );
    }
    let contract = Contract {
        created_utc: created_utc.to_string(),
        data_dir: data_dir.display().to_string(),
        filenames,
        schema,
    };

    let train_digest = count_lines_bytes_sha(&train)?;
    let valid_digest = count_lines_bytes_sha(&valid)?;
    let mut catalog = Catalog { created_utc: created_utc.to_string(), files: BTreeMap::new(), entries: BTreeMap::new() };
    catalog.insert("train", &train.display().to_string(), &train_digest);
    catalog.insert("valid", &valid.display().to_string(), &valid_digest);

    Ok((contract, catalog, train_digest, valid_digest))
}

/// Build and persist `data_contract.json` and `data_catalog.json`.
///
/// Existing outputs are left untouched unless `config.contract.force` is set;
/// a skipped write is not an error.
pub fn finalize_data_dir(config: &PipelineConfig) -> PipelineResult<ContractOutcome> {
    let (contract, catalog, train, valid) = build_contract_and_catalog(
        &config.paths.data_dir,
        &config.train_path(),
        &config.valid_path(),
        &utc_now(),
    )?;

    let contract_path = config.contract_path();
    let catalog_path = config.catalog_path();
    let force = config.contract.force;
    let contract_write = write_json_unless_exists(&contract_path, &contract, force)?;
    let catalog_write = write_json_unless_exists(&catalog_path, &catalog, force)?;

    // Report what is on disk, not what would have been written.
    let contract = match contract_write {
        WriteOutcome::Written => contract,
        WriteOutcome::Skipped => Contract::load(&contract_path)?,
    };
    let (catalog, train, valid) = match catalog_write {
        WriteOutcome::Written => (catalog, train, valid),
        WriteOutcome::Skipped => {
            let kept = Catalog::load(&catalog_path)?;
            let train = kept.digest("train").unwrap_or(train);
            let valid = kept.digest("valid").unwrap_or(valid);
            (kept, train, valid)
        }
    };

    tracing::info!(
        text_field = %contract.text_field(),
        train_lines = train.newline_count,
        valid_lines = valid.newline_count,
        "data contract ready"
    );

    Ok(ContractOutcome { contract_path, catalog_path, contract, catalog, contract_write, catalog_write, train, valid })
}
