//! Layered pipeline configuration.
//!
//! Configuration precedence (lowest to highest):
//! 1. Base YAML file (`config/default.yaml`)
//! 2. Local YAML override (`config/local.yaml`, optional)
//! 3. Environment variables (`TUNELINE_section__key=value`)
//! 4. Explicit overrides (`--set section.key=value`)
//!
//! Values coming from the environment or from `--set` are decoded as JSON and
//! fall back to the literal string when they are not valid JSON. The merged
//! tree is validated once into [`PipelineConfig`].

use crate::error::{PipelineError, PipelineResult};
use crate::matrix::HyperParams;
use crate::probe::{ArtifactSelection, FewShotTemplate, PromptVariant};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const DEFAULT_ENV_PREFIX: &str = "TUNELINE_";
pub const DEFAULT_BASE_PATH: &str = "config/default.yaml";
pub const DEFAULT_LOCAL_PATH: &str = "config/local.yaml";

/// Builder for the layered configuration.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base: PathBuf,
    local: Option<PathBuf>,
    env_prefix: String,
    env_vars: Option<Vec<(String, String)>>,
    overrides: Vec<String>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            local: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            env_vars: None,
            overrides: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_local(mut self, local: impl Into<PathBuf>) -> Self {
        self.local = Some(local.into());
        self
    }

    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Use a fixed set of environment variables instead of the process environment.
    #[must_use]
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Add `key.path=value` overrides, applied last.
    #[must_use]
    pub fn with_overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.extend(overrides.into_iter().map(Into::into));
        self
    }

    /// Merge every layer into a single tree without validating its shape.
    pub fn load_layered(&self) -> PipelineResult<LayeredConfig> {
        PipelineError::require(&self.base)?;
        let mut root = load_yaml(&self.base)?;

        if let Some(local) = &self.local {
            if local.exists() {
                deep_merge(&mut root, load_yaml(local)?);
            } else {
                tracing::debug!(path = %local.display(), "no local config override");
            }
        }

        let env = match &self.env_vars {
            Some(vars) => env_overrides(&self.env_prefix, vars.iter().cloned()),
            None => env_overrides(
                &self.env_prefix,
                std::env::vars_os()
                    .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
            ),
        };
        deep_merge(&mut root, env);

        let mut explicit = Value::Object(Map::new());
        for pair in &self.overrides {
            let (path, value) = parse_set_override(pair)?;
            set_nested(&mut explicit, &path, value);
        }
        deep_merge(&mut root, explicit);

        Ok(LayeredConfig { root })
    }

    /// Merge every layer and validate the result into the typed schema.
    pub fn load(&self) -> PipelineResult<PipelineConfig> {
        self.load_layered()?.into_typed()
    }
}

/// The merged configuration tree, before typing.
#[derive(Debug, Clone, PartialEq)]
pub struct LayeredConfig {
    root: Value,
}

impl LayeredConfig {
    #[must_use]
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Look up a dotted path such as `matrix.epochs` or `probe.prompts.0`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(&self.root);
        }
        path.split('.').try_fold(&self.root, |node, part| match node {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn into_typed(self) -> PipelineResult<PipelineConfig> {
        let config: PipelineConfig = serde_json::from_value(self.root)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn load_yaml(path: &Path) -> PipelineResult<Value> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(value),
        _ => Err(PipelineError::Config(format!(
            "{}: top level must be a mapping",
            path.display()
        ))),
    }
}

/// Merge `src` into `dst`: mappings merge key by key, anything else overwrites.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                let nested = value.is_object() && dst_map.get(&key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = dst_map.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    dst_map.insert(key, value);
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Decode a raw override value as JSON, keeping the literal string otherwise.
#[must_use]
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parse one `a.b.c=value` override into its path and decoded value.
pub fn parse_set_override(pair: &str) -> PipelineResult<(Vec<String>, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        return Err(PipelineError::Config(format!("--set must be key=VALUE, got: {pair}")));
    };
    let path: Vec<String> = key.split('.').map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(PipelineError::Config(format!("--set key has an empty segment: {key}")));
    }
    Ok((path, parse_value(raw)))
}

/// Collect `PREFIX_section__key=value` variables into a nested tree.
pub fn env_overrides<I>(prefix: &str, vars: I) -> Value
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out = Value::Object(Map::new());
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let path: Vec<String> = rest.split("__").map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            tracing::debug!(var = %key, "ignoring malformed config variable");
            continue;
        }
        set_nested(&mut out, &path, parse_value(&raw));
    }
    out
}

fn set_nested(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = root;
    for part in parents {
        node = ensure_object(node)
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.clone(), value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// Root configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub files: FileNames,
    #[serde(default)]
    pub contract: ContractConfig,
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Output directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory holding the JSONL splits plus contract, catalog and report.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding per-model run outputs, experiments.csv and artifacts.json.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Directory holding generations and their analysis.
    #[serde(default = "default_eval_dir")]
    pub eval_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_eval_dir() -> PathBuf {
    PathBuf::from("eval_out")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir(), run_dir: default_run_dir(), eval_dir: default_eval_dir() }
    }
}

/// File names of every persisted artifact, relative to their directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileNames {
    pub train: String,
    pub valid: String,
    pub contract: String,
    pub catalog: String,
    pub report: String,
    pub experiments: String,
    pub artifacts: String,
    pub generations: String,
    pub summary: String,
    pub analysis: String,
    pub generation_policy: String,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            train: "train.jsonl".to_string(),
            valid: "valid.jsonl".to_string(),
            contract: "data_contract.json".to_string(),
            catalog: "data_catalog.json".to_string(),
            report: "data_report.json".to_string(),
            experiments: "experiments.csv".to_string(),
            artifacts: "artifacts.json".to_string(),
            generations: "generations.jsonl".to_string(),
            summary: "summary.csv".to_string(),
            analysis: "analysis.json".to_string(),
            generation_policy: "generation_policy.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractConfig {
    /// Overwrite an existing contract/catalog instead of reusing it.
    #[serde(default)]
    pub force: bool,
}

/// Candidate models and the hyperparameters they share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    pub models: Vec<String>,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_grad_accum")]
    pub grad_accum: u32,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_true")]
    pub bf16: bool,
    /// Lower bound applied to the estimated iteration count. Required.
    pub iters_floor: u64,
    /// Replaces the estimate entirely when non-zero.
    #[serde(default)]
    pub iters_override: u64,
}

fn default_epochs() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    1
}

fn default_grad_accum() -> u32 {
    8
}

fn default_max_seq_length() -> u32 {
    512
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_true() -> bool {
    true
}

impl MatrixConfig {
    #[must_use]
    pub fn hyperparams(&self) -> HyperParams {
        HyperParams {
            epochs: self.epochs,
            batch_size: self.batch_size,
            grad_accum: self.grad_accum,
            max_seq_length: self.max_seq_length,
            learning_rate: self.learning_rate,
            bf16: self.bf16,
            iters_floor: self.iters_floor,
            iters_override: self.iters_override,
        }
    }
}

/// External fuse/quantize tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConvertConfig {
    pub python: String,
    pub fuse_module: String,
    pub convert_module: String,
    pub do_fuse: bool,
    pub q_bits: u32,
    pub q_group_size: u32,
    pub dtype: String,
    pub dry_run: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            fuse_module: "mlx_lm.fuse".to_string(),
            convert_module: "mlx_lm.convert".to_string(),
            do_fuse: true,
            q_bits: 4,
            q_group_size: 64,
            dtype: "bfloat16".to_string(),
            dry_run: false,
        }
    }
}

/// Generation probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProbeConfig {
    pub python: String,
    pub generate_module: String,
    pub prompts: Vec<String>,
    pub artifacts: ArtifactSelection,
    pub variants: Vec<PromptVariant>,
    pub max_new_tokens: u32,
    pub min_words: usize,
    pub retries: u32,
    pub n_shots: usize,
    pub seed: u64,
    pub stop: Option<String>,
    pub trim_at_stop: bool,
    pub directive_suffix: String,
    pub fewshot: FewShotTemplate,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            generate_module: "mlx_lm.generate".to_string(),
            prompts: Vec::new(),
            artifacts: ArtifactSelection::Preferred,
            variants: vec![PromptVariant::FewShot],
            max_new_tokens: 64,
            min_words: 3,
            retries: 2,
            n_shots: 3,
            seed: 42,
            stop: Some("\n\n".to_string()),
            trim_at_stop: true,
            directive_suffix: "\n\nAnswer with a single important thought:".to_string(),
            fewshot: FewShotTemplate::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.matrix.models.iter().all(|m| m.trim().is_empty()) {
            return Err(PipelineError::Config("matrix.models must list at least one model".to_string()));
        }
        self.matrix.hyperparams().validate()?;
        if !matches!(self.convert.q_bits, 2 | 3 | 4 | 6 | 8) {
            return Err(PipelineError::Config(format!(
                "convert.q_bits must be one of 2, 3, 4, 6, 8 (got {})",
                self.convert.q_bits
            )));
        }
        if self.convert.q_group_size == 0 {
            return Err(PipelineError::Config("convert.q_group_size must be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn train_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.files.train)
    }

    #[must_use]
    pub fn valid_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.files.valid)
    }

    #[must_use]
    pub fn contract_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.files.contract)
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.files.catalog)
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.files.report)
    }

    #[must_use]
    pub fn experiments_path(&self) -> PathBuf {
        self.paths.run_dir.join(&self.files.experiments)
    }

    #[must_use]
    pub fn artifacts_path(&self) -> PathBuf {
        self.paths.run_dir.join(&self.files.artifacts)
    }

    #[must_use]
    pub fn generations_path(&self) -> PathBuf {
        self.paths.eval_dir.join(&self.files.generations)
    }

    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.paths.eval_dir.join(&self.files.summary)
    }

    #[must_use]
    pub fn analysis_path(&self) -> PathBuf {
        self.paths.eval_dir.join(&self.files.analysis)
    }

    #[must_use]
    pub fn generation_policy_path(&self) -> PathBuf {
        self.paths.eval_dir.join(&self.files.generation_policy)
    }
}
