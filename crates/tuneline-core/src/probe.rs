//! Generation and ablation probe.
//!
//! For every registered run, pick artifacts (quantized, fused, base+adapter),
//! render each prompt under each prompt variant, and sample a continuation.
//! Continuations that are too short or copied from the training corpus are
//! retried a bounded number of times; the last attempt is always kept.

use crate::config::{PipelineConfig, ProbeConfig};
use crate::contract::Contract;
use crate::corpus::{MemorizationIndex, ShotPool, dedup_texts, read_texts, word_count};
use crate::error::{PipelineError, PipelineResult};
use crate::persist::utc_now;
use crate::registry::{ArtifactRegistry, RunEntry};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Which artifacts of a run are probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSelection {
    /// Only the first available artifact in preference order.
    #[default]
    Preferred,
    /// Every available artifact.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVariant {
    Plain,
    Directive,
    FewShot,
}

impl PromptVariant {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Directive => "directive",
            Self::FewShot => "fewshot",
        }
    }
}

/// `prefix + shots.join(joiner) + suffix`, with `{prompt}` substituted in the suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FewShotTemplate {
    pub prefix: String,
    pub joiner: String,
    pub suffix: String,
    /// Used when the training corpus yields no texts.
    pub shots: Vec<String>,
}

impl Default for FewShotTemplate {
    fn default() -> Self {
        Self {
            prefix: "Some proverbs:\n- ".to_string(),
            joiner: "\n- ".to_string(),
            suffix: "\n\n{prompt}\n- ".to_string(),
            shots: vec![
                "The moon does not race the tide.".to_string(),
                "A river carves stone by lingering.".to_string(),
            ],
        }
    }
}

impl FewShotTemplate {
    #[must_use]
    pub fn render(&self, prompt: &str, shots: &[String]) -> String {
        format!("{}{}{}", self.prefix, shots.join(&self.joiner), self.suffix.replace("{prompt}", prompt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "quantized")]
    Quantized,
    #[serde(rename = "fused")]
    Fused,
    #[serde(rename = "base+adapter")]
    BaseAdapter,
}

impl ArtifactKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Quantized => "quantized",
            Self::Fused => "fused",
            Self::BaseAdapter => "base+adapter",
        }
    }
}

/// A loadable model: a path or hub id, plus an optional adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChoice {
    pub kind: ArtifactKind,
    pub model_path: String,
    pub adapter_path: Option<String>,
}

/// Artifacts of `run` in preference order: quantized, fused, base+adapter.
///
/// Recorded directories that no longer exist are skipped. Base+adapter is
/// always last. Duplicate (model, adapter) pairs are dropped.
#[must_use]
pub fn select_artifacts(run: &RunEntry) -> Vec<ArtifactChoice> {
    let mut out = Vec::new();
    let recorded = [(ArtifactKind::Quantized, &run.quantized_dir), (ArtifactKind::Fused, &run.fused_dir)];
    for (kind, dir) in recorded {
        if let Some(dir) = dir.as_deref().filter(|d| Path::new(d).is_dir()) {
            out.push(ArtifactChoice { kind, model_path: dir.to_string(), adapter_path: None });
        }
    }
    out.push(ArtifactChoice {
        kind: ArtifactKind::BaseAdapter,
        model_path: run.model_id.clone(),
        adapter_path: Some(run.adapter_dir.clone()),
    });

    let mut seen = HashSet::new();
    out.retain(|c| seen.insert((c.model_path.clone(), c.adapter_path.clone().unwrap_or_default())));
    out
}

/// Synchronous text generation against one artifact.
pub trait Generator {
    /// Returns the continuation only, with any echoed prompt removed.
    fn generate(&mut self, artifact: &ArtifactChoice, prompt: &str, max_tokens: u32) -> PipelineResult<String>;
}

/// Runs `<python> -m <module>` once per call and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub python: String,
    pub module: String,
}

impl CommandGenerator {
    #[must_use]
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self { python: config.python.clone(), module: config.generate_module.clone() }
    }
}

const OUTPUT_FENCE: &str = "==========";

/// Pull the generated text out of generate-tool stdout.
///
/// Text between the first two `==========` fences wins; otherwise the whole
/// output is used. A leading echo of `prompt` is removed.
#[must_use]
pub fn extract_generation(stdout: &str, prompt: &str) -> String {
    let mut parts = stdout.split(OUTPUT_FENCE);
    let body = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(inner), Some(_)) => inner,
        _ => stdout,
    };
    let body = body.strip_prefix('\n').unwrap_or(body);
    let body = body.strip_suffix('\n').unwrap_or(body);
    body.strip_prefix(prompt).unwrap_or(body).to_string()
}

impl Generator for CommandGenerator {
    fn generate(&mut self, artifact: &ArtifactChoice, prompt: &str, max_tokens: u32) -> PipelineResult<String> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-m").arg(&self.module).arg("--model").arg(&artifact.model_path);
        if let Some(adapter) = &artifact.adapter_path {
            cmd.arg("--adapter-path").arg(adapter);
        }
        cmd.arg("--prompt").arg(prompt).arg("--max-tokens").arg(max_tokens.to_string());

        let output = cmd
            .output()
            .map_err(|source| PipelineError::Command { program: self.python.clone(), source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Other(anyhow::anyhow!(
                "{} -m {} exited with {}: {}",
                self.python,
                self.module,
                output.status,
                stderr.trim()
            )));
        }
        Ok(extract_generation(&String::from_utf8_lossy(&output.stdout), prompt))
    }
}

/// Text up to the first occurrence of `stop`, or all of it.
#[must_use]
pub fn trim_at_stop<'a>(text: &'a str, stop: &str) -> &'a str {
    if stop.is_empty() {
        return text;
    }
    text.find(stop).map_or(text, |i| &text[..i])
}

#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    pub max_new_tokens: u32,
    pub min_words: usize,
    pub retries: u32,
    pub stop: Option<String>,
    pub trim_at_stop: bool,
}

impl From<&ProbeConfig> for GenerationPolicy {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            min_words: config.min_words,
            retries: config.retries,
            stop: config.stop.clone(),
            trim_at_stop: config.trim_at_stop,
        }
    }
}

impl GenerationPolicy {
    /// Too short, or copied from the corpus.
    #[must_use]
    pub fn is_bad(&self, generation: &str, index: &MemorizationIndex) -> bool {
        word_count(generation) < self.min_words || index.is_memorized(generation)
    }

    fn clean(&self, raw: &str) -> String {
        let text = raw.trim();
        match (&self.stop, self.trim_at_stop) {
            (Some(stop), true) => trim_at_stop(text, stop).trim().to_string(),
            _ => text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationAttempt {
    pub input_text: String,
    pub generation: String,
    pub shots: Vec<String>,
    pub attempts: u32,
    /// The retry budget ran out and the last (bad) attempt was kept.
    pub accepted_despite_bad: bool,
}

/// Generate until the result passes [`GenerationPolicy::is_bad`] or the retry
/// budget is spent. `next_prompt` is called once per attempt so few-shot
/// prompts can draw fresh shots.
pub fn generate_with_retries<G, F>(
    generator: &mut G,
    artifact: &ArtifactChoice,
    policy: &GenerationPolicy,
    index: &MemorizationIndex,
    mut next_prompt: F,
) -> PipelineResult<GenerationAttempt>
where
    G: Generator + ?Sized,
    F: FnMut() -> (String, Vec<String>),
{
    let mut attempts = 0u32;
    loop {
        let (input_text, shots) = next_prompt();
        let raw = generator.generate(artifact, &input_text, policy.max_new_tokens)?;
        let generation = policy.clean(&raw);
        attempts += 1;

        let bad = policy.is_bad(&generation, index);
        if !bad || attempts > policy.retries {
            return Ok(GenerationAttempt { input_text, generation, shots, attempts, accepted_despite_bad: bad });
        }
        tracing::debug!(attempt = attempts, kind = artifact.kind.label(), "rejected generation; retrying");
    }
}

/// One line of `generations.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub timestamp_utc: String,
    pub seed: u64,
    pub model_id: String,
    pub artifact: ArtifactKind,
    pub prompt_variant: PromptVariant,
    pub model_path: String,
    pub adapter_path: String,
    pub prompt: String,
    pub input_text: String,
    pub generation: String,
    pub shots: Vec<String>,
    pub max_new_tokens: u32,
    pub stop: String,
    pub attempts: u32,
    pub accepted_despite_bad: bool,
    pub len_chars: usize,
    pub len_words: usize,
    pub is_empty: bool,
}

pub fn read_generations(path: &Path) -> PipelineResult<Vec<GenerationRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::MissingInput(path.to_path_buf()),
        _ => e.into(),
    })?;
    let mut out = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ProbeSummary {
    pub path: PathBuf,
    pub records: usize,
    /// Artifacts skipped because generation failed.
    pub failed_artifacts: Vec<String>,
}

struct PromptBuilder<'a> {
    config: &'a ProbeConfig,
    pool: &'a ShotPool,
    rng: StdRng,
}

impl PromptBuilder<'_> {
    fn build(&mut self, variant: PromptVariant, prompt: &str) -> (String, Vec<String>) {
        match variant {
            PromptVariant::Plain => (prompt.to_string(), Vec::new()),
            PromptVariant::Directive => (format!("{prompt}{}", self.config.directive_suffix), Vec::new()),
            PromptVariant::FewShot => {
                let shots = if self.pool.is_empty() {
                    self.config.fewshot.shots.clone()
                } else {
                    self.pool.pick_diverse(self.config.n_shots, &mut self.rng)
                };
                (self.config.fewshot.render(prompt, &shots), shots)
            }
        }
    }
}

/// Probe every registered run and write `generations.jsonl`.
pub fn run_probe(config: &PipelineConfig, generator: &mut dyn Generator) -> PipelineResult<ProbeSummary> {
    let probe = &config.probe;
    if probe.prompts.is_empty() {
        return Err(PipelineError::Config("probe.prompts must list at least one prompt".to_string()));
    }

    let contract = Contract::load(&config.contract_path())?;
    let train = contract
        .split_path("train")
        .ok_or_else(|| PipelineError::Dataset("contract has no train split".to_string()))?;
    PipelineError::require(&train)?;
    let unique = dedup_texts(read_texts(&train, contract.text_field())?);
    let index = MemorizationIndex::new(&unique);
    let pool = ShotPool::new(unique);
    tracing::info!(texts = index.len(), "loaded training corpus for probe");

    let registry = ArtifactRegistry::load(&config.artifacts_path())?;
    let policy = GenerationPolicy::from(probe);
    let mut prompts = PromptBuilder { config: probe, pool: &pool, rng: StdRng::seed_from_u64(probe.seed) };
    let timestamp = utc_now();

    let path = config.generations_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(&path)?);
    let mut records = 0usize;
    let mut failed_artifacts = Vec::new();

    for run in &registry.runs {
        let mut artifacts = select_artifacts(run);
        if probe.artifacts == ArtifactSelection::Preferred {
            artifacts.truncate(1);
        }

        'artifact: for artifact in &artifacts {
            for &variant in &probe.variants {
                for prompt in &probe.prompts {
                    let attempt = match generate_with_retries(generator, artifact, &policy, &index, || {
                        prompts.build(variant, prompt)
                    }) {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(
                                model_id = %run.model_id,
                                artifact = artifact.kind.label(),
                                error = %e,
                                "generation failed; skipping artifact"
                            );
                            failed_artifacts.push(format!("{} ({})", run.model_id, artifact.kind.label()));
                            continue 'artifact;
                        }
                    };

                    let record = GenerationRecord {
                        timestamp_utc: timestamp.clone(),
                        seed: probe.seed,
                        model_id: run.model_id.clone(),
                        artifact: artifact.kind,
                        prompt_variant: variant,
                        model_path: artifact.model_path.clone(),
                        adapter_path: artifact.adapter_path.clone().unwrap_or_default(),
                        prompt: prompt.clone(),
                        input_text: attempt.input_text,
                        len_chars: attempt.generation.chars().count(),
                        len_words: word_count(&attempt.generation),
                        is_empty: attempt.generation.trim().is_empty(),
                        generation: attempt.generation,
                        shots: attempt.shots,
                        max_new_tokens: policy.max_new_tokens,
                        stop: if policy.trim_at_stop { policy.stop.clone().unwrap_or_default() } else { String::new() },
                        attempts: attempt.attempts,
                        accepted_despite_bad: attempt.accepted_despite_bad,
                    };
                    serde_json::to_writer(&mut writer, &record)?;
                    writer.write_all(b"\n")?;
                    records += 1;
                }
            }
        }
    }
    writer.flush()?;

    tracing::info!(path = %path.display(), records, "wrote generations");
    Ok(ProbeSummary { path, records, failed_artifacts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RunFiles, TrainingParams};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedGenerator {
        replies: VecDeque<String>,
        prompts: Vec<String>,
    }

    impl ScriptedGenerator {
        fn new(replies: &[&str]) -> Self {
            Self { replies: replies.iter().map(|s| (*s).to_string()).collect(), prompts: Vec::new() }
        }
    }

    impl Generator for ScriptedGenerator {
        fn generate(&mut self, _artifact: &ArtifactChoice, prompt: &str, _max: u32) -> PipelineResult<String> {
            self.prompts.push(prompt.to_string());
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    fn run_entry(root: &Path) -> RunEntry {
        RunEntry {
            model_id: "org/m".to_string(),
            output_root: root.display().to_string(),
            adapter_dir: root.join("adapter").display().to_string(),
            logs_dir: root.join("logs").display().to_string(),
            fused_dir: None,
            quantized_dir: None,
            files: RunFiles::default(),
            training_params: TrainingParams::default(),
            quantize_bits: None,
            q_group_size: None,
        }
    }

    fn policy(retries: u32) -> GenerationPolicy {
        GenerationPolicy {
            max_new_tokens: 16,
            min_words: 3,
            retries,
            stop: Some("\n\n".to_string()),
            trim_at_stop: true,
        }
    }

    fn base_adapter() -> ArtifactChoice {
        ArtifactChoice { kind: ArtifactKind::BaseAdapter, model_path: "m".to_string(), adapter_path: None }
    }

    #[test]
    fn test_select_artifacts_preference_and_fallback() {
        let temp = TempDir::new().unwrap();
        let mut run = run_entry(temp.path());
        let fused = temp.path().join("fused/model");
        std::fs::create_dir_all(&fused).unwrap();
        run.fused_dir = Some(fused.display().to_string());
        run.quantized_dir = Some(temp.path().join("quantized").display().to_string());

        let kinds: Vec<ArtifactKind> = select_artifacts(&run).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Fused, ArtifactKind::BaseAdapter]);

        std::fs::create_dir_all(temp.path().join("quantized")).unwrap();
        let kinds: Vec<ArtifactKind> = select_artifacts(&run).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Quantized, ArtifactKind::Fused, ArtifactKind::BaseAdapter]);
    }

    #[test]
    fn test_select_artifacts_dedups() {
        let temp = TempDir::new().unwrap();
        let mut run = run_entry(temp.path());
        let dir = temp.path().join("same");
        std::fs::create_dir_all(&dir).unwrap();
        run.fused_dir = Some(dir.display().to_string());
        run.quantized_dir = Some(dir.display().to_string());
        assert_eq!(select_artifacts(&run).len(), 2);
    }

    #[test]
    fn test_trim_at_stop() {
        assert_eq!(trim_at_stop("one\n\ntwo", "\n\n"), "one");
        assert_eq!(trim_at_stop("one", "\n\n"), "one");
        assert_eq!(trim_at_stop("one", ""), "one");
    }

    #[test]
    fn test_extract_generation() {
        let stdout = "==========\nPrompt text and more words\n==========\nPrompt: 5 tokens\n";
        assert_eq!(extract_generation(stdout, "Prompt text"), " and more words");
        assert_eq!(extract_generation("plain output", "x"), "plain output");
    }

    #[test]
    fn test_retries_until_good() {
        let index = MemorizationIndex::new(&["the training sentence that is long enough".to_string()]);
        let mut generator = ScriptedGenerator::new(&["no", "training sentence that is long enough", "a fresh new thought"]);
        let attempt =
            generate_with_retries(&mut generator, &base_adapter(), &policy(5), &index, || ("p".to_string(), vec![]))
                .unwrap();
        assert_eq!(attempt.generation, "a fresh new thought");
        assert_eq!(attempt.attempts, 3);
        assert_eq!(generator.prompts.len(), 3);
        assert!(!attempt.accepted_despite_bad);
    }

    #[test]
    fn test_last_attempt_kept_when_budget_spent() {
        let index = MemorizationIndex::default();
        let mut generator = ScriptedGenerator::new(&["a", "b", "c", "d"]);
        let attempt =
            generate_with_retries(&mut generator, &base_adapter(), &policy(2), &index, || ("p".to_string(), vec![]))
                .unwrap();
        assert_eq!(attempt.attempts, 3);
        assert_eq!(attempt.generation, "c");
        assert!(attempt.accepted_despite_bad);
    }

    #[test]
    fn test_stop_applied_before_judging() {
        let index = MemorizationIndex::default();
        let mut generator = ScriptedGenerator::new(&["  one two three\n\nfour five  "]);
        let attempt =
            generate_with_retries(&mut generator, &base_adapter(), &policy(0), &index, || ("p".to_string(), vec![]))
                .unwrap();
        assert_eq!(attempt.generation, "one two three");
    }

    #[test]
    fn test_fewshot_render() {
        let template = FewShotTemplate::default();
        let rendered = template.render("Q", &["a".to_string(), "b".to_string()]);
        assert_eq!(rendered, "Some proverbs:\n- a\n- b\n\nQ\n- ");
    }

    #[test]
    fn test_variant_serde_names() {
        assert_eq!(serde_json::to_value(PromptVariant::FewShot).unwrap(), serde_json::json!("fewshot"));
        assert_eq!(serde_json::to_value(ArtifactKind::BaseAdapter).unwrap(), serde_json::json!("base+adapter"));
        let parsed: ArtifactSelection = serde_json::from_value(serde_json::json!("all")).unwrap();
        assert_eq!(parsed, ArtifactSelection::All);
    }
}
