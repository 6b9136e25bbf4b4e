//! Scoring of probe generations and selection of a generation policy.

use crate::config::PipelineConfig;
use crate::contract::Contract;
use crate::corpus::{MemorizationIndex, dedup_texts, read_texts, word_count};
use crate::error::{PipelineError, PipelineResult};
use crate::persist::{utc_now, write_json};
use crate::probe::{ArtifactKind, FewShotTemplate, GenerationRecord, PromptVariant, read_generations};
use crate::validate::is_text_space;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

const SENTENCE_END: [char; 4] = ['.', '!', '?', '…'];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub len_chars: usize,
    pub len_words: usize,
    pub is_empty: bool,
    pub ends_sentence: bool,
    pub ends_whitespace: bool,
    pub distinct1: f64,
    pub distinct2: f64,
    pub memorized_exact: bool,
    pub memorized_substring: bool,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Unique n-grams over total n-grams of whitespace tokens; 0 when too short.
#[must_use]
pub fn distinct_n(tokens: &[&str], n: usize) -> f64 {
    if n == 0 || tokens.len() < n {
        return 0.0;
    }
    let total = tokens.len() - n + 1;
    let unique: HashSet<&[&str]> = tokens.windows(n).collect();
    unique.len() as f64 / total as f64
}

#[must_use]
pub fn ends_sentence(text: &str) -> bool {
    text.trim().ends_with(SENTENCE_END)
}

impl GenerationMetrics {
    #[must_use]
    pub fn score(generation: &str, index: &MemorizationIndex) -> Self {
        let tokens: Vec<&str> = generation.split_whitespace().collect();
        Self {
            len_chars: generation.chars().count(),
            len_words: word_count(generation),
            is_empty: generation.trim().is_empty(),
            ends_sentence: ends_sentence(generation),
            ends_whitespace: generation.chars().next_back().is_some_and(is_text_space),
            distinct1: round4(distinct_n(&tokens, 1)),
            distinct2: round4(distinct_n(&tokens, 2)),
            memorized_exact: index.is_exact(generation),
            memorized_substring: index.is_substring(generation),
        }
    }
}

/// Aggregate over every generation of one (artifact, prompt variant) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub artifact: ArtifactKind,
    pub prompt_variant: PromptVariant,
    pub n: usize,
    pub empty_rate: f64,
    pub sent_end_rate: f64,
    pub avg_len_words: f64,
    pub med_len_words: f64,
    pub avg_len_chars: f64,
    pub trailing_ws_rate: f64,
    pub distinct1_mean: f64,
    pub distinct2_mean: f64,
    pub mem_exact_rate: f64,
    pub mem_sub_rate: f64,
    /// Generations kept only because the retry budget ran out.
    pub accepted_bad_rate: f64,
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    if n == 0 { 0.0 } else { values.sum::<f64>() / n as f64 }
}

fn median(mut values: Vec<usize>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 1 { values[n / 2] as f64 } else { (values[n / 2 - 1] + values[n / 2]) as f64 / 2.0 }
}

fn rate(flags: impl Iterator<Item = bool>, n: usize) -> f64 {
    mean(flags.map(|b| if b { 1.0 } else { 0.0 }), n)
}

/// Group records by (artifact, prompt variant) and summarize each group.
#[must_use]
pub fn summarize(records: &[GenerationRecord], index: &MemorizationIndex) -> Vec<VariantSummary> {
    let mut groups: BTreeMap<(ArtifactKind, PromptVariant), Vec<(&GenerationRecord, GenerationMetrics)>> =
        BTreeMap::new();
    for record in records {
        let metrics = GenerationMetrics::score(&record.generation, index);
        groups.entry((record.artifact, record.prompt_variant)).or_default().push((record, metrics));
    }

    groups
        .into_iter()
        .map(|((artifact, prompt_variant), rows)| {
            let n = rows.len();
            let m = || rows.iter().map(|(_, m)| m);
            VariantSummary {
                artifact,
                prompt_variant,
                n,
                empty_rate: round4(rate(m().map(|x| x.is_empty), n)),
                sent_end_rate: round4(rate(m().map(|x| x.ends_sentence), n)),
                avg_len_words: round4(mean(m().map(|x| x.len_words as f64), n)),
                med_len_words: median(m().map(|x| x.len_words).collect()),
                avg_len_chars: round4(mean(m().map(|x| x.len_chars as f64), n)),
                trailing_ws_rate: round4(rate(m().map(|x| x.ends_whitespace), n)),
                distinct1_mean: round4(mean(m().map(|x| x.distinct1), n)),
                distinct2_mean: round4(mean(m().map(|x| x.distinct2), n)),
                mem_exact_rate: round4(rate(m().map(|x| x.memorized_exact), n)),
                mem_sub_rate: round4(rate(m().map(|x| x.memorized_substring), n)),
                accepted_bad_rate: round4(rate(rows.iter().map(|(r, _)| r.accepted_despite_bad), n)),
            }
        })
        .collect()
}

/// Lowest empty rate, then highest sentence-end rate, then longest average.
#[must_use]
pub fn pick_winner(groups: &[VariantSummary]) -> Option<&VariantSummary> {
    groups.iter().min_by(|a, b| {
        a.empty_rate
            .total_cmp(&b.empty_rate)
            .then_with(|| b.sent_end_rate.total_cmp(&a.sent_end_rate))
            .then_with(|| b.avg_len_words.total_cmp(&a.avg_len_words))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub artifact: ArtifactKind,
    pub prompt_variant: PromptVariant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub created_utc: String,
    pub groups: Vec<VariantSummary>,
    pub winner: Option<Winner>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectivePolicy {
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPolicy {
    pub name: PromptVariant,
    pub fewshot: FewShotTemplate,
    pub directive: DirectivePolicy,
}

/// Reusable generation settings chosen from the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPolicyFile {
    pub created_utc: String,
    /// Winner first, then the remaining kinds in default preference order.
    pub artifact_preference: Vec<ArtifactKind>,
    pub prompt_policy: PromptPolicy,
    pub max_new_tokens: u32,
    pub min_words: usize,
    pub retries: u32,
    pub stop: Option<String>,
}

#[must_use]
pub fn artifact_preference(winner: ArtifactKind) -> Vec<ArtifactKind> {
    let mut out = vec![winner];
    out.extend(
        [ArtifactKind::Quantized, ArtifactKind::Fused, ArtifactKind::BaseAdapter]
            .into_iter()
            .filter(|k| *k != winner),
    );
    out
}

pub fn write_summary_csv(path: &Path, groups: &[VariantSummary]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
    for group in groups {
        writer.serialize(group)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MetricsOutcome {
    pub summary_path: PathBuf,
    pub analysis_path: PathBuf,
    /// Written only when there was at least one generation.
    pub policy_path: Option<PathBuf>,
    pub analysis: Analysis,
}

/// Score `generations.jsonl`, write summary, analysis and the chosen policy.
pub fn run_metrics(config: &PipelineConfig) -> PipelineResult<MetricsOutcome> {
    let records = read_generations(&config.generations_path())?;

    let contract = Contract::load(&config.contract_path())?;
    let train = contract
        .split_path("train")
        .ok_or_else(|| PipelineError::Dataset("contract has no train split".to_string()))?;
    PipelineError::require(&train)?;
    let index = MemorizationIndex::new(&dedup_texts(read_texts(&train, contract.text_field())?));

    let groups = summarize(&records, &index);
    let winner = pick_winner(&groups).map(|w| Winner { artifact: w.artifact, prompt_variant: w.prompt_variant });
    let created_utc = utc_now();

    let summary_path = config.summary_path();
    write_summary_csv(&summary_path, &groups)?;

    let analysis = Analysis {
        created_utc: created_utc.clone(),
        groups,
        winner: winner.clone(),
        notes: vec![
            "distinct1/distinct2 measure lexical diversity over whitespace tokens".to_string(),
            "memorized_* compare generations with the training split (exact, or substring of 24+ chars)"
                .to_string(),
        ],
    };
    let analysis_path = config.analysis_path();
    write_json(&analysis_path, &analysis)?;

    let policy_path = match &winner {
        Some(w) => {
            let probe = &config.probe;
            let policy = GenerationPolicyFile {
                created_utc,
                artifact_preference: artifact_preference(w.artifact),
                prompt_policy: PromptPolicy {
                    name: w.prompt_variant,
                    fewshot: probe.fewshot.clone(),
                    directive: DirectivePolicy { suffix: probe.directive_suffix.clone() },
                },
                max_new_tokens: probe.max_new_tokens,
                min_words: probe.min_words,
                retries: probe.retries,
                stop: probe.stop.clone(),
            };
            let path = config.generation_policy_path();
            write_json(&path, &policy)?;
            tracing::info!(
                artifact = w.artifact.label(),
                prompt_variant = w.prompt_variant.label(),
                path = %path.display(),
                "locked generation policy"
            );
            Some(path)
        }
        None => {
            tracing::warn!("no generations to score; generation policy not written");
            None
        }
    };

    Ok(MetricsOutcome { summary_path, analysis_path, policy_path, analysis })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(artifact: ArtifactKind, variant: PromptVariant, generation: &str) -> GenerationRecord {
        GenerationRecord {
            timestamp_utc: "t".to_string(),
            seed: 1,
            model_id: "m".to_string(),
            artifact,
            prompt_variant: variant,
            model_path: "m".to_string(),
            adapter_path: String::new(),
            prompt: "p".to_string(),
            input_text: "p".to_string(),
            generation: generation.to_string(),
            shots: Vec::new(),
            max_new_tokens: 8,
            stop: String::new(),
            attempts: 1,
            accepted_despite_bad: false,
            len_chars: generation.chars().count(),
            len_words: word_count(generation),
            is_empty: generation.trim().is_empty(),
        }
    }

    #[test]
    fn test_distinct_n() {
        let tokens = ["a", "b", "a", "b"];
        assert!((distinct_n(&tokens, 1) - 0.5).abs() < 1e-9);
        assert!((distinct_n(&tokens, 2) - 2.0 / 3.0).abs() < 1e-9);
        assert!(distinct_n(&["a"], 2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_generation() {
        let index = MemorizationIndex::new(&["Water finds its own level in the end.".to_string()]);
        let m = GenerationMetrics::score("Water finds its own level in the end. ", &index);
        assert!(m.ends_sentence);
        assert!(m.ends_whitespace);
        assert!(m.memorized_exact);
        assert!(!m.memorized_substring);
        assert_eq!(m.len_words, 8);

        let m = GenerationMetrics::score("so it goes…", &index);
        assert!(m.ends_sentence);
        assert!(!m.memorized_exact);
    }

    #[test]
    fn test_winner_ordering() {
        let index = MemorizationIndex::default();
        let records = vec![
            record(ArtifactKind::Quantized, PromptVariant::Plain, ""),
            record(ArtifactKind::Quantized, PromptVariant::Plain, "Fine words."),
            record(ArtifactKind::Fused, PromptVariant::FewShot, "no ending here"),
            record(ArtifactKind::Fused, PromptVariant::FewShot, "ends well."),
            record(ArtifactKind::Fused, PromptVariant::Directive, "short."),
            record(ArtifactKind::Fused, PromptVariant::Directive, "a longer answer."),
        ];
        let groups = summarize(&records, &index);
        assert_eq!(groups.len(), 3);

        let quantized = groups.iter().find(|g| g.artifact == ArtifactKind::Quantized).unwrap();
        assert!((quantized.empty_rate - 0.5).abs() < 1e-9);

        let winner = pick_winner(&groups).unwrap();
        assert_eq!(winner.artifact, ArtifactKind::Fused);
        assert_eq!(winner.prompt_variant, PromptVariant::Directive);
    }

    #[test]
    fn test_artifact_preference() {
        assert_eq!(
            artifact_preference(ArtifactKind::Fused),
            vec![ArtifactKind::Fused, ArtifactKind::Quantized, ArtifactKind::BaseAdapter]
        );
    }

    #[test]
    fn test_summary_csv_header() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("eval/summary.csv");
        let records = [record(ArtifactKind::BaseAdapter, PromptVariant::Plain, "x y z.")];
        let groups = summarize(&records, &MemorizationIndex::default());
        write_summary_csv(&path, &groups).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("artifact,prompt_variant,n,empty_rate"));
        assert!(lines.next().unwrap().starts_with("base+adapter,plain,1,0.0,1.0"));
    }
}
