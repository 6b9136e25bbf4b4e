//! Per-split corpus validation.
//!
//! Every line of a split lands in exactly one bucket, checked in order:
//! malformed JSON, missing text field, non-string text field, valid. Valid
//! lines feed the emptiness, control-character, duplicate, length and
//! EOS-marker statistics. Files are streamed line by line.

use crate::config::PipelineConfig;
use crate::contract::Contract;
use crate::error::{PipelineError, PipelineResult};
use crate::hashing::sha256_text;
use crate::persist::{utc_now, write_json};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Substrings that look like end-of-sequence markers.
pub const EOS_MARKERS: [&str; 5] = ["</s>", "###", "\n\n", "<|eot_id|>", "<|endoftext|>"];

const SAMPLE_LIMIT: usize = 3;
const SAMPLE_WIDTH: usize = 160;

/// Unicode general category `Cf` (format characters).
const FORMAT_RANGES: &[(u32, u32)] = &[
    (0x00AD, 0x00AD),
    (0x0600, 0x0605),
    (0x061C, 0x061C),
    (0x06DD, 0x06DD),
    (0x070F, 0x070F),
    (0x0890, 0x0891),
    (0x08E2, 0x08E2),
    (0x180E, 0x180E),
    (0x200B, 0x200F),
    (0x202A, 0x202E),
    (0x2060, 0x2064),
    (0x2066, 0x206F),
    (0xFEFF, 0xFEFF),
    (0xFFF9, 0xFFFB),
    (0x110BD, 0x110BD),
    (0x110CD, 0x110CD),
    (0x13430, 0x1343F),
    (0x1BCA0, 0x1BCA3),
    (0x1D173, 0x1D17A),
    (0xE0001, 0xE0001),
    (0xE0020, 0xE007F),
];

/// Unicode whitespace plus the information separators U+001C..=U+001F.
#[must_use]
pub fn is_text_space(c: char) -> bool {
    c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c)
}

/// True for characters in Unicode category `Cc` or `Cf`.
#[must_use]
pub fn is_control_or_format(c: char) -> bool {
    if c.is_control() {
        return true;
    }
    let cp = u32::from(c);
    FORMAT_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub bad_json: u64,
    pub missing_field: u64,
    pub non_string_field: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyCounts {
    pub empty_exact: u64,
    pub whitespace_only: u64,
    pub leading_whitespace: u64,
    pub trailing_whitespace: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub duplicate_example_count: u64,
    /// Up to three hashes that occur more than once, in first-seen order.
    pub sha256_examples: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p5: usize,
    pub p25: usize,
    pub p50: usize,
    pub p75: usize,
    pub p95: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LengthStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub median: f64,
    pub percentiles: Percentiles,
}

/// Marker hit counts, kept in [`EOS_MARKERS`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EosMarkerHits(pub Vec<(String, u64)>);

impl Default for EosMarkerHits {
    fn default() -> Self {
        Self(EOS_MARKERS.iter().map(|m| ((*m).to_string(), 0)).collect())
    }
}

impl EosMarkerHits {
    fn record(&mut self, text: &str) {
        for (marker, hits) in &mut self.0 {
            if text.contains(marker.as_str()) {
                *hits += 1;
            }
        }
    }

    #[must_use]
    pub fn get(&self, marker: &str) -> u64 {
        self.0.iter().find(|(m, _)| m == marker).map_or(0, |(_, n)| *n)
    }
}

impl Serialize for EosMarkerHits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (marker, hits) in &self.0 {
            map.serialize_entry(marker, hits)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EosMarkerHits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HitsVisitor;

        impl<'de> Visitor<'de> for HitsVisitor {
            type Value = EosMarkerHits;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of marker to hit count")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some((marker, hits)) = access.next_entry::<String, u64>()? {
                    out.push((marker, hits));
                }
                Ok(EosMarkerHits(out))
            }
        }

        deserializer.deserialize_map(HitsVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Samples {
    pub good_first3: Vec<String>,
    pub bad_first3: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitReport {
    pub path: String,
    pub lines: u64,
    /// Lines whose text field decoded to a string, empty ones included.
    pub valid_examples: u64,
    pub errors: ErrorCounts,
    pub empties: EmptyCounts,
    pub control_char_lines: u64,
    pub duplicates: DuplicateStats,
    pub length_chars: LengthStats,
    pub eos_markers_hits: EosMarkerHits,
    pub samples: Samples,
}

impl SplitReport {
    /// Condensed one-line console summary.
    #[must_use]
    pub fn summary_line(&self, split: &str) -> String {
        let e = &self.errors;
        let m = &self.empties;
        let l = &self.length_chars;
        let eos: Vec<String> = self
            .eos_markers_hits
            .0
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| format!("{}:{}", k.escape_default(), n))
            .collect();
        format!(
            "- {split}: lines={} valid={} errors(bad/miss/nonstr)={}/{}/{} \
             empties(exact/ws/lead/trail)={}/{}/{}/{} ctrl={} dupes={} \
             len[min/med/95/max]={}/{}/{}/{} eos_hits={{{}}}",
            self.lines,
            self.valid_examples,
            e.bad_json,
            e.missing_field,
            e.non_string_field,
            m.empty_exact,
            m.whitespace_only,
            m.leading_whitespace,
            m.trailing_whitespace,
            self.control_char_lines,
            self.duplicates.duplicate_example_count,
            l.min,
            l.median as u64,
            l.percentiles.p95,
            l.max,
            eos.join(", "),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub created_utc: String,
    pub data_dir: String,
    pub text_field: String,
    pub splits: BTreeMap<String, SplitReport>,
}

impl ValidationReport {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        crate::persist::read_json(path)
    }

    /// Decoded record count of a split, accepting `val` for `valid`.
    #[must_use]
    pub fn valid_examples(&self, split: &str) -> Option<u64> {
        let report = match split {
            "valid" | "val" => self.splits.get("valid").or_else(|| self.splits.get("val")),
            other => self.splits.get(other),
        }?;
        Some(report.valid_examples)
    }
}

/// Nearest-rank percentile of an ascending slice.
///
/// The index is `round(p / 100 * (n - 1))` with ties to even, clamped to the
/// slice. Returns 0 for an empty slice.
#[must_use]
pub fn percentile(sorted: &[usize], p: f64) -> usize {
    if sorted.is_empty() {
        return 0;
    }
    let last = sorted.len() - 1;
    let rank = (p / 100.0 * last as f64).round_ties_even();
    let idx = if rank.is_finite() && rank > 0.0 { (rank as usize).min(last) } else { 0 };
    sorted[idx]
}

#[must_use]
pub fn percentiles(values: &[usize]) -> Percentiles {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Percentiles {
        p5: percentile(&sorted, 5.0),
        p25: percentile(&sorted, 25.0),
        p50: percentile(&sorted, 50.0),
        p75: percentile(&sorted, 75.0),
        p95: percentile(&sorted, 95.0),
    }
}

fn length_stats(lengths: &[usize]) -> LengthStats {
    if lengths.is_empty() {
        return LengthStats::default();
    }
    let mut sorted = lengths.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let mean = sorted.iter().sum::<usize>() as f64 / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    };
    LengthStats {
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median,
        percentiles: percentiles(&sorted),
    }
}

fn truncate_chars(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

#[derive(Default)]
struct DuplicateCounter {
    order: Vec<String>,
    counts: HashMap<String, u64>,
}

impl DuplicateCounter {
    fn add(&mut self, hash: String) {
        let count = self.counts.entry(hash.clone()).or_insert(0);
        if *count == 0 {
            self.order.push(hash);
        }
        *count += 1;
    }

    fn finish(self) -> DuplicateStats {
        let mut stats = DuplicateStats::default();
        for hash in self.order {
            let count = self.counts.get(&hash).copied().unwrap_or(0);
            if count > 1 {
                stats.duplicate_example_count += count - 1;
                if stats.sha256_examples.len() < SAMPLE_LIMIT {
                    stats.sha256_examples.push(hash);
                }
            }
        }
        stats
    }
}

/// Scan one split file for the text field `field`.
pub fn scan_split(path: &Path, field: &str) -> PipelineResult<SplitReport> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut lines = 0u64;
    let mut errors = ErrorCounts::default();
    let mut empties = EmptyCounts::default();
    let mut control_char_lines = 0u64;
    let mut lengths: Vec<usize> = Vec::new();
    let mut duplicates = DuplicateCounter::default();
    let mut eos = EosMarkerHits::default();
    let mut samples = Samples::default();

    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lines += 1;

        let decoded = String::from_utf8_lossy(&buf);
        let raw: &str = &decoded;
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let bad = |samples: &mut Samples, tag: &str, text: &str| {
            if samples.bad_first3.len() < SAMPLE_LIMIT {
                samples.bad_first3.push(format!("[{tag}] {}", truncate_chars(text, SAMPLE_WIDTH)));
            }
        };

        let Ok(record) = serde_json::from_str::<Value>(line) else {
            errors.bad_json += 1;
            bad(&mut samples, "bad_json", line);
            continue;
        };
        let Some(value) = record.as_object().and_then(|obj| obj.get(field)) else {
            errors.missing_field += 1;
            bad(&mut samples, "missing_field", line);
            continue;
        };
        let Some(text) = value.as_str() else {
            errors.non_string_field += 1;
            bad(&mut samples, "non_string", &value.to_string());
            continue;
        };

        if text.is_empty() {
            empties.empty_exact += 1;
        }
        if text.chars().all(is_text_space) {
            empties.whitespace_only += 1;
        }
        if text.chars().next().is_some_and(is_text_space) {
            empties.leading_whitespace += 1;
        }
        if text.chars().next_back().is_some_and(is_text_space) {
            empties.trailing_whitespace += 1;
        }
        if text.chars().any(is_control_or_format) {
            control_char_lines += 1;
        }

        lengths.push(text.chars().count());
        duplicates.add(sha256_text(text));
        eos.record(text);

        if samples.good_first3.len() < SAMPLE_LIMIT {
            samples.good_first3.push(text.to_string());
        }
    }

    let report = SplitReport {
        path: path.display().to_string(),
        lines,
        valid_examples: lengths.len() as u64,
        errors,
        empties,
        control_char_lines,
        duplicates: duplicates.finish(),
        length_chars: length_stats(&lengths),
        eos_markers_hits: eos,
        samples,
    };
    tracing::debug!(path = %path.display(), lines, valid = report.valid_examples, "scanned split");
    Ok(report)
}

/// Validate every split named by `contract`.
pub fn validate_contract(contract: &Contract, created_utc: &str) -> PipelineResult<ValidationReport> {
    let text_field = contract.text_field().to_string();
    let mut splits = BTreeMap::new();
    for (split, path) in contract.splits() {
        PipelineError::require(&path)?;
        splits.insert(split.to_string(), scan_split(&path, &text_field)?);
    }
    Ok(ValidationReport {
        created_utc: created_utc.to_string(),
        data_dir: contract.data_dir.clone(),
        text_field,
        splits,
    })
}

/// Load the contract, validate its splits and write the report wholesale.
pub fn run_validation(config: &PipelineConfig) -> PipelineResult<ValidationReport> {
    let contract = Contract::load(&config.contract_path())?;
    let report = validate_contract(&contract, &utc_now())?;
    write_json(&config.report_path(), &report)?;
    tracing::info!(path = %config.report_path().display(), splits = report.splits.len(), "wrote data report");
    Ok(report)
}
