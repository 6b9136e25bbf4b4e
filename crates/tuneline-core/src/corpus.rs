//! Training-corpus helpers for generation probes: memorization checks and
//! few-shot sampling.

use crate::error::PipelineResult;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Minimum generation length (in characters) for a substring match to count.
pub const MEMORIZATION_MIN_CHARS: usize = 24;

#[must_use]
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Trimmed, non-empty string values of `field`, in file order.
///
/// Lines that fail to decode or lack the field are skipped.
pub fn read_texts(path: &Path, field: &str) -> PipelineResult<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.split(b'\n') {
        let line = line?;
        let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(&line) else {
            continue;
        };
        if let Some(text) = obj.get(field).and_then(Value::as_str) {
            let text = text.trim();
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
    }
    Ok(out)
}

/// First occurrence of each text, order preserved.
#[must_use]
pub fn dedup_texts(texts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    texts.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

#[derive(Debug, Clone, Default)]
pub struct MemorizationIndex {
    texts: HashSet<String>,
    blob: String,
}

impl MemorizationIndex {
    #[must_use]
    pub fn new(unique: &[String]) -> Self {
        Self { texts: unique.iter().cloned().collect(), blob: unique.join("\n\n") }
    }

    #[must_use]
    pub fn is_exact(&self, generation: &str) -> bool {
        self.texts.contains(generation.trim())
    }

    /// Long enough and found verbatim somewhere in the corpus, but not an exact record.
    #[must_use]
    pub fn is_substring(&self, generation: &str) -> bool {
        let g = generation.trim();
        !self.is_exact(g) && g.chars().count() >= MEMORIZATION_MIN_CHARS && self.blob.contains(g)
    }

    #[must_use]
    pub fn is_memorized(&self, generation: &str) -> bool {
        self.is_exact(generation) || self.is_substring(generation)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Corpus texts bucketed by length for diverse few-shot selection.
///
/// Short is at most 4 words, medium 5 to 12, long more than 12.
#[derive(Debug, Clone, Default)]
pub struct ShotPool {
    unique: Vec<String>,
    short: Vec<usize>,
    medium: Vec<usize>,
    long: Vec<usize>,
}

impl ShotPool {
    #[must_use]
    pub fn new(unique: Vec<String>) -> Self {
        let mut pool = Self { unique, ..Self::default() };
        for (i, text) in pool.unique.iter().enumerate() {
            match word_count(text) {
                0..=4 => pool.short.push(i),
                5..=12 => pool.medium.push(i),
                _ => pool.long.push(i),
            }
        }
        pool
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }

    /// One text from each non-empty bucket, then a shuffled fill, truncated to `k`.
    pub fn pick_diverse<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Vec<String> {
        let mut picked: Vec<usize> = [&self.short, &self.medium, &self.long]
            .into_iter()
            .filter_map(|bucket| bucket.choose(rng).copied())
            .collect();
        let mut rest: Vec<usize> = (0..self.unique.len()).filter(|i| !picked.contains(i)).collect();
        rest.shuffle(rng);
        picked.extend(rest);
        picked.truncate(k);
        picked.into_iter().map(|i| self.unique[i].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn texts() -> Vec<String> {
        vec![
            "short one".to_string(),
            "a medium length line with six words".to_string(),
            "this is a rather long line that keeps going well past twelve words in total".to_string(),
            "tiny".to_string(),
        ]
    }

    #[test]
    fn test_read_texts_skips_bad_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        std::fs::write(&path, "{\"text\":\"  a  \"}\nbroken\n{\"text\":\"\"}\n{\"text\":3}\n{\"text\":\"b\"}").unwrap();
        assert_eq!(read_texts(&path, "text").unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_dedup_preserves_order() {
        let out = dedup_texts(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(out, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_memorization_thresholds() {
        let index = MemorizationIndex::new(&texts());
        assert!(index.is_exact("  tiny "));
        assert!(!index.is_substring("tiny"));
        // 23 characters: too short for the substring rule.
        assert!(!index.is_memorized("a medium length line wi"));
        // 24 characters.
        assert!(index.is_substring("a medium length line wit"));
        assert!(!index.is_memorized("something entirely new and unseen here"));
    }

    #[test]
    fn test_pick_diverse_covers_buckets() {
        let pool = ShotPool::new(texts());
        let mut rng = StdRng::seed_from_u64(42);
        let shots = pool.pick_diverse(3, &mut rng);
        assert_eq!(shots.len(), 3);
        assert!(shots.iter().any(|s| word_count(s) <= 4));
        assert!(shots.iter().any(|s| (5..=12).contains(&word_count(s))));
        assert!(shots.iter().any(|s| word_count(s) > 12));

        let all = pool.pick_diverse(10, &mut rng);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_pick_diverse_is_seeded() {
        let pool = ShotPool::new(texts());
        let a = pool.pick_diverse(4, &mut StdRng::seed_from_u64(7));
        let b = pool.pick_diverse(4, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
