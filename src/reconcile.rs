//! Offline reconciliation of crawled labels with delivered file names
//!
//! The study-data page labels its checkboxes with human names while the
//! archive it delivers uses different file names. For every guessed name we
//! sum several normalized similarity measures against every real name and
//! keep the best scoring one.

use crate::error::{PpmiError, Result};
use crate::logging::Logger;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

/// A string similarity normalized to `[0, 1]`, 1 meaning identical.
pub trait Similarity: Send + Sync {
    fn name(&self) -> &str;

    fn normalized_similarity(&self, a: &str, b: &str) -> f64;
}

pub struct Levenshtein;

impl Similarity for Levenshtein {
    fn name(&self) -> &str {
        "levenshtein"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(a, b)
    }
}

pub struct DamerauLevenshtein;

impl Similarity for DamerauLevenshtein {
    fn name(&self) -> &str {
        "damerau_levenshtein"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_damerau_levenshtein(a, b)
    }
}

pub struct Jaro;

impl Similarity for Jaro {
    fn name(&self) -> &str {
        "jaro"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        strsim::jaro(a, b)
    }
}

pub struct JaroWinkler;

impl Similarity for JaroWinkler {
    fn name(&self) -> &str {
        "jaro_winkler"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        strsim::jaro_winkler(a, b)
    }
}

/// Character multiset of a string.
fn char_counts(s: &str) -> HashMap<char, usize> {
    let mut counts = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    counts
}

/// Sizes of (a, b, a intersect b, a union b) as multisets.
fn multiset_sizes(a: &str, b: &str) -> (usize, usize, usize, usize) {
    let ca = char_counts(a);
    let cb = char_counts(b);
    let size_a: usize = ca.values().sum();
    let size_b: usize = cb.values().sum();
    let intersection: usize = ca
        .iter()
        .map(|(c, n)| (*n).min(cb.get(c).copied().unwrap_or(0)))
        .sum();
    (size_a, size_b, intersection, size_a + size_b - intersection)
}

/// Which ratio a [`TokenMeasure`] computes over character multisets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMeasure {
    Jaccard,
    SorensenDice,
    Overlap,
    Cosine,
}

impl Similarity for TokenMeasure {
    fn name(&self) -> &str {
        match self {
            TokenMeasure::Jaccard => "jaccard",
            TokenMeasure::SorensenDice => "sorensen_dice",
            TokenMeasure::Overlap => "overlap",
            TokenMeasure::Cosine => "cosine",
        }
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        let (size_a, size_b, intersection, union) = multiset_sizes(a, b);
        if size_a == 0 && size_b == 0 {
            return 1.0;
        }
        let inter = intersection as f64;
        let ratio = match self {
            TokenMeasure::Jaccard => inter / union as f64,
            TokenMeasure::SorensenDice => 2.0 * inter / (size_a + size_b) as f64,
            TokenMeasure::Overlap => match size_a.min(size_b) {
                0 => 0.0,
                smallest => inter / smallest as f64,
            },
            TokenMeasure::Cosine => match size_a * size_b {
                0 => 0.0,
                product => inter / (product as f64).sqrt(),
            },
        };
        ratio.clamp(0.0, 1.0)
    }
}

/// Normalized compression distance turned into a similarity.
fn ncd_similarity(a: &str, b: &str, size: impl Fn(&str) -> f64) -> f64 {
    if a == b {
        return 1.0;
    }
    let ca = size(a);
    let cb = size(b);
    let cab = size(&format!("{}{}", a, b));
    let max = ca.max(cb);
    if max <= 0.0 {
        return 1.0;
    }
    let distance = (cab - ca.min(cb)) / max;
    (1.0 - distance).clamp(0.0, 1.0)
}

/// NCD with zlib as the compressor.
pub struct ZlibNcd;

impl ZlibNcd {
    fn compressed_len(data: &str) -> f64 {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        // Writing into a Vec cannot fail
        let written = encoder
            .write_all(data.as_bytes())
            .and_then(|_| encoder.finish());
        match written {
            Ok(bytes) => bytes.len() as f64,
            Err(_) => data.len() as f64,
        }
    }
}

impl Similarity for ZlibNcd {
    fn name(&self) -> &str {
        "zlib_ncd"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        ncd_similarity(a, b, Self::compressed_len)
    }
}

/// NCD using Shannon entropy (plus one) as the ideal compressed size.
pub struct EntropyNcd;

impl EntropyNcd {
    fn entropy_size(data: &str) -> f64 {
        let counts = char_counts(data);
        let total: usize = counts.values().sum();
        if total == 0 {
            return 1.0;
        }
        let total = total as f64;
        let entropy: f64 = counts
            .values()
            .map(|n| {
                let p = *n as f64 / total;
                -p * p.log2()
            })
            .sum();
        1.0 + entropy
    }
}

impl Similarity for EntropyNcd {
    fn name(&self) -> &str {
        "entropy_ncd"
    }

    fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        ncd_similarity(a, b, Self::entropy_size)
    }
}

/// Edit, token and compression based measures.
pub fn default_measures() -> Vec<Box<dyn Similarity>> {
    vec![
        Box::new(Levenshtein),
        Box::new(DamerauLevenshtein),
        Box::new(Jaro),
        Box::new(JaroWinkler),
        Box::new(TokenMeasure::Jaccard),
        Box::new(TokenMeasure::SorensenDice),
        Box::new(TokenMeasure::Overlap),
        Box::new(TokenMeasure::Cosine),
        Box::new(ZlibNcd),
        Box::new(EntropyNcd),
    ]
}

/// One real name scored against a guessed name.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub real: String,
    pub scores: Vec<f64>,
}

impl Candidate {
    pub fn total(&self) -> f64 {
        self.scores.iter().sum()
    }

    pub fn best(&self) -> f64 {
        self.scores.iter().copied().fold(0.0, f64::max)
    }
}

pub struct Reconciler {
    measures: Vec<Box<dyn Similarity>>,
    top: usize,
    logger: Logger,
}

impl Reconciler {
    pub fn new(measures: Vec<Box<dyn Similarity>>, logger: Logger) -> Self {
        Self {
            measures,
            top: 3,
            logger,
        }
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = top;
        self
    }

    /// Candidates for `guessed`, best first; equal totals keep input order.
    pub fn rank(&self, real: &[String], guessed: &str) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = real
            .iter()
            .map(|real_name| Candidate {
                real: real_name.clone(),
                scores: self
                    .measures
                    .iter()
                    .map(|m| m.normalized_similarity(real_name, guessed))
                    .collect(),
            })
            .collect();
        // sort_by is stable
        candidates.sort_by(|a, b| b.total().total_cmp(&a.total()));
        candidates
    }

    /// Map every guessed name to its best scoring real name.
    pub fn find_matching(&self, real: &[String], guessed: &[String]) -> Result<BTreeMap<String, String>> {
        if self.measures.is_empty() {
            return Err(PpmiError::Config("no similarity measure configured".to_string()));
        }

        let mut mapping = BTreeMap::new();
        for guess in guessed {
            let ranked = self.rank(real, guess);
            for candidate in ranked.iter().take(self.top) {
                self.logger.info(format_args!(
                    "{} -> {} (best {:.3}, total {:.3})",
                    guess,
                    candidate.real,
                    candidate.best(),
                    candidate.total()
                ));
            }
            let best = ranked.into_iter().next().ok_or_else(|| {
                PpmiError::name_resolution(guess.clone(), "no real file names to match against")
            })?;
            mapping.insert(guess.clone(), best.real);
        }

        // A real name claimed twice cannot be read back as a mapping
        let mut claimed: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (guess, real) in &mapping {
            claimed.entry(real.as_str()).or_default().push(guess.as_str());
        }
        if let Some((real, guesses)) = claimed.iter().find(|(_, g)| g.len() > 1) {
            return Err(PpmiError::name_resolution(
                *real,
                format!("matched by several guessed names: {}", guesses.join(", ")),
            ));
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Length of the common prefix over the longer length.
    struct PrefixLength;

    impl Similarity for PrefixLength {
        fn name(&self) -> &str {
            "prefix"
        }

        fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
            let common = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
            let longest = a.chars().count().max(b.chars().count());
            if longest == 0 {
                1.0
            } else {
                common as f64 / longest as f64
            }
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prefix_stub_matching() {
        let reconciler = Reconciler::new(vec![Box::new(PrefixLength)], Logger::silent());
        let real = strings(&["Dem.csv", "Vital_Signs.csv", "Demographics.csv"]);
        let mapping = reconciler
            .find_matching(&real, &strings(&["Demographics"]))
            .unwrap();
        assert_eq!(mapping["Demographics"], "Demographics.csv");
    }

    #[test]
    fn test_ties_keep_first_real_name() {
        let reconciler = Reconciler::new(vec![Box::new(PrefixLength)], Logger::silent());
        let real = strings(&["Ab.csv", "Ac.csv"]);
        let mapping = reconciler.find_matching(&real, &strings(&["A"])).unwrap();
        assert_eq!(mapping["A"], "Ab.csv");
    }

    #[test]
    fn test_no_real_names() {
        let reconciler = Reconciler::new(default_measures(), Logger::silent());
        let err = reconciler
            .find_matching(&[], &strings(&["Demographics.csv"]))
            .unwrap_err();
        assert!(matches!(err, PpmiError::NameResolution { .. }));
    }

    #[test]
    fn test_colliding_matches_are_rejected() {
        let reconciler = Reconciler::new(default_measures(), Logger::silent());
        let real = strings(&["Demographics_20Jan2024.csv"]);
        let err = reconciler
            .find_matching(
                &real,
                &strings(&["Demographics.csv", "Demographics__Archived_.csv"]),
            )
            .unwrap_err();
        match err {
            PpmiError::NameResolution { identifier, reason } => {
                assert_eq!(identifier, "Demographics_20Jan2024.csv");
                assert!(reason.contains("Demographics.csv"));
                assert!(reason.contains("Demographics__Archived_.csv"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_matching_loads_as_channel_mapping() {
        let reconciler = Reconciler::new(default_measures(), Logger::silent());
        let real = strings(&["Demographics_20Jan2024.csv", "Vital_Signs_20Jan2024.csv"]);
        let matching = reconciler
            .find_matching(&real, &strings(&["Demographics.csv", "Vital_Signs.csv"]))
            .unwrap();

        let mapping = crate::mapping::ChannelMapping::from_map(matching).unwrap();
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_measures_are_normalized() {
        let pairs = [
            ("Demographics.csv", "Demographics_20Jan2024.csv"),
            ("", "abc"),
            ("", ""),
            ("same", "same"),
        ];
        for measure in default_measures() {
            for (a, b) in pairs {
                let s = measure.normalized_similarity(a, b);
                assert!(
                    (0.0..=1.0).contains(&s),
                    "{} gave {} for {:?}/{:?}",
                    measure.name(),
                    s,
                    a,
                    b
                );
            }
            assert_eq!(measure.normalized_similarity("same", "same"), 1.0, "{}", measure.name());
        }
    }

    #[test]
    fn test_token_measures() {
        // {a, b} vs {a, c}: one shared out of three distinct
        assert!((TokenMeasure::Jaccard.normalized_similarity("ab", "ac") - 1.0 / 3.0).abs() < 1e-9);
        assert!((TokenMeasure::SorensenDice.normalized_similarity("ab", "ac") - 0.5).abs() < 1e-9);
        assert_eq!(TokenMeasure::Overlap.normalized_similarity("ab", "abcd"), 1.0);
    }

    #[test]
    fn test_default_measures_pick_close_name() {
        let reconciler = Reconciler::new(default_measures(), Logger::silent());
        let real = strings(&[
            "Vital_Signs_20Jan2024.csv",
            "Demographics_20Jan2024.csv",
            "Primary_Clinical_Diagnosis_20Jan2024.csv",
        ]);
        let mapping = reconciler
            .find_matching(&real, &strings(&["Demographics.csv", "Vital_Signs.csv"]))
            .unwrap();
        assert_eq!(mapping["Demographics.csv"], "Demographics_20Jan2024.csv");
        assert_eq!(mapping["Vital_Signs.csv"], "Vital_Signs_20Jan2024.csv");
    }
}
