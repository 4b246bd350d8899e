//! Quote matching for evidence grounding
//!
//! Checks run in strict priority order and stop at the first success:
//!
//! 1. **Exact**: quote equals the raw line range byte-for-byte
//! 2. **Normalized**: equal after whitespace collapse
//! 3. **Fuzzy**: similarity of the normalized forms reaches the threshold
//!
//! Fuzzy matching only absorbs whitespace and punctuation drift. The default
//! threshold is high on purpose and the metric is configurable.

use serde::{Deserialize, Serialize};

use super::document::{normalized, DocumentModel};
use super::types::{Evidence, GroundingVerdict, UngroundedReason};

/// String similarity metric used by the fuzzy fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// `1 - indel_distance / (len_a + len_b)` (insertions and deletions only)
    #[default]
    Indel,
    /// `1 - levenshtein_distance / max(len_a, len_b)`
    Levenshtein,
}

impl SimilarityMetric {
    /// Similarity in [0, 1] over Unicode scalar values
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();

        match self {
            SimilarityMetric::Indel => {
                let total = a.len() + b.len();
                if total == 0 {
                    return 1.0;
                }
                1.0 - indel_distance(&a, &b) as f64 / total as f64
            }
            SimilarityMetric::Levenshtein => {
                let max_len = a.len().max(b.len());
                if max_len == 0 {
                    return 1.0;
                }
                1.0 - levenshtein_distance(&a, &b) as f64 / max_len as f64
            }
        }
    }
}

/// Grounds evidence claims against a document model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteMatcher {
    /// Minimum similarity for a fuzzy match (default: 0.90)
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    /// Metric used by the fuzzy fallback
    #[serde(default)]
    pub metric: SimilarityMetric,
}

fn default_fuzzy_threshold() -> f64 {
    0.90
}

impl Default for QuoteMatcher {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
            metric: SimilarityMetric::default(),
        }
    }
}

impl QuoteMatcher {
    pub fn new(fuzzy_threshold: f64, metric: SimilarityMetric) -> Self {
        Self {
            fuzzy_threshold,
            metric,
        }
    }

    /// Decide whether `evidence` is grounded in `document`
    pub fn verify(&self, evidence: &Evidence, document: &DocumentModel) -> GroundingVerdict {
        if !document.is_source(&evidence.input_file) {
            return ungrounded(UngroundedReason::ForeignSource {
                input_file: evidence.input_file.clone(),
            });
        }

        let source_text = match document.line_range_text(evidence.line_start, evidence.line_end) {
            Ok(text) => text,
            Err(_) => {
                return ungrounded(UngroundedReason::InvalidRange {
                    line_start: evidence.line_start,
                    line_end: evidence.line_end,
                    line_count: document.len(),
                })
            }
        };

        if evidence.quote.trim().is_empty() {
            return ungrounded(UngroundedReason::EmptyQuote);
        }

        if evidence.quote == source_text {
            return GroundingVerdict::Exact;
        }

        let quote_norm = normalized(&evidence.quote);
        let source_norm = normalized(&source_text);
        if quote_norm == source_norm {
            return GroundingVerdict::Normalized;
        }

        let similarity = self.metric.similarity(&quote_norm, &source_norm);
        if similarity >= self.fuzzy_threshold {
            GroundingVerdict::Fuzzy { similarity }
        } else {
            ungrounded(UngroundedReason::BelowThreshold {
                similarity,
                threshold: self.fuzzy_threshold,
            })
        }
    }
}

fn ungrounded(reason: UngroundedReason) -> GroundingVerdict {
    GroundingVerdict::Ungrounded { reason }
}

/// Find every line range whose normalized text equals the normalized quote
///
/// Used to tell a caller where a mis-addressed quote actually lives.
pub fn locate(document: &DocumentModel, quote: &str) -> Vec<(usize, usize)> {
    let target = normalized(quote);
    if target.is_empty() {
        return Vec::new();
    }

    let lines = document.lines();
    let mut found = Vec::new();

    for (start_idx, start_line) in lines.iter().enumerate() {
        if start_line.normalized.is_empty() || !target.starts_with(&start_line.normalized) {
            continue;
        }

        let mut acc = String::new();
        for line in &lines[start_idx..] {
            if !line.normalized.is_empty() {
                if !acc.is_empty() {
                    acc.push(' ');
                }
                acc.push_str(&line.normalized);
            }
            if acc.len() > target.len() || !target.starts_with(acc.as_str()) {
                break;
            }
            if acc == target {
                found.push((start_line.number, line.number));
                break;
            }
        }
    }

    found
}

/// Levenshtein edit distance (two-row dynamic programming)
pub fn levenshtein_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Insertion/deletion distance: `len_a + len_b - 2 * lcs(a, b)`
pub fn indel_distance(a: &[char], b: &[char]) -> usize {
    a.len() + b.len() - 2 * longest_common_subsequence(a, b)
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentModel {
        DocumentModel::build(
            "rules.md",
            "Operators must not use capital letters.\nEscalate if the customer complains.\nKeep the Russian medical term unchanged.",
        )
    }

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein_distance(&chars(""), &chars("abc")), 3);
        assert_eq!(levenshtein_distance(&chars("same"), &chars("same")), 0);
    }

    #[test]
    fn test_indel_distance() {
        // substitution costs two under indel
        assert_eq!(indel_distance(&chars("abc"), &chars("abd")), 2);
        assert_eq!(indel_distance(&chars("abc"), &chars("abc")), 0);
        assert_eq!(indel_distance(&chars(""), &chars("ab")), 2);
    }

    #[test]
    fn test_similarity_metrics() {
        let indel = SimilarityMetric::Indel.similarity("abcd", "abce");
        assert!((indel - 0.75).abs() < 1e-9);

        let lev = SimilarityMetric::Levenshtein.similarity("abcd", "abce");
        assert!((lev - 0.75).abs() < 1e-9);

        assert_eq!(SimilarityMetric::Indel.similarity("", ""), 1.0);
    }

    #[test]
    fn test_exact_match() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new("rules.md", 1, 1, "Operators must not use capital letters.");
        assert_eq!(matcher.verify(&evidence, &doc()), GroundingVerdict::Exact);
    }

    #[test]
    fn test_multi_line_exact_match_uses_separator() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new(
            "rules.md",
            1,
            2,
            "Operators must not use capital letters.\nEscalate if the customer complains.",
        );
        assert_eq!(matcher.verify(&evidence, &doc()), GroundingVerdict::Exact);
    }

    #[test]
    fn test_normalized_match_not_exact() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new("rules.md", 1, 1, "Operators  must not use capital letters.");
        assert_eq!(matcher.verify(&evidence, &doc()), GroundingVerdict::Normalized);
    }

    #[test]
    fn test_fuzzy_match_absorbs_punctuation_drift() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new("rules.md", 2, 2, "Escalate if the customer complains");
        match matcher.verify(&evidence, &doc()) {
            GroundingVerdict::Fuzzy { similarity } => assert!(similarity >= 0.90),
            other => panic!("Expected fuzzy, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_line_is_ungrounded() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new("rules.md", 2, 2, "Operators must not use capital letters.");
        let verdict = matcher.verify(&evidence, &doc());
        assert!(matches!(
            verdict,
            GroundingVerdict::Ungrounded {
                reason: UngroundedReason::BelowThreshold { .. }
            }
        ));
    }

    #[test]
    fn test_paraphrase_is_ungrounded() {
        let matcher = QuoteMatcher::default();
        let evidence = Evidence::new("rules.md", 1, 1, "Operators should write in lowercase.");
        assert!(!matcher.verify(&evidence, &doc()).is_grounded());
    }

    #[test]
    fn test_invalid_ranges() {
        let matcher = QuoteMatcher::default();
        let d = doc();

        for (start, end) in [(0, 1), (2, 1), (3, 4), (4, 4)] {
            let evidence = Evidence::new("rules.md", start, end, "x");
            assert!(
                matches!(
                    matcher.verify(&evidence, &d),
                    GroundingVerdict::Ungrounded {
                        reason: UngroundedReason::InvalidRange { .. }
                    }
                ),
                "range {}-{} should be invalid",
                start,
                end
            );
        }
    }

    #[test]
    fn test_empty_quote_and_foreign_source() {
        let matcher = QuoteMatcher::default();
        let d = doc();

        let empty = Evidence::new("rules.md", 1, 1, "   ");
        assert!(matches!(
            matcher.verify(&empty, &d),
            GroundingVerdict::Ungrounded {
                reason: UngroundedReason::EmptyQuote
            }
        ));

        let foreign = Evidence::new("other.md", 1, 1, "Operators must not use capital letters.");
        assert!(matches!(
            matcher.verify(&foreign, &d),
            GroundingVerdict::Ungrounded {
                reason: UngroundedReason::ForeignSource { .. }
            }
        ));
    }

    #[test]
    fn test_threshold_is_configurable() {
        let strict = QuoteMatcher::new(0.999, SimilarityMetric::Levenshtein);
        let evidence = Evidence::new("rules.md", 2, 2, "Escalate if the customer complains");
        assert!(!strict.verify(&evidence, &doc()).is_grounded());
    }

    #[test]
    fn test_locate_finds_single_and_multi_line_ranges() {
        let d = doc();
        assert_eq!(locate(&d, "Escalate if the customer complains."), vec![(2, 2)]);
        assert_eq!(
            locate(
                &d,
                "Escalate if the  customer complains.\nKeep the Russian medical term unchanged."
            ),
            vec![(2, 3)]
        );
        assert!(locate(&d, "not in the document").is_empty());
        assert!(locate(&d, "").is_empty());
    }
}
