//! Evidence and grounding verdict types
//!
//! `Evidence` is the persisted `{input_file, line_start, line_end, quote}`
//! record carried by use cases and policies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A claimed verbatim quote plus the 1-based line range it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Identifier of the source document (path or file name)
    #[serde(default)]
    pub input_file: String,
    /// First line of the quoted range (1-based, inclusive)
    pub line_start: usize,
    /// Last line of the quoted range (1-based, inclusive)
    pub line_end: usize,
    /// Text claimed to equal the raw lines of the range
    pub quote: String,
}

impl Evidence {
    pub fn new(
        input_file: impl Into<String>,
        line_start: usize,
        line_end: usize,
        quote: impl Into<String>,
    ) -> Self {
        Self {
            input_file: input_file.into(),
            line_start,
            line_end,
            quote: quote.into(),
        }
    }

    /// Number of lines covered by the claim (0 for an inverted range)
    pub fn line_count(&self) -> usize {
        if self.line_end < self.line_start {
            0
        } else {
            self.line_end - self.line_start + 1
        }
    }

    /// Short `file:start-end` location for log lines and reports
    pub fn location(&self) -> String {
        if self.line_start == self.line_end {
            format!("{}:{}", self.input_file, self.line_start)
        } else {
            format!("{}:{}-{}", self.input_file, self.line_start, self.line_end)
        }
    }
}

/// Outcome of checking one evidence entry against the document model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GroundingVerdict {
    /// Quote equals the raw range byte-for-byte
    Exact,
    /// Quote equals the range after whitespace normalization
    Normalized,
    /// Quote is close enough to the range under the configured metric
    Fuzzy { similarity: f64 },
    /// Quote could not be tied to the claimed range
    Ungrounded { reason: UngroundedReason },
}

impl GroundingVerdict {
    pub fn is_grounded(&self) -> bool {
        !matches!(self, GroundingVerdict::Ungrounded { .. })
    }

    /// Confidence in [0, 1]: 1.0 for exact and normalized matches
    pub fn confidence(&self) -> f64 {
        match self {
            GroundingVerdict::Exact | GroundingVerdict::Normalized => 1.0,
            GroundingVerdict::Fuzzy { similarity } => *similarity,
            GroundingVerdict::Ungrounded { reason } => match reason {
                UngroundedReason::BelowThreshold { similarity, .. } => *similarity,
                _ => 0.0,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroundingVerdict::Exact => "exact",
            GroundingVerdict::Normalized => "normalized",
            GroundingVerdict::Fuzzy { .. } => "fuzzy",
            GroundingVerdict::Ungrounded { .. } => "ungrounded",
        }
    }
}

impl fmt::Display for GroundingVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroundingVerdict::Fuzzy { similarity } => write!(f, "fuzzy ({:.3})", similarity),
            GroundingVerdict::Ungrounded { reason } => write!(f, "ungrounded: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Why an evidence entry was judged ungrounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UngroundedReason {
    /// Range is inverted, starts at 0, or runs past the end of the document
    InvalidRange {
        line_start: usize,
        line_end: usize,
        line_count: usize,
    },
    /// Quote is empty or whitespace only
    EmptyQuote,
    /// Evidence names a different input file
    ForeignSource { input_file: String },
    /// Best similarity fell short of the fuzzy threshold
    BelowThreshold { similarity: f64, threshold: f64 },
}

impl fmt::Display for UngroundedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UngroundedReason::InvalidRange {
                line_start,
                line_end,
                line_count,
            } => write!(
                f,
                "line range {}-{} is invalid for a document of {} lines",
                line_start, line_end, line_count
            ),
            UngroundedReason::EmptyQuote => f.write_str("quote is empty"),
            UngroundedReason::ForeignSource { input_file } => {
                write!(f, "evidence refers to another input file '{}'", input_file)
            }
            UngroundedReason::BelowThreshold {
                similarity,
                threshold,
            } => write!(
                f,
                "quote does not match the claimed lines (similarity {:.3} < {:.2})",
                similarity, threshold
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_serialization_field_names() {
        let evidence = Evidence::new("policy.md", 3, 4, "Escalate if the customer complains.");
        let json = serde_json::to_value(&evidence).unwrap();

        assert_eq!(json["input_file"], "policy.md");
        assert_eq!(json["line_start"], 3);
        assert_eq!(json["line_end"], 4);
        assert_eq!(json["quote"], "Escalate if the customer complains.");
    }

    #[test]
    fn test_evidence_missing_input_file_defaults_empty() {
        let evidence: Evidence =
            serde_json::from_str(r#"{"line_start": 1, "line_end": 1, "quote": "x"}"#).unwrap();
        assert!(evidence.input_file.is_empty());
    }

    #[test]
    fn test_line_count_and_location() {
        let single = Evidence::new("doc.md", 2, 2, "a");
        assert_eq!(single.line_count(), 1);
        assert_eq!(single.location(), "doc.md:2");

        let inverted = Evidence::new("doc.md", 5, 2, "a");
        assert_eq!(inverted.line_count(), 0);
        assert_eq!(inverted.location(), "doc.md:5-2");
    }

    #[test]
    fn test_verdict_confidence() {
        assert_eq!(GroundingVerdict::Exact.confidence(), 1.0);
        assert_eq!(GroundingVerdict::Normalized.confidence(), 1.0);
        assert_eq!(GroundingVerdict::Fuzzy { similarity: 0.93 }.confidence(), 0.93);
        assert_eq!(
            GroundingVerdict::Ungrounded {
                reason: UngroundedReason::EmptyQuote
            }
            .confidence(),
            0.0
        );
    }

    #[test]
    fn test_verdict_serialization_is_tagged() {
        let verdict = GroundingVerdict::Fuzzy { similarity: 0.95 };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["verdict"], "fuzzy");

        let parsed: GroundingVerdict = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, verdict);
    }
}
