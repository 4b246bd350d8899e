//! Validation report types and rendering.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a finding blocks the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// The invariant a finding is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    DuplicateIdentifier,
    DanglingReference,
    Ungrounded,
    CoverageShortfall,
    ShapeViolation,
    SourceDocument,
    Quality,
}

impl Check {
    pub fn as_str(&self) -> &'static str {
        match self {
            Check::DuplicateIdentifier => "duplicate_identifier",
            Check::DanglingReference => "dangling_reference",
            Check::Ungrounded => "ungrounded",
            Check::CoverageShortfall => "coverage_shortfall",
            Check::ShapeViolation => "shape_violation",
            Check::SourceDocument => "source_document",
            Check::Quality => "quality",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One located defect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Offending artifact, or a tier/file name for set-level findings
    pub artifact_id: String,
    pub check: Check,
    pub severity: Severity,
    /// Offending field, when one can be named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.artifact_id)?;
        if let Some(field) = &self.field {
            write!(f, ".{}", field)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Result of one validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub pass: bool,
    pub strict: bool,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    /// Records per tier
    pub counts: BTreeMap<String, usize>,
    /// Evidence entries per grounding verdict
    pub grounding: BTreeMap<String, usize>,
    pub policy_types: Vec<String>,
    pub formats: Vec<String>,
}

impl Report {
    /// Findings for one check, errors first
    pub fn findings(&self, check: Check) -> impl Iterator<Item = &Finding> {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .filter(move |f| f.check == check)
    }

    pub fn has_error(&self, check: Check) -> bool {
        self.errors.iter().any(|f| f.check == check)
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Validation {} ({} mode)\n",
            if self.pass { "PASSED" } else { "FAILED" },
            if self.strict { "strict" } else { "lenient" }
        ));

        out.push_str("\nCounts:\n");
        for (tier, count) in &self.counts {
            out.push_str(&format!("  {:<10} {}\n", tier, count));
        }

        if !self.grounding.is_empty() {
            let tallies: Vec<String> = self
                .grounding
                .iter()
                .map(|(verdict, n)| format!("{} {}", n, verdict))
                .collect();
            out.push_str(&format!("Evidence:  {}\n", tallies.join(", ")));
        }
        if !self.policy_types.is_empty() {
            out.push_str(&format!("Policy types: {}\n", self.policy_types.join(", ")));
        }
        if !self.formats.is_empty() {
            out.push_str(&format!("Formats: {}\n", self.formats.join(", ")));
        }

        if !self.errors.is_empty() {
            out.push_str(&format!("\nErrors ({}):\n", self.errors.len()));
            for finding in &self.errors {
                out.push_str(&format!("  {}\n", finding));
            }
        }
        if !self.warnings.is_empty() {
            out.push_str(&format!("\nWarnings ({}):\n", self.warnings.len()));
            for finding in &self.warnings {
                out.push_str(&format!("  {}\n", finding));
            }
        }

        out
    }
}
