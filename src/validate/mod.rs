//! Referential-integrity and grounding validation.
//!
//! The validator reads a four-tier artifact set (usually loaded back from an
//! output directory) and reports every defect it finds instead of stopping at
//! the first. It never modifies artifacts, and running it twice over the same
//! inputs yields the same report.
//!
//! Blocking checks:
//! - identifiers are unique within each tier and carry the tier prefix
//! - every reference resolves, and an example's use case matches its test case's
//! - every evidence entry of a use case or policy is grounded in the source
//! - coverage thresholds hold
//! - records have the documented shape for their format
//!
//! Quality findings (duplicate inputs, placeholder outputs, missing source
//! tags) are warnings and never fail a run.

pub mod report;

pub use report::{Check, Finding, Report, Severity};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::{find_duplicates, CoverageThresholds, LoadProblem, LoadedArtifacts};
use crate::domain::{ArtifactSet, DatasetExample, ExampleFormat, RunManifest, Tier};
use crate::evidence::{locate, normalized, DocumentModel, Evidence, GroundingVerdict, QuoteMatcher};
use crate::stages::examples::{MIN_EVALUATION_CRITERIA, SOURCE_TAGS};
use crate::stages::test_cases::{MAX_AXES, MIN_AXES};

/// Expected outputs that are obviously unfinished
const PLACEHOLDER_MARKERS: [&str; 4] = ["todo", "tbd", "placeholder", "xxx"];

/// Expected outputs shorter than this (in characters) are flagged
const MIN_OUTPUT_CHARS: usize = 10;

/// Settings for the validator (the `validation` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Treat weak fuzzy grounding as an error
    #[serde(default)]
    pub strict: bool,

    /// Fuzzy matches below this similarity are flagged (default: 0.97)
    #[serde(default = "default_strict_fuzzy_threshold")]
    pub strict_fuzzy_threshold: f64,
}

fn default_strict_fuzzy_threshold() -> f64 {
    0.97
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            strict: false,
            strict_fuzzy_threshold: default_strict_fuzzy_threshold(),
        }
    }
}

/// Artifact set plus whatever could not be loaded
pub struct ValidationInput<'a> {
    pub set: &'a ArtifactSet,
    pub unavailable: &'a BTreeSet<Tier>,
    pub problems: &'a [LoadProblem],
    /// Source document the evidence is checked against
    pub document: Option<&'a DocumentModel>,
    /// Manifest of the run that produced the set
    pub manifest: Option<&'a RunManifest>,
}

impl<'a> ValidationInput<'a> {
    /// A set held in memory with nothing missing
    pub fn in_memory(set: &'a ArtifactSet, document: Option<&'a DocumentModel>) -> Self {
        static NONE: BTreeSet<Tier> = BTreeSet::new();
        Self {
            set,
            unavailable: &NONE,
            problems: &[],
            document,
            manifest: None,
        }
    }

    /// A set read back from an output directory
    pub fn loaded(
        loaded: &'a LoadedArtifacts,
        document: Option<&'a DocumentModel>,
        manifest: Option<&'a RunManifest>,
    ) -> Self {
        Self {
            set: &loaded.set,
            unavailable: &loaded.unavailable,
            problems: &loaded.problems,
            document,
            manifest,
        }
    }
}

/// Checks an artifact set against the integrity rules
#[derive(Debug, Clone)]
pub struct Validator {
    settings: ValidationSettings,
    thresholds: CoverageThresholds,
    matcher: QuoteMatcher,
}

impl Validator {
    pub fn new(settings: ValidationSettings, thresholds: CoverageThresholds, matcher: QuoteMatcher) -> Self {
        Self {
            settings,
            thresholds,
            matcher,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.settings.strict
    }

    /// Validate an in-memory set
    pub fn validate_set(&self, set: &ArtifactSet, document: Option<&DocumentModel>) -> Report {
        self.validate(&ValidationInput::in_memory(set, document))
    }

    /// Run every check and assemble the report
    pub fn validate(&self, input: &ValidationInput<'_>) -> Report {
        let mut run = Run {
            settings: &self.settings,
            findings: Vec::new(),
            grounding: BTreeMap::new(),
        };

        run.load_problems(input.problems);
        run.source_document(input);
        run.identifiers(input.set);
        run.references(input);
        if let Some(document) = input.document {
            run.grounding(input.set, document, &self.matcher);
        }
        run.coverage(input, &self.thresholds);
        run.shapes(input.set);
        run.quality(input.set);

        run.finish(input.set, self.settings.strict)
    }
}

/// Mutable state of one validation pass
struct Run<'s> {
    settings: &'s ValidationSettings,
    findings: Vec<Finding>,
    grounding: BTreeMap<String, usize>,
}

impl Run<'_> {
    fn push(&mut self, severity: Severity, check: Check, id: impl Into<String>, field: Option<&str>, message: impl Into<String>) {
        self.findings.push(Finding {
            artifact_id: id.into(),
            check,
            severity,
            field: field.map(|f| f.to_string()),
            message: message.into(),
        });
    }

    fn error(&mut self, check: Check, id: impl Into<String>, field: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Error, check, id, field, message);
    }

    fn warning(&mut self, check: Check, id: impl Into<String>, field: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Warning, check, id, field, message);
    }

    fn load_problems(&mut self, problems: &[LoadProblem]) {
        for problem in problems {
            let id = match (&problem.artifact_id, problem.index) {
                (Some(id), _) => id.clone(),
                (None, Some(index)) => format!("{}[{}]", problem.tier.file_name(), index),
                (None, None) => problem.tier.file_name().to_string(),
            };
            self.error(Check::ShapeViolation, id, None, problem.message.clone());
        }
    }

    fn source_document(&mut self, input: &ValidationInput<'_>) {
        let Some(document) = input.document else {
            self.error(
                Check::SourceDocument,
                "source",
                None,
                "source document unavailable; evidence cannot be verified",
            );
            return;
        };

        if let Some(manifest) = input.manifest {
            if !manifest.input_sha256.is_empty() && manifest.input_sha256 != document.digest() {
                self.warning(
                    Check::SourceDocument,
                    document.file_name(),
                    None,
                    format!(
                        "source changed since generation (sha256 {} at run {}, now {})",
                        short_digest(&manifest.input_sha256),
                        manifest.run_id,
                        short_digest(document.digest())
                    ),
                );
            }
        }
    }

    fn identifiers(&mut self, set: &ArtifactSet) {
        for tier in Tier::ALL {
            let ids = set.ids(tier);
            for id in &ids {
                if id.is_empty() {
                    self.error(Check::ShapeViolation, tier.file_name(), Some("id"), "record has an empty id");
                } else if !id.starts_with(tier.prefix()) {
                    self.error(
                        Check::ShapeViolation,
                        *id,
                        Some("id"),
                        format!("{} id must start with '{}'", tier, tier.prefix()),
                    );
                }
            }
            for duplicate in find_duplicates(ids.iter().copied()) {
                let occurrences = ids.iter().filter(|id| **id == duplicate).count();
                self.error(
                    Check::DuplicateIdentifier,
                    duplicate,
                    Some("id"),
                    format!("identifier appears {} times in {}", occurrences, tier.file_name()),
                );
            }
        }
    }

    fn references(&mut self, input: &ValidationInput<'_>) {
        let set = input.set;
        let known = KnownIds::new(input);

        for tc in &set.test_cases {
            known.check(self, &tc.id, "use_case_id", &tc.use_case_id, Tier::UseCase);
            for (i, pol) in tc.policy_ids.iter().enumerate() {
                known.check(self, &tc.id, &format!("policy_ids[{}]", i), pol, Tier::Policy);
            }
        }

        let test_case_owner: HashMap<&str, &str> = set
            .test_cases
            .iter()
            .map(|tc| (tc.id.as_str(), tc.use_case_id.as_str()))
            .collect();

        for ex in &set.examples {
            known.check(self, &ex.id, "test_case_id", &ex.test_case_id, Tier::TestCase);
            known.check(self, &ex.id, "use_case_id", &ex.use_case_id, Tier::UseCase);
            for (i, pol) in ex.policy_ids.iter().enumerate() {
                known.check(self, &ex.id, &format!("policy_ids[{}]", i), pol, Tier::Policy);
            }

            if let Some(owner) = test_case_owner.get(ex.test_case_id.as_str()) {
                if *owner != ex.use_case_id {
                    self.error(
                        Check::DanglingReference,
                        &ex.id,
                        Some("use_case_id"),
                        format!(
                            "use case '{}' differs from '{}' of test case '{}'",
                            ex.use_case_id, owner, ex.test_case_id
                        ),
                    );
                }
            }
        }
    }

    fn grounding(&mut self, set: &ArtifactSet, document: &DocumentModel, matcher: &QuoteMatcher) {
        let grounded = set
            .use_cases
            .iter()
            .map(|uc| (uc.id.as_str(), uc.evidence.as_slice()))
            .chain(set.policies.iter().map(|p| (p.id.as_str(), p.evidence.as_slice())));

        for (id, evidence) in grounded {
            if evidence.is_empty() {
                self.error(Check::Ungrounded, id, Some("evidence"), "no evidence entries");
                continue;
            }
            for (i, entry) in evidence.iter().enumerate() {
                self.check_evidence(id, i, entry, document, matcher);
            }
        }
    }

    fn check_evidence(&mut self, id: &str, index: usize, entry: &Evidence, document: &DocumentModel, matcher: &QuoteMatcher) {
        let field = format!("evidence[{}]", index);
        let verdict = matcher.verify(entry, document);
        *self.grounding.entry(verdict.as_str().to_string()).or_default() += 1;

        match verdict {
            GroundingVerdict::Ungrounded { reason } => {
                let mut message = format!("{}: {}", entry.location(), reason);
                if let Some((start, end)) = locate(document, &entry.quote).first() {
                    if start == end {
                        message.push_str(&format!(" (quote found at line {})", start));
                    } else {
                        message.push_str(&format!(" (quote found at lines {}-{})", start, end));
                    }
                }
                self.error(Check::Ungrounded, id, Some(field.as_str()), message);
            }
            GroundingVerdict::Fuzzy { similarity } if similarity < self.settings.strict_fuzzy_threshold => {
                let message = format!(
                    "{}: weak fuzzy match {:.3} below {:.2}",
                    entry.location(),
                    similarity,
                    self.settings.strict_fuzzy_threshold
                );
                if self.settings.strict {
                    self.error(Check::Ungrounded, id, Some(field.as_str()), message);
                } else {
                    self.warning(Check::Ungrounded, id, Some(field.as_str()), message);
                }
            }
            _ => {}
        }
    }

    fn coverage(&mut self, input: &ValidationInput<'_>, thresholds: &CoverageThresholds) {
        let set = input.set;
        let available = |tier: Tier| !input.unavailable.contains(&tier);

        let tier_minimum = |run: &mut Self, tier: Tier, wanted: usize| {
            let count = set.count(tier);
            if available(tier) && count < wanted {
                run.error(
                    Check::CoverageShortfall,
                    tier.file_name(),
                    None,
                    format!("{} {} records, at least {} required", count, tier, wanted),
                );
            }
        };
        tier_minimum(self, Tier::UseCase, thresholds.min_use_cases);
        tier_minimum(self, Tier::Policy, thresholds.min_policies);

        if available(Tier::Policy) {
            let known: Vec<String> = set
                .policy_types()
                .into_iter()
                .filter(|t| t.is_known())
                .map(|t| t.to_string())
                .collect();
            if known.len() < thresholds.min_policy_types {
                self.error(
                    Check::CoverageShortfall,
                    Tier::Policy.file_name(),
                    Some("type"),
                    format!(
                        "{} distinct policy types [{}], at least {} required",
                        known.len(),
                        known.join(", "),
                        thresholds.min_policy_types
                    ),
                );
            }
        }

        if available(Tier::UseCase) && available(Tier::TestCase) {
            let mut per_use_case: BTreeMap<&str, usize> = BTreeMap::new();
            for tc in &set.test_cases {
                *per_use_case.entry(tc.use_case_id.as_str()).or_default() += 1;
            }
            let wanted = thresholds.min_test_cases_per_use_case.max(1);
            for uc in &set.use_cases {
                let count = per_use_case.get(uc.id.as_str()).copied().unwrap_or(0);
                if count < wanted {
                    self.error(
                        Check::CoverageShortfall,
                        &uc.id,
                        None,
                        format!("{} test cases, at least {} required", count, wanted),
                    );
                }
            }
        }

        if available(Tier::TestCase) && available(Tier::Example) {
            let mut per_test_case: BTreeMap<&str, usize> = BTreeMap::new();
            for ex in &set.examples {
                *per_test_case.entry(ex.test_case_id.as_str()).or_default() += 1;
            }
            let wanted = thresholds.min_examples_per_test_case.max(1);
            for tc in &set.test_cases {
                let count = per_test_case.get(tc.id.as_str()).copied().unwrap_or(0);
                if count < wanted {
                    self.error(
                        Check::CoverageShortfall,
                        &tc.id,
                        None,
                        format!("{} examples, at least {} required", count, wanted),
                    );
                }
            }
        }
    }

    fn shapes(&mut self, set: &ArtifactSet) {
        for uc in &set.use_cases {
            if uc.name.trim().is_empty() {
                self.error(Check::ShapeViolation, &uc.id, Some("name"), "name is empty");
            }
        }

        for pol in &set.policies {
            if pol.name.trim().is_empty() {
                self.error(Check::ShapeViolation, &pol.id, Some("name"), "name is empty");
            }
            if !pol.policy_type.is_known() {
                self.error(
                    Check::ShapeViolation,
                    &pol.id,
                    Some("type"),
                    format!("unknown policy type '{}'", pol.policy_type),
                );
            }
        }

        for tc in &set.test_cases {
            let axes = &tc.parameter_variation_axes;
            if !(MIN_AXES..=MAX_AXES).contains(&axes.len()) {
                self.error(
                    Check::ShapeViolation,
                    &tc.id,
                    Some("parameter_variation_axes"),
                    format!("{} axes, expected {} to {}", axes.len(), MIN_AXES, MAX_AXES),
                );
            }
            let mut names = BTreeSet::new();
            for (i, axis) in axes.iter().enumerate() {
                let field = format!("parameter_variation_axes[{}]", i);
                if axis.name.trim().is_empty() {
                    self.error(Check::ShapeViolation, &tc.id, Some(field.as_str()), "axis name is empty");
                } else if !names.insert(axis.name.trim().to_lowercase()) {
                    self.error(
                        Check::ShapeViolation,
                        &tc.id,
                        Some(field.as_str()),
                        format!("axis '{}' appears more than once", axis.name),
                    );
                }
                let distinct: BTreeSet<&str> = axis
                    .values
                    .iter()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .collect();
                if distinct.len() < 2 {
                    self.error(
                        Check::ShapeViolation,
                        &tc.id,
                        Some(field.as_str()),
                        format!("axis '{}' needs at least 2 distinct values", axis.name),
                    );
                }
            }
        }

        for ex in &set.examples {
            self.example_shape(ex);
        }
    }

    fn example_shape(&mut self, ex: &DatasetExample) {
        let id = ex.id.as_str();

        if ex.case.trim().is_empty() {
            self.error(Check::ShapeViolation, id, Some("case"), "case is empty");
        }

        for (i, message) in ex.input.messages.iter().enumerate() {
            let field = format!("input.messages[{}]", i);
            if !message.role.is_known() {
                self.error(
                    Check::ShapeViolation,
                    id,
                    Some(field.as_str()),
                    format!("unknown role '{}'", message.role),
                );
            }
            if message.content.trim().is_empty() {
                self.error(Check::ShapeViolation, id, Some(field.as_str()), "message content is empty");
            }
        }

        for violation in ex.input.format_violations(&ex.format) {
            let field = if matches!(ex.format, ExampleFormat::Unknown(_)) {
                "format"
            } else {
                "input"
            };
            self.error(Check::ShapeViolation, id, Some(field), violation);
        }

        if ex.expected_output.trim().is_empty() {
            self.error(Check::ShapeViolation, id, Some("expected_output"), "expected output is empty");
        }

        let criteria = ex
            .evaluation_criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .count();
        if criteria < MIN_EVALUATION_CRITERIA {
            self.error(
                Check::ShapeViolation,
                id,
                Some("evaluation_criteria"),
                format!("{} evaluation criteria, at least {} required", criteria, MIN_EVALUATION_CRITERIA),
            );
        }

        if ex.policy_ids.is_empty() {
            self.error(Check::ShapeViolation, id, Some("policy_ids"), "example references no policies");
        }
    }

    fn quality(&mut self, set: &ArtifactSet) {
        let mut first_inputs: BTreeMap<String, &str> = BTreeMap::new();

        for ex in &set.examples {
            if let Some(first) = ex.input.messages.first() {
                let key = normalized(&first.content).to_lowercase();
                if !key.is_empty() {
                    match first_inputs.get(key.as_str()) {
                        Some(original) => {
                            let message = format!("first message duplicates {}", original);
                            self.warning(Check::Quality, &ex.id, Some("input.messages[0]"), message);
                        }
                        None => {
                            first_inputs.insert(key, ex.id.as_str());
                        }
                    }
                }
            }

            if is_placeholder(&ex.expected_output) {
                self.warning(
                    Check::Quality,
                    &ex.id,
                    Some("expected_output"),
                    format!("expected output looks like a placeholder ('{}')", ex.expected_output.trim()),
                );
            }

            match ex.source_tag() {
                Some(tag) if SOURCE_TAGS.contains(&tag) => {}
                Some(tag) => {
                    self.warning(Check::Quality, &ex.id, Some("metadata.source"), format!("unknown source tag '{}'", tag))
                }
                None => self.warning(Check::Quality, &ex.id, Some("metadata.source"), "missing source tag"),
            }
        }
    }

    fn finish(mut self, set: &ArtifactSet, strict: bool) -> Report {
        self.findings.sort_by(|a, b| {
            (a.check, &a.artifact_id, &a.field, &a.message).cmp(&(b.check, &b.artifact_id, &b.field, &b.message))
        });
        self.findings.dedup();

        let (errors, warnings): (Vec<Finding>, Vec<Finding>) = self
            .findings
            .into_iter()
            .partition(|f| f.severity == Severity::Error);

        let formats: BTreeSet<String> = set.examples.iter().map(|e| e.format.to_string()).collect();

        Report {
            pass: errors.is_empty(),
            strict,
            errors,
            warnings,
            counts: set.counts(),
            grounding: self.grounding,
            policy_types: set.policy_types().iter().map(|t| t.to_string()).collect(),
            formats: formats.into_iter().collect(),
        }
    }
}

/// Identifiers each reference may point to
///
/// Records that failed to parse still count as existing, so a single
/// malformed record does not cascade into dangling-reference errors.
struct KnownIds<'a> {
    ids: BTreeMap<Tier, BTreeSet<&'a str>>,
    unavailable: &'a BTreeSet<Tier>,
}

impl<'a> KnownIds<'a> {
    fn new(input: &ValidationInput<'a>) -> Self {
        let mut ids: BTreeMap<Tier, BTreeSet<&'a str>> = BTreeMap::new();
        for tier in Tier::ALL {
            ids.insert(tier, input.set.ids(tier).into_iter().collect());
        }
        for problem in input.problems {
            if let Some(id) = &problem.artifact_id {
                ids.entry(problem.tier).or_default().insert(id.as_str());
            }
        }
        Self {
            ids,
            unavailable: input.unavailable,
        }
    }

    fn check(&self, run: &mut Run<'_>, owner: &str, field: &str, target: &str, tier: Tier) {
        if self.unavailable.contains(&tier) {
            return;
        }
        let exists = self.ids.get(&tier).map(|ids| ids.contains(target)).unwrap_or(false);
        if !exists {
            run.error(
                Check::DanglingReference,
                owner,
                Some(field),
                format!("references unknown {} '{}'", tier, target),
            );
        }
    }
}

fn is_placeholder(output: &str) -> bool {
    let output = output.trim();
    if output.is_empty() {
        // reported as a shape violation
        return false;
    }
    let lower = output.to_lowercase();
    output.chars().count() < MIN_OUTPUT_CHARS
        || lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| PLACEHOLDER_MARKERS.contains(&word))
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
