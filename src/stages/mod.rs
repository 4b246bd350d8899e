//! Tier stages.
//!
//! Each stage asks the text producer for candidates, admits the ones that
//! survive grounding, reference resolution, and shape checks, and allocates
//! identifiers for them. Rejected candidates are logged and discarded, never
//! patched. A stage that cannot reach its coverage threshold within the
//! attempt budget fails with `StageError::CoverageShortfall`.

pub mod case;
pub mod examples;
pub mod policies;
pub mod test_cases;
pub mod use_cases;
pub mod variations;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::{generate_with_retry, ProducerError, ProducerSettings, Prompt, TextProducer};
use crate::core::{AllocError, EventLog, GenerationConfig, CallBudget, SafetyLimits, SafetyViolation};
use crate::domain::{Event, EventType, ProducerInfo, Tier};
use crate::evidence::{locate, normalized, DocumentModel, Evidence, GroundingVerdict, QuoteMatcher};

pub use case::{resolve_case, CaseSelection};
pub use variations::{axis_catalog, combinations, Combination};

/// Why a single candidate was not admitted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("evidence {index} at {location} is ungrounded: {verdict}{}", hint_suffix(.found_at))]
    Ungrounded {
        index: usize,
        location: String,
        verdict: GroundingVerdict,
        /// Where the quote actually occurs, if anywhere
        found_at: Option<(usize, usize)>,
    },

    #[error("{field} references unknown identifier '{id}'")]
    DanglingReference { field: String, id: String },

    #[error("{field}: {message}")]
    ShapeViolation { field: String, message: String },

    #[error("duplicate of an accepted candidate ({key})")]
    DuplicateCandidate { key: String },
}

fn hint_suffix(found_at: &Option<(usize, usize)>) -> String {
    match found_at {
        Some((start, end)) if start == end => format!(" (quote found at line {})", start),
        Some((start, end)) => format!(" (quote found at lines {}-{})", start, end),
        None => String::new(),
    }
}

impl Rejection {
    pub fn shape(field: impl Into<String>, message: impl Into<String>) -> Self {
        Rejection::ShapeViolation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn dangling(field: impl Into<String>, id: impl Into<String>) -> Self {
        Rejection::DanglingReference {
            field: field.into(),
            id: id.into(),
        }
    }

    /// Short class name used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::Ungrounded { .. } => "ungrounded",
            Rejection::DanglingReference { .. } => "dangling_reference",
            Rejection::ShapeViolation { .. } => "shape_violation",
            Rejection::DuplicateCandidate { .. } => "duplicate_candidate",
        }
    }
}

/// Errors that abort a stage, and with it the run
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{tier} coverage shortfall after {attempts} attempt(s): {detail} ({rejected} candidate(s) rejected)")]
    CoverageShortfall {
        tier: Tier,
        detail: String,
        attempts: u32,
        rejected: usize,
    },

    #[error("{tier} stage, attempt {attempt}: {source}")]
    Producer {
        tier: Tier,
        attempt: u32,
        #[source]
        source: ProducerError,
    },

    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error("{tier} stage stopped by safety limit: {source}")]
    Safety {
        tier: Tier,
        #[source]
        source: SafetyViolation,
    },
}

impl StageError {
    pub fn tier(&self) -> Option<Tier> {
        match self {
            StageError::CoverageShortfall { tier, .. }
            | StageError::Producer { tier, .. }
            | StageError::Safety { tier, .. } => Some(*tier),
            StageError::Allocation(_) => None,
        }
    }
}

/// A rejected candidate kept for diagnostics
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub attempt: u32,
    pub label: String,
    pub rejection: Rejection,
}

/// Bounded proposal attempts for one stage (or one upstream artifact)
#[derive(Debug)]
pub struct Attempts {
    tier: Tier,
    max: u32,
    current: u32,
    rejected: Vec<RejectedCandidate>,
}

impl Attempts {
    pub fn new(tier: Tier, max: u32) -> Self {
        Self {
            tier,
            max,
            current: 0,
            rejected: Vec::new(),
        }
    }

    /// Start the next attempt, or `None` once the budget is spent
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.current >= self.max {
            return None;
        }
        self.current += 1;
        Some(self.current)
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn is_retry(&self) -> bool {
        self.current > 1
    }

    /// Record a rejected candidate in the log and the diagnostics list
    pub fn reject(&mut self, events: &EventLog, label: impl Into<String>, rejection: Rejection) {
        let label = label.into();
        warn!(
            tier = %self.tier,
            attempt = self.current,
            candidate = %label,
            kind = rejection.kind(),
            reason = %rejection,
            "Candidate rejected"
        );
        events.record(
            Event::new(
                events.run_id(),
                Some(self.tier),
                EventType::CandidateRejected,
                format!("{}: {}", label, rejection.kind()),
            )
            .with_attempt(self.current)
            .with_error(rejection.to_string()),
        );
        self.rejected.push(RejectedCandidate {
            attempt: self.current,
            label,
            rejection,
        });
    }

    pub fn rejected(&self) -> &[RejectedCandidate] {
        &self.rejected
    }

    /// Rejections from the attempt in progress, rendered for a retry prompt
    pub fn feedback(&self, previous_attempt: u32) -> Vec<String> {
        self.rejected
            .iter()
            .filter(|r| r.attempt == previous_attempt)
            .map(|r| format!("{}: {}", r.label, r.rejection))
            .collect()
    }

    pub fn shortfall(&self, detail: impl Into<String>) -> StageError {
        StageError::CoverageShortfall {
            tier: self.tier,
            detail: detail.into(),
            attempts: self.current,
            rejected: self.rejected.len(),
        }
    }
}

/// Read-only state shared by every stage of a run
pub struct StageContext<'a> {
    pub document: &'a DocumentModel,
    pub producer: &'a dyn TextProducer,
    pub config: &'a GenerationConfig,
    pub limits: &'a SafetyLimits,
    pub matcher: &'a QuoteMatcher,
    pub events: &'a EventLog,
    budget: Mutex<CallBudget>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        document: &'a DocumentModel,
        producer: &'a dyn TextProducer,
        config: &'a GenerationConfig,
        limits: &'a SafetyLimits,
        matcher: &'a QuoteMatcher,
        events: &'a EventLog,
    ) -> Self {
        Self {
            document,
            producer,
            config,
            limits,
            matcher,
            events,
            budget: Mutex::new(CallBudget::new()),
        }
    }

    /// Producer settings for a proposal attempt; retries get a shifted seed
    pub fn settings(&self, attempt: u32) -> ProducerSettings {
        ProducerSettings {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            seed: Some(self.config.seed.wrapping_add(u64::from(attempt.saturating_sub(1)))),
            timeout: self.limits.producer_timeout(),
        }
    }

    pub fn producer_info(&self) -> ProducerInfo {
        self.producer.info(&self.settings(1))
    }

    /// Producer calls made so far in this run
    pub fn producer_calls(&self) -> u32 {
        self.budget.lock().map(|b| b.calls).unwrap_or(0)
    }

    fn check_limits(&self, tier: Tier) -> Result<(), StageError> {
        let budget = self
            .budget
            .lock()
            .map_err(|_| producer_fatal(tier, 0, "call budget lock poisoned"))?;
        self.limits
            .check_budget(&budget)
            .map_err(|source| StageError::Safety { tier, source })
    }

    /// One producer call under the run's limits and retry policy
    pub async fn call(&self, tier: Tier, prompt: &Prompt, attempt: u32) -> Result<Value, StageError> {
        self.check_limits(tier)?;

        let started = Instant::now();
        let settings = self.settings(attempt);
        let value = generate_with_retry(self.producer, prompt, &settings, &self.config.retry)
            .await
            .map_err(|source| StageError::Producer {
                tier,
                attempt,
                source,
            })?;

        let bytes = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        self.limits
            .check_payload(bytes)
            .map_err(|source| StageError::Safety { tier, source })?;

        if let Ok(mut budget) = self.budget.lock() {
            budget.record();
        }

        debug!(
            tier = %tier,
            task = %prompt.task,
            attempt,
            bytes,
            duration_ms = started.elapsed().as_millis() as u64,
            "Producer payload received"
        );
        Ok(value)
    }

    /// Ground every evidence entry of a candidate
    ///
    /// Entries without an `input_file` are attributed to the current document.
    /// The first ungrounded entry rejects the whole candidate.
    pub fn ground_all(&self, evidence: &mut [Evidence]) -> Result<(), Rejection> {
        if evidence.is_empty() {
            return Err(Rejection::shape("evidence", "at least one evidence entry is required"));
        }

        for (index, entry) in evidence.iter_mut().enumerate() {
            if entry.input_file.trim().is_empty() {
                entry.input_file = self.document.file_name().to_string();
            }

            let verdict = self.matcher.verify(entry, self.document);
            if !verdict.is_grounded() {
                return Err(Rejection::Ungrounded {
                    index,
                    location: entry.location(),
                    found_at: locate(self.document, &entry.quote).into_iter().next(),
                    verdict,
                });
            }
        }
        Ok(())
    }
}

fn producer_fatal(tier: Tier, attempt: u32, message: &str) -> StageError {
    StageError::Producer {
        tier,
        attempt,
        source: ProducerError::Fatal(message.to_string()),
    }
}

/// Pull the candidate list out of a payload shaped `{"<key>": [...]}`
///
/// A payload without the list cannot be turned into candidates at all and
/// is a fatal producer failure.
pub fn candidate_list(
    payload: Value,
    key: &str,
    tier: Tier,
    attempt: u32,
) -> Result<Vec<Value>, StageError> {
    match payload {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(producer_fatal(
                tier,
                attempt,
                &format!("payload has no '{}' list", key),
            )),
        },
        Value::Array(items) => Ok(items),
        _ => Err(producer_fatal(tier, attempt, "payload is not a JSON object")),
    }
}

/// Decode one candidate; a record that does not fit is a shape violation
pub fn parse_candidate<T: DeserializeOwned>(item: Value) -> Result<T, Rejection> {
    serde_json::from_value(item).map_err(|e| Rejection::shape("candidate", e.to_string()))
}

/// Label for a candidate in logs: its name if it has one, else its position
pub fn candidate_label(item: &Value, position: usize) -> String {
    item.get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("candidate #{}", position + 1))
}

/// Duplicate filter keyed on normalized, case-folded text
#[derive(Debug, Default)]
pub struct Dedupe {
    seen: BTreeSet<String>,
}

impl Dedupe {
    pub fn key(text: &str) -> String {
        normalized(text).to_lowercase()
    }

    /// Admit `text`, or reject it as a duplicate
    pub fn admit(&mut self, text: &str) -> Result<(), Rejection> {
        let key = Self::key(text);
        if self.seen.insert(key.clone()) {
            Ok(())
        } else {
            Err(Rejection::DuplicateCandidate { key })
        }
    }
}

/// Record a stage lifecycle event
pub(crate) fn stage_event(ctx: &StageContext<'_>, tier: Tier, event_type: EventType, summary: String) -> Event {
    Event::new(ctx.events.run_id(), Some(tier), event_type, summary)
}

/// Appendix shared by retry prompts
pub(crate) fn retry_note(feedback: &[String]) -> String {
    if feedback.is_empty() {
        return String::new();
    }
    let mut note = String::from(
        "\n\nYour previous answer had candidates rejected for these reasons; fix them:\n",
    );
    for line in feedback {
        note.push_str("- ");
        note.push_str(line);
        note.push('\n');
    }
    note
}

/// Evidence rules shared by the extraction prompts
pub(crate) const EVIDENCE_RULES: &str = "\
EVIDENCE RULES:
- Every item needs an \"evidence\" list of {\"input_file\", \"line_start\", \"line_end\", \"quote\"}.
- Line numbers are shown at the start of each line as 'N: '. Use them for line_start and line_end (1-based, inclusive).
- The quote must be the EXACT text of those lines, character for character, without the 'N: ' prefix.
- Multi-line quotes join the lines with a newline. Never paraphrase or translate.";

impl fmt::Display for RejectedCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {}: {}: {}", self.attempt, self.label, self.rejection)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::adapters::ScriptedProducer;

    pub const RULES: &str = "Operators must not use capital letters.\n\
Escalate if the customer complains.\n\
Keep the Russian medical term unchanged.\n";

    pub fn document() -> DocumentModel {
        DocumentModel::build("docs/rules.md", RULES)
    }

    pub fn fast_config() -> GenerationConfig {
        GenerationConfig {
            retry: crate::core::RetryPolicy::none(),
            ..Default::default()
        }
    }

    pub struct Fixture {
        pub document: DocumentModel,
        pub producer: ScriptedProducer,
        pub config: GenerationConfig,
        pub limits: SafetyLimits,
        pub matcher: QuoteMatcher,
        pub events: EventLog,
    }

    impl Fixture {
        pub fn new(producer: ScriptedProducer, config: GenerationConfig) -> Self {
            Self {
                document: document(),
                producer,
                config,
                limits: SafetyLimits::default(),
                matcher: QuoteMatcher::default(),
                events: EventLog::disabled(uuid::Uuid::new_v4()),
            }
        }

        pub fn context(&self) -> StageContext<'_> {
            StageContext::new(
                &self.document,
                &self.producer,
                &self.config,
                &self.limits,
                &self.matcher,
                &self.events,
            )
        }
    }
}
