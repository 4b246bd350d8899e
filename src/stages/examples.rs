//! Dataset example generation.
//!
//! Every test case gets `min_examples_per_test_case` slots. A slot fixes one
//! parameter combination and one format; the producer fills the open slots
//! of a test case in a single call, and unfilled slots are asked for again on
//! the next attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::variations::is_adversarial;
use super::{
    candidate_list, combinations, parse_candidate, retry_note, stage_event, Attempts, CaseSelection,
    Combination, Dedupe, Rejection, StageContext, StageError,
};
use crate::adapters::{Prompt, Task};
use crate::core::IdAllocator;
use crate::domain::{
    DatasetExample, EventType, ExampleFormat, InputData, Message, Policy, TestCase, Tier, UseCase,
};

pub const MIN_EVALUATION_CRITERIA: usize = 3;

/// Allowed `metadata.source` values
pub const SOURCE_TAGS: [&str; 3] = ["tickets", "faq_paraphrase", "corner"];

const FAQ_CUES: [&str; 5] = ["faq", "frequently asked", "чаво", "чзв", "часто задаваемые"];

/// Decide `metadata.source` for an example
pub fn classify_source(combination: &Combination, use_case_description: &str, claimed: Option<&str>) -> &'static str {
    if is_adversarial(combination) {
        return "corner";
    }
    let description = use_case_description.to_lowercase();
    if FAQ_CUES.iter().any(|cue| description.contains(cue)) {
        return "faq_paraphrase";
    }
    claimed
        .map(|c| c.trim().to_lowercase())
        .and_then(|c| SOURCE_TAGS.iter().find(|tag| **tag == c).copied())
        .unwrap_or("tickets")
}

/// One requested example
#[derive(Debug, Clone)]
struct Slot {
    parameters: Combination,
    format: ExampleFormat,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    test_case_id: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    expected_output: String,
    #[serde(default)]
    evaluation_criteria: Vec<String>,
    #[serde(default)]
    policy_ids: Vec<String>,
    #[serde(default)]
    source: Option<String>,
}

struct Admitted {
    slot: usize,
    input: InputData,
    expected_output: String,
    evaluation_criteria: Vec<String>,
    policy_ids: Vec<String>,
    source: &'static str,
}

/// Everything an example is checked against
struct Scope<'s> {
    test_case: &'s TestCase,
    use_case: &'s UseCase,
    test_case_ids: &'s BTreeSet<&'s str>,
    policy_ids: &'s BTreeSet<&'s str>,
}

fn plan_slots(ctx: &StageContext<'_>, test_case: &TestCase, position: usize, formats: &[ExampleFormat]) -> Vec<Slot> {
    let wanted = ctx.config.thresholds.min_examples_per_test_case.max(1);
    let mut combos = combinations(&test_case.parameter_variation_axes, ctx.config.strategy);
    if combos.is_empty() {
        combos.push(Combination::new());
    }
    let formats: Vec<ExampleFormat> = if formats.is_empty() {
        vec![ExampleFormat::SingleTurnQa]
    } else {
        formats.to_vec()
    };

    (0..wanted)
        .map(|i| Slot {
            parameters: combos[i % combos.len()].clone(),
            format: formats[(position + i) % formats.len()].clone(),
        })
        .collect()
}

fn format_instructions(format: &ExampleFormat) -> &'static str {
    match format {
        ExampleFormat::SingleTurnQa => {
            "exactly one message with role \"user\"; expected_output is the ideal answer"
        }
        ExampleFormat::SingleUtteranceCorrection => {
            "exactly one message with role \"operator\" containing the errors the parameters call for; expected_output is the corrected message"
        }
        ExampleFormat::DialogLastTurnCorrection => {
            "a dialog of 2 or more user/operator messages ending with an \"operator\" message that contains errors; expected_output is the corrected last operator message"
        }
        ExampleFormat::Unknown(_) => "a conversation",
    }
}

fn prompt(
    scope: &Scope<'_>,
    policies: &[Policy],
    selection: &CaseSelection,
    slots: &[(usize, &Slot)],
    feedback: &[String],
) -> Prompt {
    let system = format!(
        "You write evaluation examples for a conversational assistant (case: {}).\n\
Answer with JSON: {{\"examples\": [{{\"messages\": [{{\"role\": \"...\", \"content\": \"...\"}}], \"expected_output\": \"...\", \
\"evaluation_criteria\": [\"...\"], \"policy_ids\": [\"pol_...\"], \"source\": \"tickets|faq_paraphrase|corner\"}}]}}.\n\
Return one example per requested slot, in order. Each example needs at least {} evaluation criteria \
and references the policies it exercises.",
        selection.case, MIN_EVALUATION_CRITERIA
    );

    let mut user = format!(
        "USE CASE {}: {}\n{}\n\nTEST CASE {}: {}\n{}\n\nPOLICIES:\n",
        scope.use_case.id,
        scope.use_case.name,
        scope.use_case.description,
        scope.test_case.id,
        scope.test_case.name,
        scope.test_case.description
    );
    for pol in policies {
        user.push_str(&format!("- {} [{}] {}: {}\n", pol.id, pol.policy_type, pol.name, pol.description));
    }

    user.push_str("\nSLOTS:\n");
    for (n, (_, slot)) in slots.iter().enumerate() {
        let parameters: Vec<String> = slot
            .parameters
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        user.push_str(&format!(
            "{}. format {}: {}. Parameters: {}\n",
            n + 1,
            slot.format,
            format_instructions(&slot.format),
            if parameters.is_empty() { "none".to_string() } else { parameters.join(", ") }
        ));
    }
    user.push_str(&retry_note(feedback));

    Prompt::new(Task::Examples, system, user)
}

fn admit(
    candidate: Candidate,
    slot_index: usize,
    slot: &Slot,
    scope: &Scope<'_>,
    dedupe: &mut Dedupe,
) -> Result<Admitted, Rejection> {
    if let Some(claimed) = candidate.test_case_id.as_deref().filter(|id| !id.is_empty()) {
        if !scope.test_case_ids.contains(claimed) {
            return Err(Rejection::dangling("test_case_id", claimed));
        }
        if claimed != scope.test_case.id {
            return Err(Rejection::shape(
                "test_case_id",
                format!("example was requested for {} but names {}", scope.test_case.id, claimed),
            ));
        }
    }

    if candidate.messages.is_empty() {
        return Err(Rejection::shape("input.messages", "no messages"));
    }
    for (i, message) in candidate.messages.iter().enumerate() {
        if !message.role.is_known() {
            return Err(Rejection::shape(
                format!("input.messages[{}].role", i),
                format!("unknown role '{}'", message.role),
            ));
        }
        if message.content.trim().is_empty() {
            return Err(Rejection::shape(format!("input.messages[{}].content", i), "empty message"));
        }
    }

    let target = InputData::expected_target(&slot.format, candidate.messages.len());
    let input = InputData {
        messages: candidate.messages,
        target_message_index: target,
    };
    let violations = input.format_violations(&slot.format);
    if !violations.is_empty() {
        return Err(Rejection::shape("input", violations.join("; ")));
    }

    let expected_output = candidate.expected_output.trim().to_string();
    if expected_output.is_empty() {
        return Err(Rejection::shape("expected_output", "expected output is empty"));
    }

    let evaluation_criteria: Vec<String> = candidate
        .evaluation_criteria
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if evaluation_criteria.len() < MIN_EVALUATION_CRITERIA {
        return Err(Rejection::shape(
            "evaluation_criteria",
            format!(
                "need at least {} criteria, got {}",
                MIN_EVALUATION_CRITERIA,
                evaluation_criteria.len()
            ),
        ));
    }

    let mut policy_ids: Vec<String> = Vec::new();
    for id in candidate.policy_ids.iter().map(|id| id.trim()) {
        if !scope.policy_ids.contains(id) {
            return Err(Rejection::dangling("policy_ids", id));
        }
        if !policy_ids.iter().any(|p| p == id) {
            policy_ids.push(id.to_string());
        }
    }
    if policy_ids.is_empty() {
        policy_ids = scope.test_case.policy_ids.clone();
    }
    if policy_ids.is_empty() {
        return Err(Rejection::shape("policy_ids", "at least one policy reference is required"));
    }

    dedupe.admit(&input.messages[0].content)?;

    Ok(Admitted {
        slot: slot_index,
        source: classify_source(&slot.parameters, &scope.use_case.description, candidate.source.as_deref()),
        input,
        expected_output,
        evaluation_criteria,
        policy_ids,
    })
}

/// Fill every slot of one test case
async fn propose_for(
    ctx: &StageContext<'_>,
    scope: Scope<'_>,
    slots: Vec<Slot>,
    policies: &[Policy],
    selection: &CaseSelection,
) -> Result<Vec<(Slot, Admitted)>, StageError> {
    let mut attempts = Attempts::new(Tier::Example, ctx.config.max_attempts);
    let mut dedupe = Dedupe::default();
    let mut filled: BTreeMap<usize, Admitted> = BTreeMap::new();

    while let Some(attempt) = attempts.next_attempt() {
        let open: Vec<(usize, &Slot)> = slots
            .iter()
            .enumerate()
            .filter(|(i, _)| !filled.contains_key(i))
            .collect();
        let feedback = attempts.feedback(attempt - 1);
        let request = prompt(&scope, policies, selection, &open, &feedback);
        let payload = ctx.call(Tier::Example, &request, attempt).await?;
        let items = candidate_list(payload, "examples", Tier::Example, attempt)?;

        if items.len() > open.len() {
            debug!(
                test_case = %scope.test_case.id,
                returned = items.len(),
                requested = open.len(),
                "Ignoring unrequested examples"
            );
        }

        for ((slot_index, slot), item) in open.iter().zip(items) {
            let label = format!("{}/slot {} ({})", scope.test_case.id, slot_index + 1, slot.format);
            match parse_candidate::<Candidate>(item).and_then(|c| admit(c, *slot_index, slot, &scope, &mut dedupe)) {
                Ok(admitted) => {
                    filled.insert(*slot_index, admitted);
                }
                Err(rejection) => attempts.reject(ctx.events, label, rejection),
            }
        }

        if filled.len() >= slots.len() {
            return Ok(filled
                .into_values()
                .map(|admitted| (slots[admitted.slot].clone(), admitted))
                .collect());
        }
        ctx.events.record(
            stage_event(
                ctx,
                Tier::Example,
                EventType::StageRetrying,
                format!("{}: {} of {} examples", scope.test_case.id, filled.len(), slots.len()),
            )
            .with_attempt(attempt),
        );
    }

    Err(attempts.shortfall(format!(
        "test case {} has {} of {} required examples",
        scope.test_case.id,
        filled.len(),
        slots.len()
    )))
}

/// Generate examples for every test case
#[instrument(skip_all, fields(tier = "example", test_cases = test_cases.len(), case = %selection.case))]
pub async fn generate(
    ctx: &StageContext<'_>,
    alloc: &mut IdAllocator,
    use_cases: &[UseCase],
    policies: &[Policy],
    test_cases: &[TestCase],
    selection: &CaseSelection,
) -> Result<Vec<DatasetExample>, StageError> {
    let started = Instant::now();
    ctx.events.record(stage_event(
        ctx,
        Tier::Example,
        EventType::StageStarted,
        format!("Generating examples for {} test cases ({})", test_cases.len(), selection.case),
    ));

    let test_case_ids: BTreeSet<&str> = test_cases.iter().map(|t| t.id.as_str()).collect();
    let policy_ids: BTreeSet<&str> = policies.iter().map(|p| p.id.as_str()).collect();

    let mut jobs = Vec::with_capacity(test_cases.len());
    for (position, test_case) in test_cases.iter().enumerate() {
        let use_case = use_cases
            .iter()
            .find(|u| u.id == test_case.use_case_id)
            .ok_or_else(|| StageError::CoverageShortfall {
                tier: Tier::Example,
                detail: format!(
                    "test case {} names unknown use case {}",
                    test_case.id, test_case.use_case_id
                ),
                attempts: 0,
                rejected: 0,
            })?;
        let scope = Scope {
            test_case,
            use_case,
            test_case_ids: &test_case_ids,
            policy_ids: &policy_ids,
        };
        jobs.push((position, scope, plan_slots(ctx, test_case, position, &selection.formats)));
    }

    let mut results: Vec<(usize, Result<Vec<(Slot, Admitted)>, StageError>)> = stream::iter(jobs)
        .map(|(position, scope, slots)| async move {
            (position, propose_for(ctx, scope, slots, policies, selection).await)
        })
        .buffer_unordered(ctx.config.concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(position, _)| *position);

    let mut examples = Vec::new();
    for (position, result) in results {
        let test_case = &test_cases[position];
        for (slot, admitted) in result? {
            let mut metadata = BTreeMap::new();
            metadata.insert("source".to_string(), json!(admitted.source));
            metadata.insert("generator".to_string(), json!(slot.format.as_str()));
            metadata.insert("model".to_string(), json!(ctx.config.model));
            metadata.insert("parameters".to_string(), json!(slot.parameters));

            examples.push(DatasetExample {
                id: alloc.allocate(Tier::Example)?,
                case: selection.case.clone(),
                format: slot.format,
                use_case_id: test_case.use_case_id.clone(),
                test_case_id: test_case.id.clone(),
                input: admitted.input,
                expected_output: admitted.expected_output,
                evaluation_criteria: admitted.evaluation_criteria,
                policy_ids: admitted.policy_ids,
                metadata,
            });
        }
    }

    info!(accepted = examples.len(), "Examples generated");
    ctx.events.record(
        stage_event(
            ctx,
            Tier::Example,
            EventType::StageCompleted,
            format!("{} examples accepted", examples.len()),
        )
        .with_duration(started.elapsed().as_millis() as u64),
    );
    Ok(examples)
}
