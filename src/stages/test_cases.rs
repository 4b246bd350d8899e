//! Test-case generation, one producer conversation per use case.
//!
//! Use cases are processed concurrently up to the configured limit. Results
//! are put back in use-case order before any identifier is allocated, so
//! `tc_` numbering does not depend on which call finished first.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{
    axis_catalog, candidate_label, candidate_list, parse_candidate, retry_note, stage_event, Attempts,
    CaseSelection, Dedupe, Rejection, StageContext, StageError,
};
use crate::adapters::{Prompt, Task};
use crate::core::IdAllocator;
use crate::domain::{EventType, Policy, TestCase, Tier, UseCase, VariationAxis};

/// Axis count bounds for a test case
pub const MIN_AXES: usize = 2;
pub const MAX_AXES: usize = 3;

#[derive(Debug, Deserialize)]
struct AxisCandidate {
    name: String,
    #[serde(default)]
    values: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    use_case_id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameter_variation_axes: Vec<AxisCandidate>,
    #[serde(default)]
    policy_ids: Vec<String>,
}

/// A candidate that passed admission, still without an identifier
#[derive(Debug)]
struct Admitted {
    name: String,
    description: String,
    axes: Vec<VariationAxis>,
    policy_ids: Vec<String>,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn admit_axes(candidates: Vec<AxisCandidate>, max_values: usize) -> Result<Vec<VariationAxis>, Rejection> {
    if !(MIN_AXES..=MAX_AXES).contains(&candidates.len()) {
        return Err(Rejection::shape(
            "parameter_variation_axes",
            format!("expected {}-{} axes, got {}", MIN_AXES, MAX_AXES, candidates.len()),
        ));
    }

    let mut names = BTreeSet::new();
    let mut axes = Vec::with_capacity(candidates.len());
    for axis in candidates {
        let name = axis.name.trim().to_string();
        if name.is_empty() {
            return Err(Rejection::shape("parameter_variation_axes", "axis name is empty"));
        }
        if !names.insert(name.to_lowercase()) {
            return Err(Rejection::shape(
                "parameter_variation_axes",
                format!("axis '{}' appears twice", name),
            ));
        }

        let mut values: Vec<String> = Vec::new();
        for value in axis.values.iter().map(value_text).filter(|v| !v.is_empty()) {
            if !values.contains(&value) {
                values.push(value);
            }
        }
        if values.len() < 2 || values.len() > max_values {
            return Err(Rejection::shape(
                "parameter_variation_axes",
                format!(
                    "axis '{}' needs 2-{} distinct values, got {}",
                    name,
                    max_values,
                    values.len()
                ),
            ));
        }
        axes.push(VariationAxis { name, values });
    }
    Ok(axes)
}

fn admit(
    candidate: Candidate,
    use_case: &UseCase,
    use_case_ids: &BTreeSet<&str>,
    policy_ids: &BTreeSet<&str>,
    max_values: usize,
    dedupe: &mut Dedupe,
) -> Result<Admitted, Rejection> {
    if candidate.name.trim().is_empty() {
        return Err(Rejection::shape("name", "test case name is empty"));
    }

    if let Some(claimed) = candidate.use_case_id.as_deref().filter(|id| !id.is_empty()) {
        if !use_case_ids.contains(claimed) {
            return Err(Rejection::dangling("use_case_id", claimed));
        }
        if claimed != use_case.id {
            return Err(Rejection::shape(
                "use_case_id",
                format!("test case was requested for {} but names {}", use_case.id, claimed),
            ));
        }
    }

    let axes = admit_axes(candidate.parameter_variation_axes, max_values)?;

    let mut refs: Vec<String> = Vec::new();
    for id in candidate.policy_ids.iter().map(|id| id.trim()) {
        if !policy_ids.contains(id) {
            return Err(Rejection::dangling("policy_ids", id));
        }
        if !refs.iter().any(|r| r == id) {
            refs.push(id.to_string());
        }
    }

    dedupe.admit(&candidate.name)?;

    Ok(Admitted {
        name: candidate.name.trim().to_string(),
        description: candidate.description.trim().to_string(),
        axes,
        policy_ids: refs,
    })
}

fn prompt(
    use_case: &UseCase,
    policies: &[Policy],
    selection: &CaseSelection,
    wanted: usize,
    max_values: usize,
    accepted: &[Admitted],
    feedback: &[String],
) -> Prompt {
    let system = format!(
        "You design test cases for a conversational assistant.\n\
Answer with JSON: {{\"test_cases\": [{{\"use_case_id\": \"...\", \"name\": \"...\", \"description\": \"...\", \
\"parameter_variation_axes\": [{{\"name\": \"...\", \"values\": [\"...\"]}}], \"policy_ids\": [\"pol_...\"]}}]}}.\n\
Propose at least {} distinct test cases for the use case below. Each test case varies {}-{} named axes, \
each with 2-{} discrete values. Reference only the policy ids listed.",
        wanted, MIN_AXES, MAX_AXES, max_values
    );

    let mut user = format!(
        "USE CASE {}: {}\n{}\n\nPOLICIES:\n",
        use_case.id, use_case.name, use_case.description
    );
    for pol in policies {
        user.push_str(&format!("- {} [{}] {}: {}\n", pol.id, pol.policy_type, pol.name, pol.description));
    }

    user.push_str(&format!("\nSUGGESTED AXES for case '{}':\n", selection.case));
    for axis in axis_catalog(&selection.case) {
        user.push_str(&format!("- {}: {}\n", axis.name, axis.values.join(", ")));
    }

    if !accepted.is_empty() {
        user.push_str("\nAlready accepted (do not repeat):\n");
        for tc in accepted {
            user.push_str(&format!("- {}\n", tc.name));
        }
    }
    user.push_str(&retry_note(feedback));

    Prompt::new(Task::TestCases, system, user)
}

/// Run the attempt loop for one use case
async fn propose_for(
    ctx: &StageContext<'_>,
    use_case: &UseCase,
    use_cases: &[UseCase],
    policies: &[Policy],
    selection: &CaseSelection,
) -> Result<Vec<Admitted>, StageError> {
    let wanted = ctx.config.thresholds.min_test_cases_per_use_case;
    let max_values = ctx.config.max_axis_values;
    let use_case_ids: BTreeSet<&str> = use_cases.iter().map(|u| u.id.as_str()).collect();
    let policy_ids: BTreeSet<&str> = policies.iter().map(|p| p.id.as_str()).collect();

    let mut attempts = Attempts::new(Tier::TestCase, ctx.config.max_attempts);
    let mut dedupe = Dedupe::default();
    let mut accepted: Vec<Admitted> = Vec::new();

    while let Some(attempt) = attempts.next_attempt() {
        let feedback = attempts.feedback(attempt - 1);
        let request = prompt(use_case, policies, selection, wanted, max_values, &accepted, &feedback);
        let payload = ctx.call(Tier::TestCase, &request, attempt).await?;

        for (position, item) in candidate_list(payload, "test_cases", Tier::TestCase, attempt)?
            .into_iter()
            .enumerate()
        {
            let label = format!("{}/{}", use_case.id, candidate_label(&item, position));
            let admitted = parse_candidate::<Candidate>(item).and_then(|c| {
                admit(c, use_case, &use_case_ids, &policy_ids, max_values, &mut dedupe)
            });
            match admitted {
                Ok(tc) => accepted.push(tc),
                Err(rejection) => attempts.reject(ctx.events, label, rejection),
            }
        }

        if accepted.len() >= wanted {
            return Ok(accepted);
        }
        ctx.events.record(
            stage_event(
                ctx,
                Tier::TestCase,
                EventType::StageRetrying,
                format!("{}: {} of {} test cases", use_case.id, accepted.len(), wanted),
            )
            .with_attempt(attempt),
        );
    }

    Err(attempts.shortfall(format!(
        "use case {} has {} of {} required test cases",
        use_case.id,
        accepted.len(),
        wanted
    )))
}

/// Generate test cases for every use case
#[instrument(skip_all, fields(tier = "test_case", use_cases = use_cases.len()))]
pub async fn generate(
    ctx: &StageContext<'_>,
    alloc: &mut IdAllocator,
    use_cases: &[UseCase],
    policies: &[Policy],
    selection: &CaseSelection,
) -> Result<Vec<TestCase>, StageError> {
    let started = Instant::now();
    ctx.events.record(stage_event(
        ctx,
        Tier::TestCase,
        EventType::StageStarted,
        format!("Generating test cases for {} use cases", use_cases.len()),
    ));

    let mut results: Vec<(usize, Result<Vec<Admitted>, StageError>)> =
        stream::iter(use_cases.iter().enumerate())
            .map(|(index, use_case)| async move {
                (index, propose_for(ctx, use_case, use_cases, policies, selection).await)
            })
            .buffer_unordered(ctx.config.concurrency.max(1))
            .collect()
            .await;
    results.sort_by_key(|(index, _)| *index);

    let mut test_cases = Vec::new();
    for (index, result) in results {
        let use_case = &use_cases[index];
        for admitted in result? {
            let mut metadata = BTreeMap::new();
            metadata.insert("case".to_string(), json!(selection.case));
            test_cases.push(TestCase {
                id: alloc.allocate(Tier::TestCase)?,
                use_case_id: use_case.id.clone(),
                name: admitted.name,
                description: admitted.description,
                parameter_variation_axes: admitted.axes,
                policy_ids: admitted.policy_ids,
                metadata,
            });
        }
    }

    info!(accepted = test_cases.len(), "Test cases generated");
    ctx.events.record(
        stage_event(
            ctx,
            Tier::TestCase,
            EventType::StageCompleted,
            format!("{} test cases accepted", test_cases.len()),
        )
        .with_duration(started.elapsed().as_millis() as u64),
    );
    Ok(test_cases)
}
