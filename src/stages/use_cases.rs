//! Use-case extraction.

use std::time::Instant;

use serde::Deserialize;
use tracing::{info, instrument};

use super::{
    candidate_label, candidate_list, parse_candidate, retry_note, stage_event, Attempts, Dedupe,
    Rejection, StageContext, StageError, EVIDENCE_RULES,
};
use crate::adapters::{Prompt, Task};
use crate::core::IdAllocator;
use crate::domain::{EventType, Tier, UseCase};
use crate::evidence::Evidence;

#[derive(Debug, Deserialize)]
struct Candidate {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    evidence: Vec<Evidence>,
}

fn prompt(ctx: &StageContext<'_>, wanted: usize, accepted: &[UseCase], feedback: &[String]) -> Prompt {
    let system = format!(
        "You are a requirements analyst. Extract use cases from the numbered document.\n\
Answer with JSON: {{\"use_cases\": [{{\"name\": \"...\", \"description\": \"...\", \"evidence\": [...]}}]}}.\n\
Extract at least {} use cases. Keep names and descriptions in the document's language.\n\n{}",
        wanted, EVIDENCE_RULES
    );

    let mut user = format!(
        "File: {}\n\n{}",
        ctx.document.file_name(),
        ctx.document.numbered_text()
    );
    if !accepted.is_empty() {
        user.push_str("\n\nAlready extracted (do not repeat):\n");
        for uc in accepted {
            user.push_str(&format!("- {}\n", uc.name));
        }
    }
    user.push_str(&retry_note(feedback));

    Prompt::new(Task::UseCases, system, user)
}

fn admit(ctx: &StageContext<'_>, mut candidate: Candidate, dedupe: &mut Dedupe) -> Result<Candidate, Rejection> {
    if candidate.name.trim().is_empty() {
        return Err(Rejection::shape("name", "use case name is empty"));
    }
    ctx.ground_all(&mut candidate.evidence)?;
    dedupe.admit(&candidate.name)?;
    Ok(candidate)
}

/// Extract grounded use cases until the minimum count is met
#[instrument(skip_all, fields(tier = "use_case"))]
pub async fn extract(ctx: &StageContext<'_>, alloc: &mut IdAllocator) -> Result<Vec<UseCase>, StageError> {
    let wanted = ctx.config.thresholds.min_use_cases;
    let started = Instant::now();
    let mut attempts = Attempts::new(Tier::UseCase, ctx.config.max_attempts);
    let mut dedupe = Dedupe::default();
    let mut accepted: Vec<UseCase> = Vec::new();

    while let Some(attempt) = attempts.next_attempt() {
        let feedback = attempts.feedback(attempt - 1);
        ctx.events.record(
            stage_event(ctx, Tier::UseCase, EventType::StageStarted, format!("Extracting use cases, attempt {}", attempt))
                .with_attempt(attempt),
        );

        let payload = ctx
            .call(Tier::UseCase, &prompt(ctx, wanted, &accepted, &feedback), attempt)
            .await?;

        for (position, item) in candidate_list(payload, "use_cases", Tier::UseCase, attempt)?
            .into_iter()
            .enumerate()
        {
            let label = candidate_label(&item, position);
            let admitted = parse_candidate::<Candidate>(item).and_then(|c| admit(ctx, c, &mut dedupe));
            match admitted {
                Ok(candidate) => accepted.push(UseCase {
                    id: alloc.allocate(Tier::UseCase)?,
                    name: candidate.name.trim().to_string(),
                    description: candidate.description.trim().to_string(),
                    evidence: candidate.evidence,
                }),
                Err(rejection) => attempts.reject(ctx.events, label, rejection),
            }
        }

        if accepted.len() >= wanted {
            break;
        }
        ctx.events.record(
            stage_event(
                ctx,
                Tier::UseCase,
                EventType::StageRetrying,
                format!("{} of {} use cases accepted", accepted.len(), wanted),
            )
            .with_attempt(attempt),
        );
    }

    if accepted.len() < wanted {
        return Err(attempts.shortfall(format!(
            "{} of {} required use cases grounded",
            accepted.len(),
            wanted
        )));
    }

    info!(
        accepted = accepted.len(),
        rejected = attempts.rejected().len(),
        attempts = attempts.current(),
        "Use cases extracted"
    );
    ctx.events.record(
        stage_event(
            ctx,
            Tier::UseCase,
            EventType::StageCompleted,
            format!("{} use cases accepted", accepted.len()),
        )
        .with_attempt(attempts.current())
        .with_duration(started.elapsed().as_millis() as u64),
    );
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedProducer;
    use crate::stages::testing::{fast_config, Fixture};
    use serde_json::json;

    fn use_case(name: &str, line: usize, quote: &str) -> serde_json::Value {
        json!({
            "name": name,
            "description": format!("{} description", name),
            "evidence": [{"input_file": "rules.md", "line_start": line, "line_end": line, "quote": quote}]
        })
    }

    fn config(min: usize) -> crate::core::GenerationConfig {
        let mut config = fast_config();
        config.thresholds.min_use_cases = min;
        config
    }

    #[tokio::test]
    async fn test_grounded_candidates_get_sequential_ids() {
        let producer = ScriptedProducer::new().with(
            Task::UseCases,
            json!({"use_cases": [
                use_case("Capitals", 1, "Operators must not use capital letters."),
                use_case("Complaints", 2, "Escalate if the customer complains."),
            ]}),
        );
        let fixture = Fixture::new(producer, config(2));
        let mut alloc = IdAllocator::new();

        let accepted = extract(&fixture.context(), &mut alloc).await.unwrap();
        let ids: Vec<&str> = accepted.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["uc_001", "uc_002"]);
    }

    #[tokio::test]
    async fn test_ungrounded_candidate_triggers_retry() {
        let producer = ScriptedProducer::new()
            .with(
                Task::UseCases,
                json!({"use_cases": [
                    use_case("Capitals", 1, "Operators must not use capital letters."),
                    use_case("Wrong line", 2, "Operators must not use capital letters."),
                ]}),
            )
            .with(
                Task::UseCases,
                json!({"use_cases": [
                    use_case("Complaints", 2, "Escalate if the customer complains."),
                ]}),
            );
        let fixture = Fixture::new(producer, config(2));
        let mut alloc = IdAllocator::new();

        let accepted = extract(&fixture.context(), &mut alloc).await.unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].name, "Complaints");
        assert_eq!(fixture.producer.calls(Task::UseCases), 2);
        assert_eq!(fixture.producer.seeds(Task::UseCases), vec![Some(42), Some(43)]);
    }

    #[tokio::test]
    async fn test_shortfall_after_budget() {
        let producer = ScriptedProducer::new().with(
            Task::UseCases,
            json!({"use_cases": [
                use_case("A", 1, "Operators must not use capital letters."),
                use_case("B", 2, "Escalate if the customer complains."),
                use_case("C", 3, "Keep the Russian medical term unchanged."),
                use_case("D", 3, "Keep the Russian medical term unchanged"),
            ]}),
        );
        let fixture = Fixture::new(producer, config(5));
        let mut alloc = IdAllocator::new();

        let err = extract(&fixture.context(), &mut alloc).await.unwrap_err();
        match err {
            StageError::CoverageShortfall { tier, attempts, .. } => {
                assert_eq!(tier, Tier::UseCase);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Repeats of the same names are duplicates on later attempts
        assert_eq!(fixture.producer.calls(Task::UseCases), 3);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fatal() {
        let producer = ScriptedProducer::new().with(Task::UseCases, json!({"items": []}));
        let fixture = Fixture::new(producer, config(1));
        let mut alloc = IdAllocator::new();

        let err = extract(&fixture.context(), &mut alloc).await.unwrap_err();
        assert!(matches!(err, StageError::Producer { attempt: 1, .. }));
    }
}
