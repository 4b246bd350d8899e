//! Policy extraction and classification.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{
    candidate_label, candidate_list, parse_candidate, retry_note, stage_event, Attempts, Dedupe,
    Rejection, StageContext, StageError, EVIDENCE_RULES,
};
use crate::adapters::{Prompt, Task};
use crate::core::IdAllocator;
use crate::domain::{EventType, Policy, PolicyType, Tier};
use crate::evidence::Evidence;

/// Lowercase phrases that suggest a policy type (English and Russian).
/// Phrases match whole words; a trailing `*` lets the last word match as a stem.
const CUES: [(PolicyType, &[&str]); 5] = [
    (
        PolicyType::MustNot,
        &[
            "must not", "mustn't", "never", "do not", "don't", "not allowed", "prohibited",
            "forbidden", "не должен", "не должна", "не должны", "нельзя", "запрещ*", "не допуска*",
        ],
    ),
    (
        PolicyType::Escalate,
        &[
            "escalat*", "hand over", "hand off", "transfer to", "supervisor*", "human agent*",
            "эскалац*", "переключить на", "передать", "передавать",
        ],
    ),
    (
        PolicyType::Style,
        &["tone", "polite*", "friendly", "style", "вежлив*", "дружелюб*", "стиль", "тон общения"],
    ),
    (
        PolicyType::Format,
        &[
            "format*", "capital letter*", "uppercase", "punctuation", "typo*", "bullet*", "template*",
            "формат*", "капслок*", "заглавн*", "пунктуац*", "опечат*", "шаблон*",
        ],
    ),
    (
        PolicyType::Must,
        &["must", "should", "always", "required", "должен", "должна", "обязан*", "всегда"],
    ),
];

/// Lowercase words of `text`; apostrophes stay inside words
fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether the cue phrase occurs as consecutive words of `text`
fn cue_matches(text: &[String], cue: &str) -> bool {
    let (phrase, stem) = match cue.strip_suffix('*') {
        Some(phrase) => (phrase, true),
        None => (cue, false),
    };
    let cue: Vec<&str> = phrase.split_whitespace().collect();
    if cue.is_empty() || cue.len() > text.len() {
        return false;
    }

    text.windows(cue.len()).any(|window| {
        window.iter().zip(&cue).enumerate().all(|(idx, (word, cue_word))| {
            if stem && idx + 1 == cue.len() {
                word.starts_with(cue_word)
            } else {
                word == cue_word
            }
        })
    })
}

/// Types whose cues occur in `text`
pub fn cued_types(text: &str) -> BTreeSet<PolicyType> {
    let text = words(text);
    CUES.iter()
        .filter(|(_, phrases)| phrases.iter().any(|p| cue_matches(&text, p)))
        .map(|(t, _)| t.clone())
        .collect()
}

/// Settle on exactly one known type
///
/// The claimed type and every cued type compete; the most specific one in
/// `PolicyType::PRECEDENCE` wins. With neither, the policy is a plain `must`.
pub fn classify(claimed: &PolicyType, name: &str, description: &str) -> PolicyType {
    let mut candidates = cued_types(&format!("{}\n{}", name, description));
    if claimed.is_known() {
        candidates.insert(claimed.clone());
    }

    candidates
        .into_iter()
        .min_by_key(|t| t.precedence())
        .unwrap_or(PolicyType::Must)
}

#[derive(Debug, Deserialize)]
struct Candidate {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    policy_type: Option<PolicyType>,
    #[serde(default)]
    evidence: Vec<Evidence>,
}

fn prompt(
    ctx: &StageContext<'_>,
    wanted: usize,
    accepted: &[Policy],
    missing_types: usize,
    feedback: &[String],
) -> Prompt {
    let system = format!(
        "You are a requirements analyst. Extract policies (rules the assistant or operator must follow) from the numbered document.\n\
Answer with JSON: {{\"policies\": [{{\"name\": \"...\", \"description\": \"...\", \"type\": \"...\", \"evidence\": [...]}}]}}.\n\
Extract at least {} policies. Classify each with exactly one type, checking in this order:\n\
1. must_not: a prohibition\n\
2. escalate: hand the conversation to a human or specialist\n\
3. style: tone or manner of communication\n\
4. format: output format, structure, spelling, punctuation\n\
5. must: any other obligation\n\n{}",
        wanted, EVIDENCE_RULES
    );

    let mut user = format!(
        "File: {}\n\n{}",
        ctx.document.file_name(),
        ctx.document.numbered_text()
    );
    if !accepted.is_empty() {
        user.push_str("\n\nAlready extracted (do not repeat):\n");
        for pol in accepted {
            user.push_str(&format!("- [{}] {}\n", pol.policy_type, pol.name));
        }
    }
    if missing_types > 0 {
        user.push_str(&format!(
            "\nThe extracted policies need {} more distinct type(s).\n",
            missing_types
        ));
    }
    user.push_str(&retry_note(feedback));

    Prompt::new(Task::Policies, system, user)
}

fn admit(ctx: &StageContext<'_>, mut candidate: Candidate, dedupe: &mut Dedupe) -> Result<Candidate, Rejection> {
    if candidate.name.trim().is_empty() {
        return Err(Rejection::shape("name", "policy name is empty"));
    }
    ctx.ground_all(&mut candidate.evidence)?;
    dedupe.admit(&candidate.name)?;
    Ok(candidate)
}

fn distinct_types(policies: &[Policy]) -> usize {
    policies
        .iter()
        .map(|p| &p.policy_type)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Extract grounded, classified policies until count and type coverage are met
#[instrument(skip_all, fields(tier = "policy"))]
pub async fn extract(ctx: &StageContext<'_>, alloc: &mut IdAllocator) -> Result<Vec<Policy>, StageError> {
    let thresholds = &ctx.config.thresholds;
    let wanted = thresholds.min_policies;
    let wanted_types = thresholds.min_policy_types;
    let started = Instant::now();
    let mut attempts = Attempts::new(Tier::Policy, ctx.config.max_attempts);
    let mut dedupe = Dedupe::default();
    let mut accepted: Vec<Policy> = Vec::new();

    let covered = |accepted: &[Policy]| accepted.len() >= wanted && distinct_types(accepted) >= wanted_types;

    while let Some(attempt) = attempts.next_attempt() {
        let feedback = attempts.feedback(attempt - 1);
        let missing_types = wanted_types.saturating_sub(distinct_types(&accepted));
        ctx.events.record(
            stage_event(ctx, Tier::Policy, EventType::StageStarted, format!("Extracting policies, attempt {}", attempt))
                .with_attempt(attempt),
        );

        let payload = ctx
            .call(
                Tier::Policy,
                &prompt(ctx, wanted, &accepted, missing_types, &feedback),
                attempt,
            )
            .await?;

        for (position, item) in candidate_list(payload, "policies", Tier::Policy, attempt)?
            .into_iter()
            .enumerate()
        {
            let label = candidate_label(&item, position);
            match parse_candidate::<Candidate>(item).and_then(|c| admit(ctx, c, &mut dedupe)) {
                Ok(candidate) => {
                    let claimed = candidate
                        .policy_type
                        .unwrap_or_else(|| PolicyType::Unknown(String::new()));
                    let policy_type = classify(&claimed, &candidate.name, &candidate.description);
                    if policy_type != claimed {
                        debug!(policy = %candidate.name, %claimed, %policy_type, "Policy reclassified");
                    }
                    accepted.push(Policy {
                        id: alloc.allocate(Tier::Policy)?,
                        name: candidate.name.trim().to_string(),
                        description: candidate.description.trim().to_string(),
                        policy_type,
                        evidence: candidate.evidence,
                    });
                }
                Err(rejection) => attempts.reject(ctx.events, label, rejection),
            }
        }

        if covered(&accepted) {
            break;
        }
        ctx.events.record(
            stage_event(
                ctx,
                Tier::Policy,
                EventType::StageRetrying,
                format!(
                    "{} of {} policies, {} of {} types",
                    accepted.len(),
                    wanted,
                    distinct_types(&accepted),
                    wanted_types
                ),
            )
            .with_attempt(attempt),
        );
    }

    if !covered(&accepted) {
        return Err(attempts.shortfall(format!(
            "{} of {} required policies with {} of {} required distinct types",
            accepted.len(),
            wanted,
            distinct_types(&accepted),
            wanted_types
        )));
    }

    info!(
        accepted = accepted.len(),
        types = distinct_types(&accepted),
        rejected = attempts.rejected().len(),
        "Policies extracted"
    );
    ctx.events.record(
        stage_event(
            ctx,
            Tier::Policy,
            EventType::StageCompleted,
            format!("{} policies accepted", accepted.len()),
        )
        .with_attempt(attempts.current())
        .with_duration(started.elapsed().as_millis() as u64),
    );
    Ok(accepted)
}
