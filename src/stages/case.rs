//! Dataset case and format selection.

use serde::Deserialize;
use tracing::{info, warn};

use super::variations::default_formats;
use super::{StageContext, StageError};
use crate::adapters::{Prompt, Task};
use crate::domain::{ExampleFormat, Policy, Tier, UseCase};

pub const FALLBACK_CASE: &str = "support_bot";

/// Case and formats the example stage generates for
#[derive(Debug, Clone, PartialEq)]
pub struct CaseSelection {
    pub case: String,
    pub formats: Vec<ExampleFormat>,
    /// Whether the producer picked the case
    pub detected: bool,
}

impl CaseSelection {
    fn fallback() -> Self {
        Self {
            case: FALLBACK_CASE.to_string(),
            formats: vec![ExampleFormat::SingleTurnQa],
            detected: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Detection {
    #[serde(default)]
    case: String,
    #[serde(default)]
    formats: Vec<ExampleFormat>,
    #[serde(default)]
    reasoning: String,
}

const SYSTEM_PROMPT: &str = "\
You classify a requirements document by its extracted use cases and policies.
Answer with JSON: {\"case\": \"...\", \"formats\": [...], \"reasoning\": \"...\"}.

CASES:
- support_bot: FAQ, customer support tickets, help desk. Formats: [\"single_turn_qa\"]
- operator_quality: operator message correction, quality checks. Formats: [\"single_utterance_correction\", \"dialog_last_turn_correction\"]
- doctor_booking: medical appointment booking. Formats: [\"single_turn_qa\"]

Decide from the content only, never from file names. Include every applicable format.";

fn summary_prompt(use_cases: &[UseCase], policies: &[Policy]) -> String {
    let mut user = String::from("USE CASES:\n");
    for uc in use_cases.iter().take(10) {
        user.push_str(&format!("- {}: {}\n", uc.name, truncate(&uc.description, 100)));
    }
    user.push_str("\nPOLICIES:\n");
    for pol in policies.iter().take(10) {
        user.push_str(&format!(
            "- [{}] {}: {}\n",
            pol.policy_type,
            pol.name,
            truncate(&pol.description, 100)
        ));
    }
    user
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Pick the dataset case and example formats
///
/// Configured values win. Otherwise the producer classifies the artifacts;
/// a failed or empty classification falls back to support-bot QA.
pub async fn resolve_case(
    ctx: &StageContext<'_>,
    use_cases: &[UseCase],
    policies: &[Policy],
) -> Result<CaseSelection, StageError> {
    let configured_formats: Vec<ExampleFormat> = ctx.config.formats.clone();

    if let Some(case) = ctx.config.case.as_deref().filter(|c| !c.trim().is_empty()) {
        let formats = if configured_formats.is_empty() {
            default_formats(case)
        } else {
            configured_formats
        };
        info!(case, ?formats, "Using configured case");
        return Ok(CaseSelection {
            case: case.to_string(),
            formats,
            detected: false,
        });
    }

    let prompt = Prompt::new(
        Task::CaseDetection,
        SYSTEM_PROMPT,
        summary_prompt(use_cases, policies),
    );

    let mut selection = match ctx.call(Tier::Example, &prompt, 1).await {
        Ok(payload) => match serde_json::from_value::<Detection>(payload) {
            Ok(detection) if !detection.case.trim().is_empty() => {
                let mut formats: Vec<ExampleFormat> =
                    detection.formats.into_iter().filter(|f| f.is_known()).collect();
                formats.dedup();
                if formats.is_empty() {
                    formats = default_formats(&detection.case);
                }
                info!(
                    case = %detection.case,
                    ?formats,
                    reasoning = %truncate(&detection.reasoning, 80),
                    "Detected dataset case"
                );
                CaseSelection {
                    case: detection.case.trim().to_string(),
                    formats,
                    detected: true,
                }
            }
            Ok(_) => {
                warn!("Case detection returned no case, using {}", FALLBACK_CASE);
                CaseSelection::fallback()
            }
            Err(e) => {
                warn!(error = %e, "Case detection payload unreadable, using {}", FALLBACK_CASE);
                CaseSelection::fallback()
            }
        },
        Err(StageError::Producer { source, .. }) => {
            warn!(error = %source, "Case detection failed, using {}", FALLBACK_CASE);
            CaseSelection::fallback()
        }
        Err(other) => return Err(other),
    };

    if !configured_formats.is_empty() {
        selection.formats = configured_formats;
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ProducerError, ScriptedProducer};
    use crate::stages::testing::{fast_config, Fixture};
    use serde_json::json;

    #[tokio::test]
    async fn test_configured_case_skips_producer() {
        let mut config = fast_config();
        config.case = Some("operator_quality".into());
        let fixture = Fixture::new(ScriptedProducer::new(), config);

        let selection = resolve_case(&fixture.context(), &[], &[]).await.unwrap();
        assert_eq!(selection.case, "operator_quality");
        assert_eq!(selection.formats.len(), 2);
        assert_eq!(fixture.producer.calls(Task::CaseDetection), 0);
    }

    #[tokio::test]
    async fn test_detected_case_and_formats() {
        let producer = ScriptedProducer::new().with(
            Task::CaseDetection,
            json!({"case": "operator_quality", "formats": ["dialog_last_turn_correction", "haiku"], "reasoning": "corrections"}),
        );
        let fixture = Fixture::new(producer, fast_config());

        let selection = resolve_case(&fixture.context(), &[], &[]).await.unwrap();
        assert!(selection.detected);
        assert_eq!(selection.formats, vec![ExampleFormat::DialogLastTurnCorrection]);
    }

    #[tokio::test]
    async fn test_detection_failure_falls_back() {
        let producer = ScriptedProducer::new();
        producer.push_error(Task::CaseDetection, ProducerError::Fatal("401".into()));
        let fixture = Fixture::new(producer, fast_config());

        let selection = resolve_case(&fixture.context(), &[], &[]).await.unwrap();
        assert_eq!(selection, CaseSelection::fallback());
    }

    #[tokio::test]
    async fn test_configured_formats_override_detection() {
        let producer = ScriptedProducer::new()
            .with(Task::CaseDetection, json!({"case": "doctor_booking", "formats": []}));
        let mut config = fast_config();
        config.formats = vec![ExampleFormat::SingleUtteranceCorrection];
        let fixture = Fixture::new(producer, config);

        let selection = resolve_case(&fixture.context(), &[], &[]).await.unwrap();
        assert_eq!(selection.case, "doctor_booking");
        assert_eq!(selection.formats, vec![ExampleFormat::SingleUtteranceCorrection]);
    }
}
