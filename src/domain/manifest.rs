//! Run manifest written next to the tier files.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{ArtifactSet, ExampleFormat, PolicyType};
use crate::core::CoverageThresholds;

/// Text producer settings actually used by a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerInfo {
    /// Provider name (e.g., "openai", "scripted")
    pub provider: String,
    /// Model name (e.g., "gpt-4o-mini")
    pub model: String,
    /// Sampling temperature (0.0 in deterministic mode)
    pub temperature: f64,
    /// Endpoint base URL for HTTP producers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Everything needed to audit or reproduce a generation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub input_path: String,
    pub out_path: String,
    pub seed: u64,
    pub timestamp: DateTime<Utc>,
    pub generator_version: String,
    /// `sha256:` digest of the input text at generation time
    pub input_sha256: String,
    pub case: String,
    pub formats: Vec<ExampleFormat>,
    pub llm: ProducerInfo,
    pub counts: BTreeMap<String, usize>,
    pub policy_types: Vec<PolicyType>,
    /// Coverage thresholds the run was held to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<CoverageThresholds>,
}

impl RunManifest {
    /// Generator version string recorded in manifests
    pub fn generator_version() -> String {
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Uuid,
        input_path: String,
        out_path: String,
        seed: u64,
        input_sha256: String,
        case: String,
        formats: Vec<ExampleFormat>,
        llm: ProducerInfo,
        set: &ArtifactSet,
    ) -> Self {
        Self {
            run_id,
            input_path,
            out_path,
            seed,
            timestamp: Utc::now(),
            generator_version: Self::generator_version(),
            input_sha256,
            case,
            formats,
            llm,
            counts: set.counts(),
            policy_types: set.policy_types(),
            thresholds: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: CoverageThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_serialization() {
        let manifest = RunManifest::new(
            Uuid::new_v4(),
            "input.md".into(),
            "out".into(),
            42,
            "sha256:abc".into(),
            "support_bot".into(),
            vec![ExampleFormat::SingleTurnQa],
            ProducerInfo {
                provider: "scripted".into(),
                model: "gpt-4o-mini".into(),
                temperature: 0.0,
                base_url: None,
            },
            &ArtifactSet::default(),
        );

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["seed"], 42);
        assert_eq!(json["llm"]["temperature"], 0.0);
        assert_eq!(json["formats"][0], "single_turn_qa");
        assert_eq!(json["counts"]["use_case"], 0);
        assert!(json["llm"].get("base_url").is_none());
        assert!(json.get("thresholds").is_none());
        assert!(json["generator_version"].as_str().unwrap().starts_with("tracegen "));
    }
}
