//! Safety Limits Integration Tests
//!
//! Tests for input and payload size limits, producer call caps, and the
//! denylist applied to input documents.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tracegen::adapters::{ScriptedProducer, Task};
use tracegen::config::ConfigFile;
use tracegen::core::{CallBudget, GenerationConfig, Orchestrator, SafetyLimits, SafetyViolation};

#[test]
fn test_max_input_bytes() {
    let limits = SafetyLimits {
        max_input_bytes: 100,
        ..Default::default()
    };
    let path = Path::new("rules.md");

    assert!(limits.check_input(path, &"x".repeat(50)).is_ok());
    // Input at exact limit
    assert!(limits.check_input(path, &"x".repeat(100)).is_ok());

    match limits.check_input(path, &"x".repeat(200)) {
        Err(SafetyViolation::InputTooLarge { bytes, limit }) => {
            assert_eq!(bytes, 200);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected InputTooLarge violation, got {:?}", other),
    }
}

#[test]
fn test_max_payload_bytes() {
    let limits = SafetyLimits {
        max_payload_bytes: 100,
        ..Default::default()
    };

    assert!(limits.check_payload(50).is_ok());
    assert!(limits.check_payload(100).is_ok());

    match limits.check_payload(200) {
        Err(SafetyViolation::PayloadTooLarge { bytes, limit }) => {
            assert_eq!(bytes, 200);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected PayloadTooLarge violation, got {:?}", other),
    }
}

#[test]
fn test_denylist_blocks_secret_documents() {
    let limits = SafetyLimits::default();

    assert!(limits.is_denylisted(".env"));
    assert!(limits.is_denylisted("config/.env.production"));
    assert!(limits.is_denylisted("docs/secrets.md"));
    assert!(limits.is_denylisted("aws-credentials.txt"));
    assert!(limits.is_denylisted("certs/ca.pem"));
    assert!(limits.is_denylisted("ssl/domain.key"));

    // The pattern is **/secrets*, so only names starting with "secrets" match
    assert!(!limits.is_denylisted("docs/my-secrets.md"));
}

#[test]
fn test_denylist_allows_policy_documents() {
    let limits = SafetyLimits::default();

    assert!(!limits.is_denylisted("policy.md"));
    assert!(!limits.is_denylisted("docs/operator_rules.txt"));
    assert!(!limits.is_denylisted("README.md"));
}

#[test]
fn test_check_input_with_denylisted_path() {
    let limits = SafetyLimits::default();
    let input = "Operators must not use capital letters.";

    assert!(limits.check_input(Path::new("docs/rules.md"), input).is_ok());

    match limits.check_input(Path::new(".env.local"), input) {
        Err(SafetyViolation::Denylisted { path }) => assert!(path.contains(".env.local")),
        other => panic!("Expected Denylisted violation, got {:?}", other),
    }
}

#[test]
fn test_producer_call_cap() {
    let limits = SafetyLimits {
        max_producer_calls: 3,
        ..Default::default()
    };
    let mut budget = CallBudget::new();

    for _ in 0..3 {
        assert!(limits.check_budget(&budget).is_ok());
        budget.record();
    }

    match limits.check_budget(&budget) {
        Err(SafetyViolation::CallCapReached { calls, limit }) => {
            assert_eq!(calls, 3);
            assert_eq!(limit, 3);
        }
        other => panic!("Expected CallCapReached violation, got {:?}", other),
    }
}

#[test]
fn test_safety_section_yaml_parsing() {
    let yaml = r#"
safety:
  max_producer_calls: 40
  max_input_bytes: 1048576
  run_timeout_seconds: 600
  denylist_patterns:
    - "**/*.password"
    - "**/private/*"
"#;

    let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
    let limits = file.safety;

    assert_eq!(limits.max_producer_calls, 40);
    assert_eq!(limits.max_input_bytes, 1048576);
    assert_eq!(limits.max_payload_bytes, 10 * 1024 * 1024);
    assert_eq!(limits.producer_timeout_seconds, 120);
    assert_eq!(limits.run_timeout_seconds, 600);

    // Custom patterns replace the defaults
    assert!(limits.is_denylisted("db.password"));
    assert!(limits.is_denylisted("docs/private/rules.md"));
    assert!(!limits.is_denylisted(".env"));
}

#[tokio::test]
async fn test_orchestrator_refuses_denylisted_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("secrets.md");
    std::fs::write(&input, "Operators must not use capital letters.\n").unwrap();
    let out = dir.path().join("out");

    let producer = Arc::new(ScriptedProducer::new());
    let err = Orchestrator::new(producer.clone(), GenerationConfig::default())
        .generate(&input, &out)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("denylist"));
    assert_eq!(producer.calls(Task::UseCases), 0);
    assert!(!out.exists());
}
