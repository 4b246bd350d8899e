//! Timeout Integration Tests
//!
//! Tests for per-call and whole-run timeouts and retry backoff.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use tracegen::adapters::{
    generate_with_retry, ProducerError, ProducerSettings, Prompt, Task, TextProducer,
};
use tracegen::core::{GenerationConfig, Orchestrator, RetryPolicy, SafetyLimits};
use tracegen::domain::Tier;
use tracegen::stages::StageError;

/// Producer that never answers within any sensible deadline
struct Stalled {
    calls: AtomicU32,
}

#[async_trait]
impl TextProducer for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn generate(&self, _: &Prompt, _: &ProducerSettings) -> Result<Value, ProducerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

fn write_input(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("rules.md");
    std::fs::write(&path, "Operators must not use capital letters.\n").unwrap();
    path
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 1,
        backoff_multiplier: 1.0,
    }
}

#[tokio::test]
async fn test_call_timeout_is_retried_then_fatal() {
    let producer = Stalled {
        calls: AtomicU32::new(0),
    };
    let settings = ProducerSettings {
        model: "test".into(),
        temperature: 0.0,
        seed: Some(1),
        timeout: Duration::from_millis(50),
    };
    let prompt = Prompt::new(Task::UseCases, "system", "user");

    let started = Instant::now();
    let result = generate_with_retry(&producer, &prompt, &settings, &fast_retry(2)).await;

    assert!(matches!(result, Err(ProducerError::Fatal(ref msg)) if msg.contains("timed out")));
    assert_eq!(producer.calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stage_reports_producer_timeout() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir);
    let out = dir.path().join("out");

    let limits = SafetyLimits {
        producer_timeout_seconds: 1,
        ..Default::default()
    };
    let config = GenerationConfig {
        retry: RetryPolicy::none(),
        ..Default::default()
    };
    let producer = Arc::new(Stalled {
        calls: AtomicU32::new(0),
    });

    let err = Orchestrator::new(producer.clone(), config)
        .with_limits(limits)
        .generate(&input, &out)
        .await
        .unwrap_err();

    match err.downcast_ref::<StageError>() {
        Some(StageError::Producer { tier, attempt, .. }) => {
            assert_eq!(*tier, Tier::UseCase);
            assert_eq!(*attempt, 1);
        }
        other => panic!("expected producer failure, got {:?}", other),
    }
    assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    assert!(!out.join("use_cases.json").exists());
}

#[tokio::test]
async fn test_run_timeout_stops_generation() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir);
    let out = dir.path().join("out");

    let limits = SafetyLimits {
        producer_timeout_seconds: 60,
        run_timeout_seconds: 1,
        ..Default::default()
    };
    let config = GenerationConfig {
        retry: RetryPolicy::none(),
        ..Default::default()
    };

    let started = Instant::now();
    let err = Orchestrator::new(Arc::new(Stalled { calls: AtomicU32::new(0) }), config)
        .with_limits(limits)
        .generate(&input, &out)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!out.join("run_manifest.json").exists());
}

#[test]
fn test_retry_delay_calculation() {
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2.0,
    };

    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    // Capped at max_delay_ms
    assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));

    assert!(policy.should_retry(4));
    assert!(!policy.should_retry(5));
}

#[test]
fn test_no_retry_policy() {
    let policy = RetryPolicy::none();
    assert!(!policy.should_retry(1));
    assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
}
