//! Text producer interfaces.
//!
//! The producer is an opaque function from a prompt to a proposed JSON
//! payload. It may be slow, may fail transiently, and may return content
//! that does not match what was asked for; every integrity check lives in
//! the stages, never here.

pub mod openai;
pub mod scripted;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::RetryPolicy;
use crate::domain::ProducerInfo;

pub use openai::OpenAiProducer;
pub use scripted::ScriptedProducer;

/// What a prompt asks the producer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    UseCases,
    Policies,
    TestCases,
    Examples,
    CaseDetection,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::UseCases => "use_cases",
            Task::Policies => "policies",
            Task::TestCases => "test_cases",
            Task::Examples => "examples",
            Task::CaseDetection => "case_detection",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request to the producer
#[derive(Debug, Clone)]
pub struct Prompt {
    pub task: Task,
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(task: Task, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task,
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Per-call producer settings
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub model: String,
    pub temperature: f64,
    pub seed: Option<u64>,
    pub timeout: Duration,
}

/// Producer failures, split by whether a retry can help
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    /// Rate limits, timeouts, 5xx responses
    #[error("Transient producer failure: {0}")]
    Transient(String),

    /// Auth errors, bad requests, unparseable payloads
    #[error("Fatal producer failure: {0}")]
    Fatal(String),
}

impl ProducerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProducerError::Transient(_))
    }
}

/// Trait for text producers
#[async_trait]
pub trait TextProducer: Send + Sync {
    /// Human-readable producer name
    fn name(&self) -> &str;

    /// Settings recorded in the run manifest
    fn info(&self, settings: &ProducerSettings) -> ProducerInfo {
        ProducerInfo {
            provider: self.name().to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            base_url: None,
        }
    }

    /// Produce a JSON payload for `prompt`
    async fn generate(
        &self,
        prompt: &Prompt,
        settings: &ProducerSettings,
    ) -> Result<Value, ProducerError>;
}

/// Call the producer under a timeout, retrying transient failures only
///
/// A transient failure that outlives the retry budget is escalated to
/// `ProducerError::Fatal`.
pub async fn generate_with_retry(
    producer: &dyn TextProducer,
    prompt: &Prompt,
    settings: &ProducerSettings,
    policy: &RetryPolicy,
) -> Result<Value, ProducerError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        let result = match timeout(settings.timeout, producer.generate(prompt, settings)).await {
            Ok(result) => result,
            Err(_) => Err(ProducerError::Transient(format!(
                "{} call timed out after {:?}",
                prompt.task, settings.timeout
            ))),
        };

        match result {
            Ok(value) => {
                debug!(
                    producer = producer.name(),
                    task = %prompt.task,
                    attempt,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Producer call succeeded"
                );
                return Ok(value);
            }
            Err(ProducerError::Transient(msg)) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    producer = producer.name(),
                    task = %prompt.task,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "Producer call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(ProducerError::Transient(msg)) => {
                return Err(ProducerError::Fatal(format!(
                    "{} gave up after {} attempts: {}",
                    prompt.task, attempt, msg
                )));
            }
            Err(fatal) => return Err(fatal),
        }
    }
}

/// Parse a JSON object out of model text
///
/// Accepts bare JSON or JSON wrapped in a fenced code block.
pub fn parse_json_payload(text: &str) -> Result<Value, ProducerError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| ProducerError::Fatal(format!("Producer returned malformed JSON: {}", e)))
}
