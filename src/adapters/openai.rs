//! OpenAI-compatible chat completions producer.
//!
//! Sends `POST {base_url}/chat/completions` with a JSON-object response
//! format and parses the first choice's message content as JSON.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_json_payload, ProducerError, ProducerSettings, Prompt, TextProducer};
use crate::domain::ProducerInfo;

/// Default endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Producer backed by an OpenAI-compatible HTTP API
pub struct OpenAiProducer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiProducer {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(prompt: &Prompt, settings: &ProducerSettings) -> Value {
        let mut body = json!({
            "model": settings.model,
            "temperature": settings.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        if let Some(seed) = settings.seed {
            body["seed"] = json!(seed);
        }
        body
    }
}

/// Map an HTTP status to a producer error class
fn classify_status(status: StatusCode, body: &str) -> ProducerError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProducerError::Transient(detail)
    } else {
        ProducerError::Fatal(detail)
    }
}

#[async_trait]
impl TextProducer for OpenAiProducer {
    fn name(&self) -> &str {
        "openai"
    }

    fn info(&self, settings: &ProducerSettings) -> ProducerInfo {
        ProducerInfo {
            provider: self.name().to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            base_url: Some(self.base_url.clone()),
        }
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        settings: &ProducerSettings,
    ) -> Result<Value, ProducerError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .json(&Self::request_body(prompt, settings));

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ProducerError::Transient(format!("Request failed: {}", e))
            } else {
                ProducerError::Fatal(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProducerError::Fatal(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProducerError::Fatal("Response contained no message content".into()))?;

        parse_json_payload(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Task;
    use std::time::Duration;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_request_body_is_deterministic_json_mode() {
        let prompt = Prompt::new(Task::Policies, "sys", "usr");
        let settings = ProducerSettings {
            model: "gpt-4o-mini".into(),
            temperature: 0.0,
            seed: Some(7),
            timeout: Duration::from_secs(10),
        };

        let body = OpenAiProducer::request_body(&prompt, &settings);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let producer = OpenAiProducer::new("http://localhost:8080/v1/", None);
        assert_eq!(producer.endpoint(), "http://localhost:8080/v1/chat/completions");

        let settings = ProducerSettings {
            model: "m".into(),
            temperature: 0.0,
            seed: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            producer.info(&settings).base_url.as_deref(),
            Some("http://localhost:8080/v1/")
        );
    }
}
