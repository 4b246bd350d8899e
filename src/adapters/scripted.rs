//! Scripted producer that replays canned payloads.
//!
//! Each task has its own queue. Payloads are served in order and the last
//! one is repeated once the queue runs dry, so a script only needs one entry
//! per task for simple runs. Used for offline generation (`--script`) and
//! throughout the test suite.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ProducerError, ProducerSettings, Prompt, Task, TextProducer};

type Reply = Result<Value, ProducerError>;

#[derive(Default)]
struct Script {
    queues: BTreeMap<Task, VecDeque<Reply>>,
    last: BTreeMap<Task, Reply>,
    calls: Vec<(Task, Option<u64>)>,
}

/// Producer that answers from per-task payload queues
#[derive(Default)]
pub struct ScriptedProducer {
    script: Mutex<Script>,
}

impl ScriptedProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a script of the form `{"use_cases": [payload, ...], "policies": [...], ...}`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read producer script: {}", path.display()))?;
        let script: BTreeMap<Task, Vec<Value>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse producer script: {}", path.display()))?;

        let producer = Self::new();
        for (task, payloads) in script {
            for payload in payloads {
                producer.push(task, payload);
            }
        }
        Ok(producer)
    }

    /// Queue a payload for `task`
    pub fn push(&self, task: Task, payload: Value) -> &Self {
        self.push_reply(task, Ok(payload))
    }

    /// Queue a failure for `task`
    pub fn push_error(&self, task: Task, error: ProducerError) -> &Self {
        self.push_reply(task, Err(error))
    }

    fn push_reply(&self, task: Task, reply: Reply) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.queues.entry(task).or_default().push_back(reply);
        }
        self
    }

    /// Builder form of `push`
    pub fn with(self, task: Task, payload: Value) -> Self {
        self.push(task, payload);
        self
    }

    /// Number of calls received for `task`
    pub fn calls(&self, task: Task) -> usize {
        self.script
            .lock()
            .map(|s| s.calls.iter().filter(|(t, _)| *t == task).count())
            .unwrap_or(0)
    }

    /// Seeds received for `task`, in call order
    pub fn seeds(&self, task: Task) -> Vec<Option<u64>> {
        self.script
            .lock()
            .map(|s| {
                s.calls
                    .iter()
                    .filter(|(t, _)| *t == task)
                    .map(|(_, seed)| *seed)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextProducer for ScriptedProducer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        settings: &ProducerSettings,
    ) -> Result<Value, ProducerError> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| ProducerError::Fatal("Producer script lock poisoned".into()))?;

        script.calls.push((prompt.task, settings.seed));

        let next = script.queues.get_mut(&prompt.task).and_then(|q| q.pop_front());
        match next {
            Some(reply) => {
                script.last.insert(prompt.task, reply.clone());
                reply
            }
            None => script.last.get(&prompt.task).cloned().unwrap_or_else(|| {
                Err(ProducerError::Fatal(format!(
                    "No scripted payload for task '{}'",
                    prompt.task
                )))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn settings(seed: u64) -> ProducerSettings {
        ProducerSettings {
            model: "scripted".into(),
            temperature: 0.0,
            seed: Some(seed),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_queue_then_repeat_last() {
        let producer = ScriptedProducer::new()
            .with(Task::UseCases, json!({"n": 1}))
            .with(Task::UseCases, json!({"n": 2}));
        let prompt = Prompt::new(Task::UseCases, "", "");

        assert_eq!(producer.generate(&prompt, &settings(1)).await.unwrap()["n"], 1);
        assert_eq!(producer.generate(&prompt, &settings(2)).await.unwrap()["n"], 2);
        assert_eq!(producer.generate(&prompt, &settings(3)).await.unwrap()["n"], 2);

        assert_eq!(producer.calls(Task::UseCases), 3);
        assert_eq!(producer.seeds(Task::UseCases), vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_missing_task_is_fatal() {
        let producer = ScriptedProducer::new();
        let prompt = Prompt::new(Task::Policies, "", "");
        let result = producer.generate(&prompt, &settings(1)).await;
        assert!(matches!(result, Err(ProducerError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_scripted_errors() {
        let producer = ScriptedProducer::new();
        producer
            .push_error(Task::Examples, ProducerError::Transient("429".into()))
            .push(Task::Examples, json!({"ok": true}));
        let prompt = Prompt::new(Task::Examples, "", "");

        assert!(producer.generate(&prompt, &settings(1)).await.is_err());
        assert!(producer.generate(&prompt, &settings(1)).await.is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(
            &path,
            r#"{"use_cases": [{"use_cases": []}], "case_detection": [{"case": "support_bot"}]}"#,
        )
        .unwrap();

        let producer = ScriptedProducer::from_file(&path).unwrap();
        let script = producer.script.lock().unwrap();
        assert_eq!(script.queues[&Task::UseCases].len(), 1);
        assert_eq!(script.queues[&Task::CaseDetection].len(), 1);
    }
}
