//! Run limits: input admission, producer call budget, and timeouts.
//!
//! The denylist keeps secret-looking files (`.env`, keys, credentials) out of
//! prompts. It is checked before the size cap, so a denylisted file is never
//! reported as merely too large.

use std::path::Path;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MB: u64 = 1024 * 1024;

/// Limits applied to one generation run (`safety` config section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_producer_calls: u32,
    pub max_input_bytes: u64,
    /// Largest single producer payload accepted
    pub max_payload_bytes: u64,
    pub producer_timeout_seconds: u64,
    pub run_timeout_seconds: u64,
    /// Glob patterns; a configured list replaces the built-in one
    pub denylist_patterns: Vec<String>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_producer_calls: 500,
            max_input_bytes: 10 * MB,
            max_payload_bytes: 10 * MB,
            producer_timeout_seconds: 120,
            run_timeout_seconds: 60 * 60,
            denylist_patterns: ["**/.env*", "**/secrets*", "**/*credential*", "**/*.pem", "**/*.key"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SafetyLimits {
    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Whether `path` matches a denylist pattern. Invalid patterns never match.
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Admit an input document read from `path`
    pub fn check_input(&self, path: &Path, text: &str) -> Result<(), SafetyViolation> {
        let path = path.to_string_lossy();
        if self.is_denylisted(&path) {
            return Err(SafetyViolation::Denylisted {
                path: path.into_owned(),
            });
        }

        let bytes = text.len() as u64;
        if bytes > self.max_input_bytes {
            return Err(SafetyViolation::InputTooLarge {
                bytes,
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    pub fn check_payload(&self, bytes: u64) -> Result<(), SafetyViolation> {
        if bytes > self.max_payload_bytes {
            return Err(SafetyViolation::PayloadTooLarge {
                bytes,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Whether another producer call fits in the run's budget
    pub fn check_budget(&self, budget: &CallBudget) -> Result<(), SafetyViolation> {
        if budget.calls >= self.max_producer_calls {
            return Err(SafetyViolation::CallCapReached {
                calls: budget.calls,
                limit: self.max_producer_calls,
            });
        }

        let elapsed = budget.started.elapsed();
        if elapsed >= self.run_timeout() {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed.as_secs(),
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Producer calls spent so far in a run
#[derive(Debug, Clone)]
pub struct CallBudget {
    pub calls: u32,
    pub started: Instant,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl CallBudget {
    pub fn new() -> Self {
        Self {
            calls: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self) {
        self.calls += 1;
    }
}

#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Producer call cap reached: {calls} of {limit}")]
    CallCapReached { calls: u32, limit: u32 },

    #[error("Input document is {bytes} bytes, limit is {limit}")]
    InputTooLarge { bytes: u64, limit: u64 },

    #[error("Producer payload is {bytes} bytes, limit is {limit}")]
    PayloadTooLarge { bytes: u64, limit: u64 },

    #[error("Run timed out after {elapsed_seconds}s (limit {limit_seconds}s)")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },

    #[error("Input path {path} matches the denylist")]
    Denylisted { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_producer_calls, 500);
        assert_eq!(limits.max_input_bytes, 10 * MB);
        assert_eq!(limits.producer_timeout(), Duration::from_secs(120));
        assert_eq!(limits.run_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_denylist_checked_before_size() {
        let limits = SafetyLimits {
            max_input_bytes: 4,
            ..Default::default()
        };

        assert!(limits.check_input(Path::new("rules.md"), "short").is_err());
        assert!(matches!(
            limits.check_input(Path::new("config/.env"), "far too long"),
            Err(SafetyViolation::Denylisted { .. })
        ));
    }

    #[test]
    fn test_budget_counts_calls() {
        let limits = SafetyLimits {
            max_producer_calls: 2,
            ..Default::default()
        };

        let mut budget = CallBudget::new();
        assert!(limits.check_budget(&budget).is_ok());
        budget.record();
        assert!(limits.check_budget(&budget).is_ok());
        budget.record();
        assert!(matches!(
            limits.check_budget(&budget),
            Err(SafetyViolation::CallCapReached { calls: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let limits: SafetyLimits = serde_yaml::from_str("max_payload_bytes: 2048").unwrap();
        assert_eq!(limits.max_payload_bytes, 2048);
        assert_eq!(limits.max_producer_calls, 500);
    }
}
