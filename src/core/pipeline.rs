//! Generation settings and coverage thresholds.
//!
//! Settings can be given in YAML (the `generation` section of the config
//! file) and overridden per run from the command line.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::allocator::DEFAULT_TIER_CAP;
use crate::domain::ExampleFormat;

/// Minimum accepted counts per tier and relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageThresholds {
    #[serde(default = "default_min_use_cases")]
    pub min_use_cases: usize,

    #[serde(default = "default_min_policies")]
    pub min_policies: usize,

    /// Distinct policy types that must be present
    #[serde(default = "default_min_policy_types")]
    pub min_policy_types: usize,

    #[serde(default = "default_min_test_cases_per_use_case")]
    pub min_test_cases_per_use_case: usize,

    #[serde(default = "default_min_examples_per_test_case")]
    pub min_examples_per_test_case: usize,
}

fn default_min_use_cases() -> usize {
    5
}
fn default_min_policies() -> usize {
    5
}
fn default_min_policy_types() -> usize {
    2
}
fn default_min_test_cases_per_use_case() -> usize {
    3
}
fn default_min_examples_per_test_case() -> usize {
    1
}

impl Default for CoverageThresholds {
    fn default() -> Self {
        Self {
            min_use_cases: default_min_use_cases(),
            min_policies: default_min_policies(),
            min_policy_types: default_min_policy_types(),
            min_test_cases_per_use_case: default_min_test_cases_per_use_case(),
            min_examples_per_test_case: default_min_examples_per_test_case(),
        }
    }
}

/// How parameter-axis values are combined into example inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CombinationStrategy {
    /// Cover every pair of values across two axes with as few rows as possible
    #[default]
    Pairwise,
    /// Full cross-product of all axes
    Exhaustive,
}

/// Settings for one generation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub thresholds: CoverageThresholds,

    /// Proposal attempts per stage (including the first)
    #[serde(default = "default_max_attempts_per_stage")]
    pub max_attempts: u32,

    /// Concurrent producer calls within a stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub strategy: CombinationStrategy,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Model name passed through to the text producer
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature (0.0 is the deterministic mode)
    #[serde(default)]
    pub temperature: f64,

    /// Dataset case; detected from the artifacts when unset
    #[serde(default)]
    pub case: Option<String>,

    /// Example formats; derived from the case when empty
    #[serde(default)]
    pub formats: Vec<ExampleFormat>,

    /// Maximum discrete values per variation axis
    #[serde(default = "default_max_axis_values")]
    pub max_axis_values: usize,

    /// Hard cap on identifiers per tier
    #[serde(default = "default_id_cap")]
    pub id_cap: usize,

    /// Retry policy for transient producer failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_attempts_per_stage() -> u32 {
    3
}
fn default_concurrency() -> usize {
    4
}
fn default_seed() -> u64 {
    42
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_axis_values() -> usize {
    6
}
fn default_id_cap() -> usize {
    DEFAULT_TIER_CAP
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            thresholds: CoverageThresholds::default(),
            max_attempts: default_max_attempts_per_stage(),
            concurrency: default_concurrency(),
            strategy: CombinationStrategy::default(),
            seed: default_seed(),
            model: default_model(),
            temperature: 0.0,
            case: None,
            formats: Vec::new(),
            max_axis_values: default_max_axis_values(),
            id_cap: default_id_cap(),
            retry: RetryPolicy::default(),
        }
    }
}

impl GenerationConfig {
    /// Load generation settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read generation config: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse generation settings from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse generation config YAML")
    }

    /// Reject settings that can never produce a valid run
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        if self.model.trim().is_empty() {
            anyhow::bail!("model cannot be empty");
        }

        if self.max_axis_values < 2 {
            anyhow::bail!("max_axis_values must be at least 2");
        }

        if self.thresholds.min_policy_types > 5 {
            anyhow::bail!(
                "min_policy_types is {} but only 5 policy types exist",
                self.thresholds.min_policy_types
            );
        }

        if self.thresholds.min_policy_types > self.thresholds.min_policies.max(1) {
            anyhow::bail!(
                "min_policy_types ({}) cannot exceed min_policies ({})",
                self.thresholds.min_policy_types,
                self.thresholds.min_policies
            );
        }

        if let Some(unknown) = self.formats.iter().find(|f| !f.is_known()) {
            anyhow::bail!("Unknown example format '{}'", unknown);
        }

        Ok(())
    }
}

/// Retry policy for transient producer failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No retries and no delay (tests and offline runs)
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
