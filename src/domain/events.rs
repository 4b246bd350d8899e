//! Run log events.
//!
//! Every generation run appends its lifecycle to `events.jsonl` in the output
//! directory. The log is diagnostic only: tier files are never rebuilt from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Tier;

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Tier the event concerns (absent for run-level events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,

    /// Type of event
    pub event_type: EventType,

    /// Proposal attempt number (1-based) for stage events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Time taken in milliseconds (for completed stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, tier: Option<Tier>, event_type: EventType, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            tier,
            event_type,
            attempt: None,
            summary,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run completed and its files were published
    RunCompleted,

    /// A run failed; nothing was published
    RunFailed,

    /// A stage started proposing candidates
    StageStarted,

    /// A candidate was discarded (ungrounded, dangling, malformed, duplicate)
    CandidateRejected,

    /// A stage fell short of its threshold and is proposing again
    StageRetrying,

    /// A stage met its thresholds
    StageCompleted,

    /// A stage gave up
    StageFailed,

    /// The terminal integrity check ran
    Validated,
}
