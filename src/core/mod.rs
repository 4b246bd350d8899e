//! Core orchestration logic.
//!
//! This module contains:
//! - Allocator: per-tier sequential identifiers
//! - Pipeline: generation settings and coverage thresholds
//! - Safety: safety limits and enforcement
//! - Store: output directory and run log persistence
//! - Orchestrator: main execution engine

pub mod allocator;
pub mod orchestrator;
pub mod pipeline;
pub mod safety;
pub mod store;

// Re-export commonly used types
pub use allocator::{find_duplicates, AllocError, IdAllocator, DEFAULT_TIER_CAP};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use pipeline::{CombinationStrategy, CoverageThresholds, GenerationConfig, RetryPolicy};
pub use safety::{CallBudget, SafetyLimits, SafetyViolation};
pub use store::{EventLog, LoadProblem, LoadedArtifacts, OutputStore};
