//! Domain types for tracegen.
//!
//! This module contains the core data structures:
//! - Artifact: Records of the four tiers and their enumerations
//! - Events: Run log entries
//! - Manifest: Per-run audit record

pub mod artifact;
pub mod events;
pub mod manifest;

// Re-export commonly used types
pub use artifact::{
    ArtifactSet, DatasetExample, ExampleFormat, InputData, Message, Policy, PolicyType, Role,
    TestCase, Tier, UseCase, VariationAxis,
};
pub use events::{Event, EventType};
pub use manifest::{ProducerInfo, RunManifest};
