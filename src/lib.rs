//! tracegen - Evidence-grounded test dataset generator
//!
//! Turns a policy document into four linked tiers of test artifacts (use
//! cases, policies, test cases, dataset examples) and guarantees that every
//! claim is quoted from the source and every reference resolves.
//!
//! # Architecture
//!
//! Generation is a staged pipeline:
//! - The input is parsed once into a line-indexed `DocumentModel`
//! - Each tier stage asks a `TextProducer` for candidates and admits only
//!   those whose quotes ground and whose references resolve
//! - Identifiers are allocated per tier on acceptance
//! - Nothing is written until the terminal integrity check passes
//!
//! # Modules
//!
//! - `evidence`: Document model and quote matching
//! - `domain`: Artifact records, run log events, run manifest
//! - `adapters`: Text producers (OpenAI-compatible, scripted)
//! - `stages`: Per-tier extraction and generation
//! - `core`: Orchestrator, ID allocation, safety limits, output store
//! - `validate`: Standalone integrity validator
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Generate the four tiers
//! tracegen generate -i policy.md -o out/
//!
//! # Re-check a directory
//! tracegen validate --out out/ --strict
//!
//! # Inspect the evidence behind an artifact
//! tracegen evidence show uc_003 -o out/
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod evidence;
pub mod stages;
pub mod validate;

// Re-export main types at crate root for convenience
pub use adapters::{OpenAiProducer, ScriptedProducer, TextProducer};
pub use core::{GenerationConfig, IdAllocator, Orchestrator, OutputStore, RunOutcome};
pub use domain::{ArtifactSet, DatasetExample, Policy, RunManifest, TestCase, Tier, UseCase};
pub use evidence::{DocumentModel, Evidence, GroundingVerdict, QuoteMatcher};
pub use validate::{Report, ValidationSettings, Validator};
