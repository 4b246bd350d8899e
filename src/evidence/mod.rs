//! Evidence grounding against a line-indexed source document
//!
//! Every use case and policy carries one or more `Evidence` entries. An entry
//! is only trusted once `QuoteMatcher::verify` has tied its quote to the
//! claimed line range of the `DocumentModel`.
//!
//! # Design Principles
//!
//! - **One model per input**: the document is parsed once and shared read-only
//! - **Cheapest check first**: exact, then normalized, then fuzzy
//! - **Reject, don't patch**: an ungrounded quote is never rewritten to fit
//!
//! # Example
//!
//! ```
//! use tracegen::evidence::{DocumentModel, Evidence, GroundingVerdict, QuoteMatcher};
//!
//! let doc = DocumentModel::build("rules.md", "Operators must not use capital letters.");
//! let evidence = Evidence::new("rules.md", 1, 1, "Operators  must not use capital letters.");
//!
//! let verdict = QuoteMatcher::default().verify(&evidence, &doc);
//! assert_eq!(verdict, GroundingVerdict::Normalized);
//! ```

pub mod document;
pub mod matcher;
pub mod types;

pub use document::{compute_hash, normalized, DocumentModel, Line, LineSeparator, RangeError};
pub use matcher::{locate, QuoteMatcher, SimilarityMetric};
pub use types::{Evidence, GroundingVerdict, UngroundedReason};
