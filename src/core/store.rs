//! Output directory persistence.
//!
//! Layout of an output directory:
//!
//! ```text
//! out/
//!   use_cases.json      JSON array of use cases
//!   policies.json       JSON array of policies
//!   test_cases.json     JSON array of test cases
//!   dataset.json        JSON array of dataset examples
//!   run_manifest.json   run audit record
//!   events.jsonl        append-only run log
//! ```
//!
//! Tier files and the manifest are written atomically and only once the
//! whole run has succeeded. The run log is appended as the run progresses.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{ArtifactSet, Event, RunManifest, Tier};

pub const MANIFEST_FILE: &str = "run_manifest.json";
pub const EVENTS_FILE: &str = "events.jsonl";

/// A tier record that could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProblem {
    pub tier: Tier,
    /// Identifier of the offending record, when it has one
    pub artifact_id: Option<String>,
    /// Record position in the file (0-based)
    pub index: Option<usize>,
    pub message: String,
}

/// Artifacts read back from an output directory
#[derive(Debug, Clone, Default)]
pub struct LoadedArtifacts {
    pub set: ArtifactSet,
    /// Tiers whose file was missing or unreadable as a whole
    pub unavailable: BTreeSet<Tier>,
    pub problems: Vec<LoadProblem>,
}

/// Reads and writes one output directory
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tier_path(&self, tier: Tier) -> PathBuf {
        self.dir.join(tier.file_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    /// Create the output directory if needed
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", self.dir.display()))
    }

    /// Write every tier file, then the manifest
    ///
    /// All five files are staged as temp files and checked against their
    /// targets before any rename, so a write failure leaves the previous
    /// output untouched. The renames themselves are atomic per file.
    pub fn publish(&self, set: &ArtifactSet, manifest: &RunManifest) -> Result<()> {
        let staged = vec![
            self.stage(Tier::UseCase.file_name(), &set.use_cases)?,
            self.stage(Tier::Policy.file_name(), &set.policies)?,
            self.stage(Tier::TestCase.file_name(), &set.test_cases)?,
            self.stage(Tier::Example.file_name(), &set.examples)?,
            self.stage(MANIFEST_FILE, manifest)?,
        ];

        for (_, target) in &staged {
            if target.is_dir() {
                anyhow::bail!("Cannot publish over directory {}", target.display());
            }
        }

        for (tmp, target) in staged {
            tmp.persist(&target)
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }
        debug!(dir = %self.dir.display(), "Published artifacts");
        Ok(())
    }

    /// Serialize to a synced temp file in the output directory
    fn stage<T: Serialize + ?Sized>(&self, file_name: &str, value: &T) -> Result<(NamedTempFile, PathBuf)> {
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;

        serde_json::to_writer_pretty(&mut tmp, value)
            .with_context(|| format!("Failed to serialize {}", file_name))?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync {}", file_name))?;

        Ok((tmp, self.dir.join(file_name)))
    }

    /// Read the manifest, if the directory has one
    pub fn load_manifest(&self) -> Result<Option<RunManifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Read all four tiers, collecting problems instead of stopping at the first
    pub fn load_artifacts(&self) -> LoadedArtifacts {
        let mut loaded = LoadedArtifacts::default();

        loaded.set.use_cases = self.load_tier(Tier::UseCase, &mut loaded);
        loaded.set.policies = self.load_tier(Tier::Policy, &mut loaded);
        loaded.set.test_cases = self.load_tier(Tier::TestCase, &mut loaded);
        loaded.set.examples = self.load_tier(Tier::Example, &mut loaded);

        loaded
    }

    fn load_tier<T: DeserializeOwned>(&self, tier: Tier, loaded: &mut LoadedArtifacts) -> Vec<T> {
        let path = self.tier_path(tier);

        let records = match read_records(&path, tier) {
            Ok(records) => records,
            Err(message) => {
                loaded.unavailable.insert(tier);
                loaded.problems.push(LoadProblem {
                    tier,
                    artifact_id: None,
                    index: None,
                    message,
                });
                return Vec::new();
            }
        };

        let mut parsed = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let artifact_id = record
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            match serde_json::from_value::<T>(record) {
                Ok(value) => parsed.push(value),
                Err(e) => loaded.problems.push(LoadProblem {
                    tier,
                    artifact_id,
                    index: Some(index),
                    message: format!("Malformed {} record: {}", tier, e),
                }),
            }
        }
        parsed
    }
}

/// Wrapper key accepted for tier files written as `{"<key>": [...]}`
fn wrapper_key(tier: Tier) -> &'static str {
    match tier {
        Tier::UseCase => "use_cases",
        Tier::Policy => "policies",
        Tier::TestCase => "test_cases",
        Tier::Example => "examples",
    }
}

fn read_records(path: &Path, tier: Tier) -> Result<Vec<Value>, String> {
    if !path.exists() {
        return Err(format!("Missing file: {}", path.display()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let value: Value = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))?;

    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove(wrapper_key(tier)) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(format!(
                "{} must be a JSON array of {} records",
                path.display(),
                tier
            )),
        },
        _ => Err(format!(
            "{} must be a JSON array of {} records",
            path.display(),
            tier
        )),
    }
}

/// Append-only JSONL run log
///
/// Appends take an exclusive file lock. A log without a path discards events.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
    run_id: Uuid,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: Uuid) -> Self {
        Self {
            path: Some(path.into()),
            run_id,
        }
    }

    /// A log that records nothing
    pub fn disabled(run_id: Uuid) -> Self {
        Self { path: None, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append an event to the log
    pub fn append(&self, event: &Event) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        file.lock_exclusive()
            .context("Failed to acquire file lock on events.jsonl")?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(file, "{}", json).context("Failed to write event")?;
        file.flush().context("Failed to flush event")?;

        // Lock is released when file is dropped
        Ok(())
    }

    /// Append, downgrading failures to a warning; the log is diagnostic only
    pub fn record(&self, event: Event) {
        if let Err(e) = self.append(&event) {
            warn!(error = %e, "Failed to append run event");
        }
    }

    /// Replay all events in order
    pub fn replay(&self) -> Result<Vec<Event>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, ProducerInfo, UseCase};
    use crate::evidence::Evidence;
    use tempfile::TempDir;

    fn sample_set() -> ArtifactSet {
        ArtifactSet {
            use_cases: vec![UseCase {
                id: "uc_001".into(),
                name: "Order status".into(),
                description: "Customer asks about an order".into(),
                evidence: vec![Evidence::new("faq.md", 1, 1, "Where is my order?")],
            }],
            ..Default::default()
        }
    }

    fn sample_manifest(set: &ArtifactSet) -> RunManifest {
        RunManifest::new(
            Uuid::new_v4(),
            "faq.md".into(),
            "out".into(),
            1,
            "sha256:0".into(),
            "support_bot".into(),
            vec![],
            ProducerInfo {
                provider: "scripted".into(),
                model: "m".into(),
                temperature: 0.0,
                base_url: None,
            },
            set,
        )
    }

    #[test]
    fn test_publish_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = OutputStore::new(temp.path());
        let set = sample_set();

        store.publish(&set, &sample_manifest(&set)).unwrap();

        for tier in Tier::ALL {
            assert!(store.tier_path(tier).exists(), "{} missing", tier);
        }

        let loaded = store.load_artifacts();
        assert!(loaded.problems.is_empty());
        assert!(loaded.unavailable.is_empty());
        assert_eq!(loaded.set, set);

        let manifest = store.load_manifest().unwrap().unwrap();
        assert_eq!(manifest.counts["use_case"], 1);
    }

    #[test]
    fn test_failed_publish_keeps_previous_output() {
        let temp = TempDir::new().unwrap();
        let store = OutputStore::new(temp.path());
        let previous = r#"[{"id": "uc_001", "name": "Previous run"}]"#;
        std::fs::write(store.tier_path(Tier::UseCase), previous).unwrap();
        std::fs::create_dir(store.tier_path(Tier::Example)).unwrap();

        let set = sample_set();
        assert!(store.publish(&set, &sample_manifest(&set)).is_err());

        assert_eq!(std::fs::read_to_string(store.tier_path(Tier::UseCase)).unwrap(), previous);
        assert!(!store.manifest_path().exists());
        // Staged temp files are cleaned up
        let entries = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_tier_files_are_bare_arrays() {
        let temp = TempDir::new().unwrap();
        let store = OutputStore::new(temp.path());
        let set = sample_set();
        store.publish(&set, &sample_manifest(&set)).unwrap();

        let raw = std::fs::read_to_string(store.tier_path(Tier::UseCase)).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_missing_and_malformed_files_are_reported() {
        let temp = TempDir::new().unwrap();
        let store = OutputStore::new(temp.path());

        std::fs::write(store.tier_path(Tier::UseCase), "{not json").unwrap();
        std::fs::write(
            store.tier_path(Tier::Policy),
            r#"[{"id": "pol_001", "name": "x"}]"#,
        )
        .unwrap();

        let loaded = store.load_artifacts();
        assert!(loaded.unavailable.contains(&Tier::UseCase));
        assert!(loaded.unavailable.contains(&Tier::TestCase));
        assert!(loaded.unavailable.contains(&Tier::Example));
        assert!(!loaded.unavailable.contains(&Tier::Policy));

        let malformed = loaded
            .problems
            .iter()
            .find(|p| p.tier == Tier::Policy)
            .unwrap();
        assert_eq!(malformed.artifact_id.as_deref(), Some("pol_001"));
        assert_eq!(malformed.index, Some(0));
    }

    #[test]
    fn test_wrapped_tier_file_is_accepted() {
        let temp = TempDir::new().unwrap();
        let store = OutputStore::new(temp.path());
        let wrapped = serde_json::json!({ "use_cases": sample_set().use_cases });
        std::fs::write(store.tier_path(Tier::UseCase), wrapped.to_string()).unwrap();

        let loaded = store.load_artifacts();
        assert_eq!(loaded.set.use_cases.len(), 1);
        assert!(!loaded.unavailable.contains(&Tier::UseCase));
    }

    #[test]
    fn test_event_log_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let log = EventLog::new(temp.path().join(EVENTS_FILE), run_id);

        for i in 0..3 {
            log.append(&Event::new(
                run_id,
                Some(Tier::UseCase),
                EventType::StageStarted,
                format!("attempt {}", i),
            ))
            .unwrap();
        }

        let events = log.replay().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].summary, "attempt 2");
    }

    #[test]
    fn test_disabled_event_log() {
        let log = EventLog::disabled(Uuid::new_v4());
        log.record(Event::new(log.run_id(), None, EventType::RunStarted, "x".into()));
        assert!(log.replay().unwrap().is_empty());
    }
}
