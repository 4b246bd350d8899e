//! Main orchestrator for generation runs.
//!
//! Sequences the tier stages, enforces safety limits, logs the run, and
//! publishes the four tier files plus the manifest only after the terminal
//! integrity check passes. A failed, timed-out, or cancelled run publishes
//! nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::TextProducer;
use crate::domain::{ArtifactSet, Event, EventType, RunManifest};
use crate::evidence::{DocumentModel, QuoteMatcher};
use crate::stages::{self, CaseSelection, StageContext, StageError};
use crate::validate::{Report, ValidationSettings, Validator};

use super::allocator::IdAllocator;
use super::pipeline::GenerationConfig;
use super::safety::SafetyLimits;
use super::store::{EventLog, OutputStore};

/// What a successful run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub out_dir: PathBuf,
    pub set: ArtifactSet,
    pub manifest: RunManifest,
    /// Terminal (lenient) validation report
    pub report: Report,
    pub producer_calls: u32,
}

/// Main generation orchestrator
pub struct Orchestrator {
    producer: Arc<dyn TextProducer>,
    config: GenerationConfig,
    limits: SafetyLimits,
    matcher: QuoteMatcher,
    validation: ValidationSettings,
}

impl Orchestrator {
    /// Create an orchestrator with default limits, matcher, and validation settings
    pub fn new(producer: Arc<dyn TextProducer>, config: GenerationConfig) -> Self {
        Self {
            producer,
            config,
            limits: SafetyLimits::default(),
            matcher: QuoteMatcher::default(),
            validation: ValidationSettings::default(),
        }
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_matcher(mut self, matcher: QuoteMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Validation settings for the terminal check (always run lenient)
    pub fn with_validation(mut self, validation: ValidationSettings) -> Self {
        self.validation = validation;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate the four tiers from `input` and publish them into `out_dir`
    #[instrument(skip_all, fields(input = %input.display(), out = %out_dir.display()))]
    pub async fn generate(&self, input: &Path, out_dir: &Path) -> Result<RunOutcome> {
        self.config.validate()?;

        let text = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read input document: {}", input.display()))?;
        self.limits.check_input(input, &text)?;
        if text.trim().is_empty() {
            anyhow::bail!("Input document is empty: {}", input.display());
        }
        let document = DocumentModel::build(input.to_string_lossy(), &text);

        let store = OutputStore::new(out_dir);
        store.ensure_dir().await?;

        let run_id = Uuid::new_v4();
        let events = EventLog::new(store.events_path(), run_id);
        info!(%run_id, lines = document.len(), "Starting generation run");

        events.record(Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!(
                "Generating from '{}' ({} lines, seed {})",
                document.file_name(),
                document.len(),
                self.config.seed
            ),
        ));

        let started = Instant::now();
        let ctx = StageContext::new(
            &document,
            self.producer.as_ref(),
            &self.config,
            &self.limits,
            &self.matcher,
            &events,
        );

        let (set, selection) = match timeout(self.limits.run_timeout(), self.run_stages(&ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(stage_error)) => return Err(self.fail_stage(&events, stage_error)),
            Err(_) => {
                let message = format!(
                    "Run timed out after {}s",
                    self.limits.run_timeout_seconds
                );
                error!(%run_id, "{}", message);
                events.record(
                    Event::new(run_id, None, EventType::RunFailed, "Run timed out".into())
                        .with_error(message.clone()),
                );
                anyhow::bail!(message);
            }
        };

        let report = self.terminal_check(&events, &set, &document)?;

        let manifest = RunManifest::new(
            run_id,
            input.to_string_lossy().into_owned(),
            out_dir.to_string_lossy().into_owned(),
            self.config.seed,
            document.digest().to_string(),
            selection.case.clone(),
            selection.formats.clone(),
            ctx.producer_info(),
            &set,
        )
        .with_thresholds(self.config.thresholds.clone());

        if let Err(e) = store.publish(&set, &manifest) {
            events.record(
                Event::new(run_id, None, EventType::RunFailed, "Publishing failed".into())
                    .with_error(format!("{:#}", e)),
            );
            return Err(e);
        }

        let producer_calls = ctx.producer_calls();
        let duration = started.elapsed().as_millis() as u64;
        events.record(
            Event::new(
                run_id,
                None,
                EventType::RunCompleted,
                format!(
                    "{} use cases, {} policies, {} test cases, {} examples",
                    set.use_cases.len(),
                    set.policies.len(),
                    set.test_cases.len(),
                    set.examples.len()
                ),
            )
            .with_duration(duration),
        );
        info!(
            %run_id,
            producer_calls,
            duration_ms = duration,
            warnings = report.warnings.len(),
            "Generation run completed"
        );

        Ok(RunOutcome {
            run_id,
            out_dir: out_dir.to_path_buf(),
            set,
            manifest,
            report,
            producer_calls,
        })
    }

    /// Run the stages in dependency order
    async fn run_stages(&self, ctx: &StageContext<'_>) -> Result<(ArtifactSet, CaseSelection), StageError> {
        let mut alloc = IdAllocator::with_cap(self.config.id_cap);

        let use_cases = stages::use_cases::extract(ctx, &mut alloc).await?;
        let policies = stages::policies::extract(ctx, &mut alloc).await?;
        let selection = stages::resolve_case(ctx, &use_cases, &policies).await?;
        let test_cases =
            stages::test_cases::generate(ctx, &mut alloc, &use_cases, &policies, &selection).await?;
        let examples = stages::examples::generate(
            ctx,
            &mut alloc,
            &use_cases,
            &policies,
            &test_cases,
            &selection,
        )
        .await?;

        let set = ArtifactSet {
            use_cases,
            policies,
            test_cases,
            examples,
        };
        Ok((set, selection))
    }

    /// Log a stage failure and turn it into the run's error
    fn fail_stage(&self, events: &EventLog, stage_error: StageError) -> anyhow::Error {
        let run_id = events.run_id();
        let attempt = match &stage_error {
            StageError::CoverageShortfall { attempts, .. } => Some(*attempts),
            StageError::Producer { attempt, .. } => Some(*attempt),
            _ => None,
        };
        let message = stage_error.to_string();
        error!(%run_id, tier = ?stage_error.tier(), ?attempt, "{}", message);

        let mut failed = Event::new(run_id, stage_error.tier(), EventType::StageFailed, message.clone())
            .with_error(message.clone());
        if let Some(attempt) = attempt {
            failed = failed.with_attempt(attempt);
        }
        events.record(failed);
        events.record(
            Event::new(run_id, None, EventType::RunFailed, "Run failed; nothing published".into())
                .with_error(message),
        );

        anyhow::Error::new(stage_error).context("Generation run failed")
    }

    /// Lenient integrity check over the accepted set before anything is written
    fn terminal_check(&self, events: &EventLog, set: &ArtifactSet, document: &DocumentModel) -> Result<Report> {
        let validator = Validator::new(
            ValidationSettings {
                strict: false,
                ..self.validation.clone()
            },
            self.config.thresholds.clone(),
            self.matcher.clone(),
        );
        let report = validator.validate_set(set, Some(document));
        let run_id = events.run_id();

        events.record(Event::new(
            run_id,
            None,
            EventType::Validated,
            format!(
                "{} errors, {} warnings",
                report.errors.len(),
                report.warnings.len()
            ),
        ));
        for warning in &report.warnings {
            warn!(%run_id, "{}", warning);
        }

        if !report.pass {
            let first: Vec<String> = report.errors.iter().take(5).map(|f| f.to_string()).collect();
            let message = format!(
                "Terminal validation found {} errors: {}",
                report.errors.len(),
                first.join("; ")
            );
            error!(%run_id, "{}", message);
            events.record(
                Event::new(run_id, None, EventType::RunFailed, "Terminal validation failed".into())
                    .with_error(message.clone()),
            );
            anyhow::bail!(message);
        }

        Ok(report)
    }
}
