//! Command-line interface for tracegen.
//!
//! Provides commands for generating a grounded dataset from a document,
//! validating an output directory, inspecting evidence, and showing the
//! resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::adapters::{OpenAiProducer, ScriptedProducer, TextProducer};
use crate::config::{self, ProviderKind, ResolvedConfig};
use crate::core::{CombinationStrategy, Orchestrator, OutputStore, RunOutcome};
use crate::domain::{ExampleFormat, RunManifest};
use crate::evidence::DocumentModel;
use crate::validate::{ValidationInput, ValidationSettings, Validator};

pub mod evidence;

/// tracegen - evidence-grounded evaluation dataset generator
#[derive(Parser, Debug)]
#[command(name = "tracegen")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (skips .tracegen/config.yaml discovery)
    #[arg(long, global = true, env = "TRACEGEN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate use cases, policies, test cases, and examples from a document
    Generate {
        /// Source document
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "out")]
        out: PathBuf,

        /// Seed passed to the text producer
        #[arg(long)]
        seed: Option<u64>,

        /// Model name
        #[arg(long)]
        model: Option<String>,

        /// Minimum number of use cases
        #[arg(long)]
        n_use_cases: Option<usize>,

        /// Minimum number of policies
        #[arg(long)]
        n_policies: Option<usize>,

        /// Minimum number of test cases per use case
        #[arg(long = "n-test-cases-per-uc")]
        n_test_cases_per_uc: Option<usize>,

        /// Minimum number of examples per test case
        #[arg(long = "n-examples-per-tc")]
        n_examples_per_tc: Option<usize>,

        /// Dataset case (detected when omitted)
        #[arg(long)]
        case: Option<String>,

        /// Example format; repeat for several
        #[arg(long = "format", value_parser = parse_format)]
        formats: Vec<ExampleFormat>,

        /// How axis values are combined
        #[arg(long, value_enum)]
        strategy: Option<CombinationStrategy>,

        /// Concurrent producer calls
        #[arg(long)]
        concurrency: Option<usize>,

        /// Replay producer payloads from a script file instead of calling a model
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Validate an output directory
    Validate {
        /// Output directory to check
        #[arg(short, long, default_value = "out")]
        out: PathBuf,

        /// Treat weak fuzzy grounding as an error
        #[arg(long)]
        strict: bool,

        /// Source document (defaults to the path in the run manifest)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect evidence
    Evidence {
        #[command(subcommand)]
        command: evidence::EvidenceCommands,
    },

    /// Show resolved configuration
    Config,
}

fn parse_format(value: &str) -> Result<ExampleFormat, String> {
    let format = ExampleFormat::from(value.to_string());
    if format.is_known() {
        Ok(format)
    } else {
        let known: Vec<&str> = ExampleFormat::KNOWN.iter().map(|f| f.as_str()).collect();
        Err(format!("unknown format '{}' (expected one of: {})", value, known.join(", ")))
    }
}

/// Generation flags that override configuration
#[derive(Debug, Default)]
struct GenerateOverrides {
    seed: Option<u64>,
    model: Option<String>,
    n_use_cases: Option<usize>,
    n_policies: Option<usize>,
    n_test_cases_per_uc: Option<usize>,
    n_examples_per_tc: Option<usize>,
    case: Option<String>,
    formats: Vec<ExampleFormat>,
    strategy: Option<CombinationStrategy>,
    concurrency: Option<usize>,
    script: Option<PathBuf>,
}

impl GenerateOverrides {
    fn apply(self, cfg: &mut ResolvedConfig) {
        let generation = &mut cfg.generation;
        if let Some(seed) = self.seed {
            generation.seed = seed;
        }
        if let Some(model) = self.model {
            generation.model = model;
        }
        if let Some(n) = self.n_use_cases {
            generation.thresholds.min_use_cases = n;
        }
        if let Some(n) = self.n_policies {
            generation.thresholds.min_policies = n;
        }
        if let Some(n) = self.n_test_cases_per_uc {
            generation.thresholds.min_test_cases_per_use_case = n;
        }
        if let Some(n) = self.n_examples_per_tc {
            generation.thresholds.min_examples_per_test_case = n;
        }
        if let Some(case) = self.case {
            generation.case = Some(case);
        }
        if !self.formats.is_empty() {
            generation.formats = self.formats;
        }
        if let Some(strategy) = self.strategy {
            generation.strategy = strategy;
        }
        if let Some(concurrency) = self.concurrency {
            generation.concurrency = concurrency;
        }
        if let Some(script) = self.script {
            cfg.producer.provider = ProviderKind::Scripted;
            cfg.producer.script = Some(script);
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => config::load(Some(path.as_path()))?,
            None => config::config()?.clone(),
        };

        match self.command {
            Commands::Generate {
                input,
                out,
                seed,
                model,
                n_use_cases,
                n_policies,
                n_test_cases_per_uc,
                n_examples_per_tc,
                case,
                formats,
                strategy,
                concurrency,
                script,
            } => {
                let overrides = GenerateOverrides {
                    seed,
                    model,
                    n_use_cases,
                    n_policies,
                    n_test_cases_per_uc,
                    n_examples_per_tc,
                    case,
                    formats,
                    strategy,
                    concurrency,
                    script,
                };
                generate(cfg, overrides, &input, &out).await
            }
            Commands::Validate {
                out,
                strict,
                input,
                json,
            } => validate(&cfg, &out, strict, input.as_deref(), json).await,
            Commands::Evidence { command } => evidence::execute(&cfg, command).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Build the text producer named by the configuration
fn build_producer(cfg: &ResolvedConfig) -> Result<Arc<dyn TextProducer>> {
    match cfg.producer.provider {
        ProviderKind::Scripted => {
            let path = cfg
                .producer
                .script
                .as_ref()
                .context("Scripted provider needs a script (producer.script or --script)")?;
            info!(script = %path.display(), "Using scripted producer");
            Ok(Arc::new(ScriptedProducer::from_file(path)?))
        }
        ProviderKind::Openai => {
            if cfg.producer.api_key.is_none() {
                warn!(
                    env = %cfg.producer.api_key_env,
                    "No API key set; requests are sent without authorization"
                );
            }
            Ok(Arc::new(OpenAiProducer::new(
                cfg.producer.base_url.clone(),
                cfg.producer.api_key.clone(),
            )))
        }
    }
}

/// Run generation, cancelling cleanly on Ctrl-C
async fn generate(mut cfg: ResolvedConfig, overrides: GenerateOverrides, input: &Path, out: &Path) -> Result<()> {
    overrides.apply(&mut cfg);
    cfg.generation.validate()?;

    let producer = build_producer(&cfg)?;
    let orchestrator = Orchestrator::new(producer, cfg.generation.clone())
        .with_limits(cfg.safety.clone())
        .with_matcher(cfg.matcher.clone())
        .with_validation(cfg.validation.clone());

    let outcome = tokio::select! {
        result = orchestrator.generate(input, out) => result?,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Interrupted; nothing was published to {}", out.display());
        }
    };

    print_summary(&outcome);
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let manifest = &outcome.manifest;
    let formats: Vec<&str> = manifest.formats.iter().map(|f| f.as_str()).collect();
    let types: Vec<&str> = manifest.policy_types.iter().map(|t| t.as_str()).collect();

    println!("Run {} completed", outcome.run_id);
    println!();
    println!("  Use cases:   {}", outcome.set.use_cases.len());
    println!("  Policies:    {} ({})", outcome.set.policies.len(), types.join(", "));
    println!("  Test cases:  {}", outcome.set.test_cases.len());
    println!("  Examples:    {}", outcome.set.examples.len());
    println!();
    println!("  Case:        {}", manifest.case);
    println!("  Formats:     {}", formats.join(", "));
    println!("  Model:       {} ({})", manifest.llm.model, manifest.llm.provider);
    println!("  Calls:       {}", outcome.producer_calls);
    println!("  Output:      {}", outcome.out_dir.display());
    if !outcome.report.warnings.is_empty() {
        println!();
        println!("  {} warnings (run `tracegen validate --out {}`)", outcome.report.warnings.len(), outcome.out_dir.display());
    }
}

/// Load the source document for validation: explicit path first, then the manifest's
pub(crate) async fn load_source(input: Option<&Path>, manifest: Option<&RunManifest>) -> Option<DocumentModel> {
    let path = match (input, manifest) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(manifest)) => PathBuf::from(&manifest.input_path),
        (None, None) => return None,
    };

    match DocumentModel::load(&path).await {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("{:#}", e);
            None
        }
    }
}

/// Read the manifest, treating an unreadable one as absent
pub(crate) fn load_manifest(store: &OutputStore) -> Option<RunManifest> {
    match store.load_manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("{:#}", e);
            None
        }
    }
}

async fn validate(cfg: &ResolvedConfig, out: &Path, strict: bool, input: Option<&Path>, json: bool) -> Result<()> {
    if !out.is_dir() {
        anyhow::bail!("Output directory not found: {}", out.display());
    }

    let store = OutputStore::new(out);
    let loaded = store.load_artifacts();
    let manifest = load_manifest(&store);
    let document = load_source(input, manifest.as_ref()).await;

    let thresholds = manifest
        .as_ref()
        .and_then(|m| m.thresholds.clone())
        .unwrap_or_else(|| cfg.generation.thresholds.clone());
    let settings = ValidationSettings {
        strict: strict || cfg.validation.strict,
        ..cfg.validation.clone()
    };
    let validator = Validator::new(settings, thresholds, cfg.matcher.clone());
    let report = validator.validate(&ValidationInput::loaded(&loaded, document.as_ref(), manifest.as_ref()));

    if json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
    } else {
        print!("{}", report.render());
    }

    if !report.pass {
        std::process::exit(1);
    }
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!("{}", cfg.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_flags() {
        let cli = Cli::try_parse_from([
            "tracegen",
            "generate",
            "--input",
            "docs/rules.md",
            "--n-use-cases",
            "3",
            "--n-test-cases-per-uc",
            "2",
            "--format",
            "dialog_last_turn_correction",
            "--format",
            "single-utterance-correction",
            "--strategy",
            "exhaustive",
        ])
        .unwrap();

        match cli.command {
            Commands::Generate {
                input,
                out,
                n_use_cases,
                n_test_cases_per_uc,
                formats,
                strategy,
                ..
            } => {
                assert_eq!(input, PathBuf::from("docs/rules.md"));
                assert_eq!(out, PathBuf::from("out"));
                assert_eq!(n_use_cases, Some(3));
                assert_eq!(n_test_cases_per_uc, Some(2));
                assert_eq!(
                    formats,
                    vec![
                        ExampleFormat::DialogLastTurnCorrection,
                        ExampleFormat::SingleUtteranceCorrection
                    ]
                );
                assert_eq!(strategy, Some(CombinationStrategy::Exhaustive));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_format_rejected() {
        let result = Cli::try_parse_from(["tracegen", "generate", "--input", "a.md", "--format", "haiku"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let mut cfg = ResolvedConfig::default();
        GenerateOverrides {
            seed: Some(7),
            n_policies: Some(4),
            case: Some("operator_quality".into()),
            script: Some(PathBuf::from("script.json")),
            ..Default::default()
        }
        .apply(&mut cfg);

        assert_eq!(cfg.generation.seed, 7);
        assert_eq!(cfg.generation.thresholds.min_policies, 4);
        assert_eq!(cfg.generation.case.as_deref(), Some("operator_quality"));
        assert_eq!(cfg.producer.provider, ProviderKind::Scripted);
        // untouched settings keep their defaults
        assert_eq!(cfg.generation.thresholds.min_use_cases, 5);
    }

    #[test]
    fn test_validate_flags() {
        let cli = Cli::try_parse_from(["tracegen", "validate", "--out", "run1", "--strict", "--json"]).unwrap();
        match cli.command {
            Commands::Validate { out, strict, input, json } => {
                assert_eq!(out, PathBuf::from("run1"));
                assert!(strict);
                assert!(json);
                assert!(input.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
