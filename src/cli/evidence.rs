//! Evidence CLI subcommands for inspecting grounding.
//!
//! Provides commands to:
//! - `show`: display the evidence behind an artifact with its source lines
//! - `check`: ground an ad-hoc quote against a document

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config::ResolvedConfig;
use crate::core::OutputStore;
use crate::domain::ArtifactSet;
use crate::evidence::{locate, DocumentModel, Evidence, GroundingVerdict, QuoteMatcher};

use super::{load_manifest, load_source};

/// Evidence-related subcommands
#[derive(Subcommand, Debug)]
pub enum EvidenceCommands {
    /// Show the evidence of an artifact (test cases and examples show their use case's)
    Show {
        /// Artifact identifier (e.g., uc_001, pol_003, tc_002, ex_010)
        artifact_id: String,

        /// Output directory holding the artifacts
        #[arg(short, long, default_value = "out")]
        out: PathBuf,

        /// Source document (defaults to the path in the run manifest)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Ground a quote against a line range of a document
    Check {
        /// Source document
        #[arg(short, long)]
        input: PathBuf,

        /// Line range, `a-b` or a single line `a` (1-based, inclusive)
        #[arg(short, long, value_parser = parse_lines)]
        lines: (usize, usize),

        /// Quoted text
        #[arg(short, long)]
        quote: String,
    },
}

/// Parse `a-b` or `a` into an inclusive line range
pub fn parse_lines(value: &str) -> Result<(usize, usize), String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid line number '{}'", s.trim()))
    };

    match value.split_once('-') {
        Some((start, end)) => Ok((parse(start)?, parse(end)?)),
        None => {
            let line = parse(value)?;
            Ok((line, line))
        }
    }
}

/// Execute evidence subcommands
pub async fn execute(cfg: &ResolvedConfig, command: EvidenceCommands) -> Result<()> {
    match command {
        EvidenceCommands::Show {
            artifact_id,
            out,
            input,
        } => execute_show(cfg, &artifact_id, &out, input.as_deref()).await,
        EvidenceCommands::Check { input, lines, quote } => {
            execute_check(&cfg.matcher, &input, lines, &quote).await
        }
    }
}

/// An artifact that carries evidence, reached from the requested one
struct Grounded<'a> {
    id: &'a str,
    name: &'a str,
    evidence: &'a [Evidence],
}

fn grounded_use_case<'a>(set: &'a ArtifactSet, id: &str) -> Option<Grounded<'a>> {
    set.use_cases.iter().find(|uc| uc.id == id).map(|uc| Grounded {
        id: &uc.id,
        name: &uc.name,
        evidence: &uc.evidence,
    })
}

fn grounded_policy<'a>(set: &'a ArtifactSet, id: &str) -> Option<Grounded<'a>> {
    set.policies.iter().find(|p| p.id == id).map(|p| Grounded {
        id: &p.id,
        name: &p.name,
        evidence: &p.evidence,
    })
}

/// Follow references from `artifact_id` down to the artifacts that carry evidence
fn resolve_chain<'a>(set: &'a ArtifactSet, artifact_id: &str) -> Result<(Vec<String>, Vec<Grounded<'a>>)> {
    if let Some(found) = grounded_use_case(set, artifact_id).or_else(|| grounded_policy(set, artifact_id)) {
        return Ok((Vec::new(), vec![found]));
    }

    let mut chain = Vec::new();
    let test_case_id = match set.examples.iter().find(|ex| ex.id == artifact_id) {
        Some(ex) => {
            chain.push(format!("{} -> {} -> {}", ex.id, ex.test_case_id, ex.use_case_id));
            ex.test_case_id.as_str()
        }
        None => artifact_id,
    };

    let tc = set
        .test_cases
        .iter()
        .find(|tc| tc.id == test_case_id)
        .with_context(|| format!("Artifact not found: {}", artifact_id))?;
    if chain.is_empty() {
        chain.push(format!("{} -> {}", tc.id, tc.use_case_id));
    }

    let grounded = grounded_use_case(set, &tc.use_case_id)
        .with_context(|| format!("{} references unknown use case '{}'", tc.id, tc.use_case_id))?;
    Ok((chain, vec![grounded]))
}

/// Execute the `evidence show` command
pub async fn execute_show(cfg: &ResolvedConfig, artifact_id: &str, out: &Path, input: Option<&Path>) -> Result<()> {
    let store = OutputStore::new(out);
    let loaded = store.load_artifacts();
    let manifest = load_manifest(&store);
    let document = load_source(input, manifest.as_ref()).await;

    let (chain, grounded) = resolve_chain(&loaded.set, artifact_id)?;
    for link in &chain {
        println!("Chain: {}", link);
    }

    for artifact in grounded {
        println!("{}: {}", artifact.id, artifact.name);
        if artifact.evidence.is_empty() {
            println!("  (no evidence)");
        }
        for (i, evidence) in artifact.evidence.iter().enumerate() {
            println!();
            println!("  [{}] {}", i, evidence.location());
            println!("  Quote:");
            for line in evidence.quote.lines() {
                println!("    \"{}\"", line);
            }
            match &document {
                Some(document) => display_grounding(&cfg.matcher, evidence, document),
                None => println!("  Verdict: (source document unavailable)"),
            }
        }
        println!();
    }

    Ok(())
}

/// Print the verdict, the claimed source lines, and where the quote really lives
fn display_grounding(matcher: &QuoteMatcher, evidence: &Evidence, document: &DocumentModel) {
    let verdict = matcher.verify(evidence, document);
    println!("  Verdict: {}", verdict);

    if let Ok(lines) = document.range(evidence.line_start, evidence.line_end) {
        println!("  Source:");
        for line in lines {
            println!("    {:>4}: {}", line.number, line.raw);
        }
    }

    if let GroundingVerdict::Ungrounded { .. } = verdict {
        let found = locate(document, &evidence.quote);
        if found.is_empty() {
            println!("  Quote not found anywhere in {}", document.file_name());
        }
        for (start, end) in found {
            if start == end {
                println!("  Quote found at line {}", start);
            } else {
                println!("  Quote found at lines {}-{}", start, end);
            }
        }
    }
}

/// Execute the `evidence check` command
pub async fn execute_check(matcher: &QuoteMatcher, input: &Path, lines: (usize, usize), quote: &str) -> Result<()> {
    let document = DocumentModel::load(input).await?;
    let evidence = Evidence::new(document.source(), lines.0, lines.1, quote);

    display_grounding(matcher, &evidence, &document);

    if !matcher.verify(&evidence, &document).is_grounded() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TestCase, UseCase, VariationAxis};
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_lines() {
        assert_eq!(parse_lines("3-5"), Ok((3, 5)));
        assert_eq!(parse_lines("7"), Ok((7, 7)));
        assert_eq!(parse_lines(" 2 - 4 "), Ok((2, 4)));
        assert!(parse_lines("a-b").is_err());
        assert!(parse_lines("").is_err());
    }

    fn set() -> ArtifactSet {
        ArtifactSet {
            use_cases: vec![UseCase {
                id: "uc_001".into(),
                name: "Complaints".into(),
                description: String::new(),
                evidence: vec![Evidence::new("rules.md", 2, 2, "Escalate if the customer complains.")],
            }],
            test_cases: vec![TestCase {
                id: "tc_001".into(),
                use_case_id: "uc_001".into(),
                name: "Angry".into(),
                description: String::new(),
                parameter_variation_axes: vec![VariationAxis::new("tone", &["calm", "angry"])],
                policy_ids: vec![],
                metadata: BTreeMap::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_chain_from_test_case() {
        let set = set();
        let (chain, grounded) = resolve_chain(&set, "tc_001").unwrap();
        assert_eq!(chain, vec!["tc_001 -> uc_001".to_string()]);
        assert_eq!(grounded[0].id, "uc_001");
        assert_eq!(grounded[0].evidence.len(), 1);
    }

    #[test]
    fn test_resolve_chain_unknown_artifact() {
        let err = resolve_chain(&set(), "pol_404").err().unwrap();
        assert!(err.to_string().contains("Artifact not found: pol_404"));
    }

    #[test]
    fn test_check_grounded_quote() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.md");
        std::fs::write(&path, "Operators must not use capital letters.\nEscalate if the customer complains.\n").unwrap();

        let result = tokio_test::block_on(execute_check(
            &QuoteMatcher::default(),
            &path,
            (2, 2),
            "Escalate if the  customer complains.",
        ));
        assert!(result.is_ok());
    }

    #[test]
    fn test_check_missing_document() {
        let result = tokio_test::block_on(execute_check(
            &QuoteMatcher::default(),
            Path::new("/nonexistent/rules.md"),
            (1, 1),
            "anything",
        ));
        assert!(result.is_err());
    }
}
