//! Configuration for tracegen.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (applied by the CLI after loading)
//! 2. Environment variables (TRACEGEN_MODEL, TRACEGEN_BASE_URL, and the
//!    API-key variable named by `producer.api_key_env`)
//! 3. Config file (.tracegen/config.yaml)
//! 4. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .tracegen/config.yaml
//! - Falls back to ~/.tracegen/config.yaml
//! - `--config <path>` skips discovery
//! - A relative `producer.script` path is resolved against the directory
//!   that contains `.tracegen/`

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::openai::DEFAULT_BASE_URL;
use crate::core::{GenerationConfig, RetryPolicy, SafetyLimits};
use crate::evidence::QuoteMatcher;
use crate::validate::ValidationSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const CONFIG_DIR: &str = ".tracegen";
pub const CONFIG_FILE: &str = "config.yaml";

pub const ENV_MODEL: &str = "TRACEGEN_MODEL";
pub const ENV_BASE_URL: &str = "TRACEGEN_BASE_URL";

/// Which text producer backs a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions endpoint
    #[default]
    Openai,
    /// Canned payloads from a script file
    Scripted,
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub matcher: QuoteMatcher,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Overrides `generation.model`
    pub model: Option<String>,
    /// Overrides `generation.temperature`
    pub temperature: Option<f64>,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-call timeout; overrides `safety.producer_timeout_seconds`
    pub timeout_seconds: Option<u64>,
    /// Script for the scripted provider
    pub script: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            model: None,
            temperature: None,
            api_key_env: default_api_key_env(),
            timeout_seconds: None,
            script: None,
        }
    }
}

/// Resolved producer settings
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSettingsResolved {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key_env: String,
    /// Never printed
    #[serde(skip)]
    pub api_key: Option<String>,
    pub script: Option<PathBuf>,
}

/// Resolved configuration with every source applied
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub producer: ProducerSettingsResolved,
    pub generation: GenerationConfig,
    pub matcher: QuoteMatcher,
    pub validation: ValidationSettings,
    pub safety: SafetyLimits,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        resolve(ConfigFile::default(), None, None, |_| None)
    }
}

impl ResolvedConfig {
    /// YAML rendering for the `config` command (the API key is never shown)
    pub fn to_yaml(&self) -> Result<String> {
        let mut text = serde_yaml::to_string(self).context("Failed to render configuration")?;
        text.push_str(&format!(
            "# api key ({}): {}\n",
            self.producer.api_key_env,
            if self.producer.api_key.is_some() { "set" } else { "not set" }
        ));
        Ok(text)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    let user_config = dirs::home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
    user_config.exists().then_some(user_config)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory relative paths in a config file are resolved against
fn base_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));
    if parent.file_name().map(|n| n == CONFIG_DIR).unwrap_or(false) {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Merge file contents and environment into resolved settings
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    base: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let ConfigFile {
        producer,
        mut generation,
        matcher,
        validation,
        mut safety,
        retry,
        ..
    } = file;

    if let Some(model) = producer.model {
        generation.model = model;
    }
    if let Some(temperature) = producer.temperature {
        generation.temperature = temperature;
    }
    if let Some(timeout) = producer.timeout_seconds {
        safety.producer_timeout_seconds = timeout;
    }
    if let Some(retry) = retry {
        generation.retry = retry;
    }

    let non_empty = |name: &str| env(name).filter(|v| !v.trim().is_empty());

    if let Some(model) = non_empty(ENV_MODEL) {
        generation.model = model;
    }
    let base_url = non_empty(ENV_BASE_URL).unwrap_or(producer.base_url);
    let api_key = non_empty(&producer.api_key_env);

    let script = producer.script.map(|s| match base {
        Some(base) => resolve_path(base, &s),
        None => PathBuf::from(s),
    });

    ResolvedConfig {
        config_file,
        producer: ProducerSettingsResolved {
            provider: producer.provider,
            base_url,
            api_key_env: producer.api_key_env,
            api_key,
            script,
        },
        generation,
        matcher,
        validation,
        safety,
    }
}

/// Load configuration from an explicit file, or by discovery when `None`
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };

    let (file, base) = match &config_file {
        Some(path) => (load_config_file(path)?, Some(base_dir(path))),
        None => (ConfigFile::default(), None),
    };

    let resolved = resolve(file, config_file.clone(), base.as_deref(), |name| std::env::var(name).ok());
    resolved
        .generation
        .validate()
        .with_context(|| match &config_file {
            Some(path) => format!("Invalid generation settings in {}", path.display()),
            None => "Invalid generation settings".to_string(),
        })?;
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load(None).map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    const CONFIG_YAML: &str = r#"
version: "1"
producer:
  base_url: http://localhost:8080/v1
  model: llama-3-8b
  api_key_env: LOCAL_LLM_KEY
  timeout_seconds: 30
  script: fixtures/script.json
generation:
  thresholds:
    min_use_cases: 2
  case: operator_quality
matcher:
  fuzzy_threshold: 0.95
  metric: levenshtein
validation:
  strict: true
safety:
  max_input_bytes: 1024
retry:
  max_attempts: 2
"#;

    fn write_config(temp: &TempDir) -> PathBuf {
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{}", CONFIG_YAML).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ResolvedConfig::default();
        assert_eq!(config.producer.provider, ProviderKind::Openai);
        assert_eq!(config.producer.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.producer.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.generation.model, "gpt-4o-mini");
        assert_eq!(config.generation.thresholds.min_use_cases, 5);
        assert_eq!(config.matcher.fuzzy_threshold, 0.90);
        assert_eq!(config.validation.strict_fuzzy_threshold, 0.97);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_sections() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp);

        let file = load_config_file(&path).unwrap();
        let config = resolve(file, Some(path.clone()), Some(&base_dir(&path)), |_| None);

        assert_eq!(config.producer.base_url, "http://localhost:8080/v1");
        assert_eq!(config.generation.model, "llama-3-8b");
        assert_eq!(config.generation.thresholds.min_use_cases, 2);
        assert_eq!(config.generation.thresholds.min_policies, 5);
        assert_eq!(config.generation.case.as_deref(), Some("operator_quality"));
        assert_eq!(config.generation.retry.max_attempts, 2);
        assert_eq!(config.matcher.fuzzy_threshold, 0.95);
        assert!(config.validation.strict);
        assert_eq!(config.safety.max_input_bytes, 1024);
        assert_eq!(config.safety.producer_timeout_seconds, 30);
        assert_eq!(config.producer.script, Some(temp.path().join("fixtures/script.json")));
    }

    #[test]
    fn test_environment_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp);
        let env: HashMap<&str, &str> = [
            (ENV_MODEL, "gpt-4o"),
            (ENV_BASE_URL, "http://proxy/v1"),
            ("LOCAL_LLM_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let file = load_config_file(&path).unwrap();
        let config = resolve(file, Some(path), None, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.generation.model, "gpt-4o");
        assert_eq!(config.producer.base_url, "http://proxy/v1");
        assert_eq!(config.producer.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_yaml_rendering_hides_api_key() {
        let mut config = ResolvedConfig::default();
        config.producer.api_key = Some("sk-secret".into());

        let text = config.to_yaml().unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(text.contains("api key (OPENAI_API_KEY): set"));
    }

    #[test]
    fn test_explicit_path_loads_and_validates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.yaml");
        std::fs::write(&path, "generation:\n  max_attempts: 0\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("max_attempts"));
    }

    #[test]
    fn test_base_dir_for_plain_file() {
        assert_eq!(base_dir(Path::new("/etc/tracegen.yaml")), PathBuf::from("/etc"));
        assert_eq!(
            base_dir(Path::new("/home/me/project/.tracegen/config.yaml")),
            PathBuf::from("/home/me/project")
        );
    }
}
