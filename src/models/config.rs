//! Configuration models for tracedistill.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

/// Placeholder substituted with the problem text in the prompt template.
pub const PROBLEM_PLACEHOLDER: &str = "{problem}";

/// Upper bound on `endpoint.max_retries`.
pub const MAX_RETRIES: u32 = 10;

/// Default user-turn prompt. All instructions live in the user turn because
/// reasoning models of the R1 family must not receive a system prompt.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "{problem}\n\nPlease reason step by step, and put your final answer within \\boxed{}.";

/// Top-level configuration for tracedistill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Inference endpoint (OpenAI-compatible)
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Model and decoding parameters
    #[serde(default)]
    pub model: ModelSpec,

    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Prompting and sampling settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Where problem records come from
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Where traces go
    #[serde(default)]
    pub output: OutputConfig,
}

/// Inference endpoint configuration.
///
/// K_i: All endpoints must be OpenAI-compatible (chat completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API (e.g., "https://integrate.api.nvidia.com/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (optional; supports ${ENV_VAR} expansion)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Custom headers; values may contain ${ENV_VAR}
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Overall request timeout in seconds, streaming body included.
    /// Generation latency grows with max_tokens, so this is minutes, not seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum attempts at opening a stream
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://integrate.api.nvidia.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "NVIDIA_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    1800
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Model identity and fixed decoding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model ID as the endpoint knows it
    #[serde(default = "default_model_id")]
    pub id: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model_id() -> String {
    "deepseek-ai/deepseek-r1".to_string()
}

fn default_temperature() -> f64 {
    0.6
}

fn default_top_p() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    32768
}

impl ModelSpec {
    /// Decoding parameters that differ from the standard distillation settings.
    pub fn decoding_overrides(&self) -> Vec<&'static str> {
        let mut overrides = Vec::new();
        if self.temperature != default_temperature() {
            overrides.push("temperature");
        }
        if self.top_p != default_top_p() {
            overrides.push("top_p");
        }
        if self.max_tokens != default_max_tokens() {
            overrides.push("max_tokens");
        }
        overrides
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent streams (one request in flight per worker)
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Per-record deadline in seconds; expiry truncates the stream
    #[serde(default)]
    pub record_timeout_secs: Option<u64>,
}

fn default_pool_size() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            record_timeout_secs: None,
        }
    }
}

/// Generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// User prompt template; must contain `{problem}`
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,

    /// Number of candidate traces sampled per problem
    #[serde(default = "default_samples_per_problem")]
    pub samples_per_problem: usize,
}

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

fn default_samples_per_problem() -> usize {
    1
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompt_template: default_prompt_template(),
            samples_per_problem: default_samples_per_problem(),
        }
    }
}

/// Dataset source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory holding one sub-directory per corpus
    #[serde(default = "default_dataset_root")]
    pub root: PathBuf,

    /// Source field holding the problem text
    #[serde(default = "default_problem_field")]
    pub problem_field: String,

    /// Source field holding the ground-truth answer
    #[serde(default = "default_answer_field")]
    pub answer_field: String,
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_problem_field() -> String {
    "problem".to_string()
}

fn default_answer_field() -> String {
    "answer".to_string()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: default_dataset_root(),
            problem_field: default_problem_field(),
            answer_field: default_answer_field(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Intermediate dataset: every trace with its verdict
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Final dataset: written after the run with only VALID traces
    #[serde(default)]
    pub filtered_path: Option<PathBuf>,

    /// Checkpoint directory for resume support
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.generation.prompt_template.contains(PROBLEM_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "generation.prompt_template must contain {PROBLEM_PLACEHOLDER}"
            )));
        }
        if self.workers.size == 0 {
            return Err(ConfigError::Invalid("workers.size must be at least 1".to_string()));
        }
        if self.generation.samples_per_problem == 0 {
            return Err(ConfigError::Invalid(
                "generation.samples_per_problem must be at least 1".to_string(),
            ));
        }
        if self.endpoint.max_retries == 0 || self.endpoint.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "endpoint.max_retries must be between 1 and {MAX_RETRIES}"
            )));
        }

        let overrides = self.model.decoding_overrides();
        if !overrides.is_empty() {
            warn!(
                overrides = %overrides.join(", "),
                temperature = self.model.temperature,
                top_p = self.model.top_p,
                max_tokens = self.model.max_tokens,
                "Decoding parameters differ from the standard distillation settings"
            );
        }
        Ok(())
    }

    /// Resolve the API key from config or environment.
    ///
    /// Returns `None` when neither is set; local endpoints run without auth.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.endpoint.api_key {
            return Some(expand_env_vars(key));
        }
        std::env::var(&self.endpoint.api_key_env).ok()
    }
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR_RE
        .replace_all(s, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing or out-of-range values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_decoding_contract() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.model.temperature, 0.6);
        assert_eq!(config.model.top_p, 0.7);
        assert_eq!(config.model.max_tokens, 32768);
        assert_eq!(config.generation.samples_per_problem, 1);
        assert!(config.generation.prompt_template.contains("\\boxed{}"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[endpoint]
base_url = "http://localhost:8000/v1"

[workers]
size = 16
record_timeout_secs = 600

[dataset]
problem_field = "question"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint.base_url, "http://localhost:8000/v1");
        assert_eq!(config.endpoint.timeout_secs, 1800);
        assert_eq!(config.workers.size, 16);
        assert_eq!(config.workers.record_timeout_secs, Some(600));
        assert_eq!(config.dataset.problem_field, "question");
        assert_eq!(config.dataset.answer_field, "answer");
    }

    #[test]
    fn test_template_without_placeholder_is_rejected() {
        let mut config = Config::default();
        config.generation.prompt_template = "Solve it.".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.workers.size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let mut config = Config::default();
        config.endpoint.max_retries = MAX_RETRIES;
        assert!(config.validate().is_ok());
        config.endpoint.max_retries = 100;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_decoding_overrides_are_reported() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.model.decoding_overrides().is_empty());

        let config: Config = toml::from_str("[model]\ntemperature = 1.0").unwrap();
        assert_eq!(config.model.decoding_overrides(), vec!["temperature"]);
        assert!(config.validate().is_ok());

        let config: Config =
            toml::from_str("[model]\ntop_p = 0.95\nmax_tokens = 4096").unwrap();
        assert_eq!(config.model.decoding_overrides(), vec!["top_p", "max_tokens"]);
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholders() {
        assert_eq!(
            expand_env_vars("Bearer ${TRACEDISTILL_SURELY_UNSET_VAR}"),
            "Bearer ${TRACEDISTILL_SURELY_UNSET_VAR}"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}
