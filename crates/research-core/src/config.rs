use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "research.toml";
const CONFIG_PATH_ENV: &str = "RESEARCH_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub fetch: FetchConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub prompts: PromptOverrides,
    pub logging: LoggingConfig,
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `RESEARCH_CONFIG` environment variable.
    /// 3. `research.toml` in the current working directory.
    ///
    /// Only the implicit default file may be absent, in which case the
    /// built-in defaults are used.
    pub fn load(path: Option<PathBuf>) -> Result<ResearchConfig, ConfigError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            let config = ResearchConfig::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| ConfigError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn parse(raw: &str) -> Result<ResearchConfig, ConfigError> {
        let config: ResearchConfig =
            toml::from_str(raw).map_err(|err| ConfigError::invalid(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &ResearchConfig) -> Result<(), ConfigError> {
        let pipeline = &config.pipeline;
        let counts = [
            ("pipeline.sub_query_count", pipeline.sub_query_count),
            ("pipeline.results_per_query", pipeline.results_per_query),
            ("pipeline.max_page_chars", pipeline.max_page_chars),
            ("pipeline.outer_concurrency", pipeline.outer_concurrency),
            ("pipeline.inner_concurrency", pipeline.inner_concurrency),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be greater than zero")));
            }
        }

        if pipeline.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "pipeline.request_timeout_ms must be greater than zero",
            ));
        }

        let per_call = [
            ("llm.request_timeout_ms", config.llm.request_timeout_ms),
            ("search.timeout_ms", config.search.timeout_ms),
            ("fetch.timeout_ms", config.fetch.timeout_ms),
            ("pipeline.summarize_timeout_ms", pipeline.summarize_timeout_ms),
            ("pipeline.synthesis_timeout_ms", pipeline.synthesis_timeout_ms),
            (
                "pipeline.query_generation_timeout_ms",
                pipeline.query_generation_timeout_ms,
            ),
        ];
        for (name, value) in per_call {
            if value == 0 || value >= pipeline.request_timeout_ms {
                return Err(ConfigError::invalid(format!(
                    "{name} must be non-zero and shorter than pipeline.request_timeout_ms ({})",
                    pipeline.request_timeout_ms
                )));
            }
        }

        if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }

        if config.llm.model.trim().is_empty() {
            return Err(ConfigError::invalid("llm.model must not be empty"));
        }

        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LlmConfig::default_model")]
    pub model: String,
    /// Environment variable holding the API key; `None` for keyless local servers.
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "LlmConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl LlmConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-3.5-turbo-1106".to_string()
    }

    fn default_api_key_env() -> Option<String> {
        Some("OPENAI_API_KEY".to_string())
    }

    const fn default_request_timeout_ms() -> u64 {
        120_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    #[default]
    DuckDuckGo,
    Serper,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub provider: SearchProviderKind,
    #[serde(default = "SearchConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "SearchConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SearchConfig {
    fn default_api_key_env() -> String {
        "SERPER_API_KEY".to_string()
    }

    const fn default_timeout_ms() -> u64 {
        15_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProviderKind::default(),
            api_key_env: Self::default_api_key_env(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "FetchConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "FetchConfig::default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "FetchConfig::default_user_agent")]
    pub user_agent: String,
}

impl FetchConfig {
    const fn default_timeout_ms() -> u64 {
        10_000
    }

    const fn default_max_body_bytes() -> usize {
        2_000_000
    }

    fn default_user_agent() -> String {
        concat!("research-assistant/", env!("CARGO_PKG_VERSION")).to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            max_body_bytes: Self::default_max_body_bytes(),
            user_agent: Self::default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_sub_query_count")]
    pub sub_query_count: usize,
    #[serde(default = "PipelineConfig::default_results_per_query")]
    pub results_per_query: usize,
    /// Page text is cut to this many characters before summarization.
    #[serde(default = "PipelineConfig::default_max_page_chars")]
    pub max_page_chars: usize,
    #[serde(default = "PipelineConfig::default_min_report_words")]
    pub min_report_words: usize,
    /// Sub-queries researched at the same time.
    #[serde(default = "PipelineConfig::default_concurrency")]
    pub outer_concurrency: usize,
    /// Search hits fetched and summarized at the same time, per sub-query.
    #[serde(default = "PipelineConfig::default_concurrency")]
    pub inner_concurrency: usize,
    #[serde(default = "PipelineConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "PipelineConfig::default_summarize_timeout_ms")]
    pub summarize_timeout_ms: u64,
    #[serde(default = "PipelineConfig::default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,
    #[serde(default = "PipelineConfig::default_query_generation_timeout_ms")]
    pub query_generation_timeout_ms: u64,
    /// Extra query-generation attempts when the sub-query list cannot be parsed.
    #[serde(default)]
    pub query_parse_retries: u32,
}

impl PipelineConfig {
    const fn default_sub_query_count() -> usize {
        3
    }

    const fn default_results_per_query() -> usize {
        3
    }

    const fn default_max_page_chars() -> usize {
        10_000
    }

    const fn default_min_report_words() -> usize {
        1_200
    }

    const fn default_concurrency() -> usize {
        3
    }

    const fn default_request_timeout_ms() -> u64 {
        300_000
    }

    const fn default_summarize_timeout_ms() -> u64 {
        45_000
    }

    const fn default_synthesis_timeout_ms() -> u64 {
        120_000
    }

    const fn default_query_generation_timeout_ms() -> u64 {
        30_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_millis(self.summarize_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn query_generation_timeout(&self) -> Duration {
        Duration::from_millis(self.query_generation_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sub_query_count: Self::default_sub_query_count(),
            results_per_query: Self::default_results_per_query(),
            max_page_chars: Self::default_max_page_chars(),
            min_report_words: Self::default_min_report_words(),
            outer_concurrency: Self::default_concurrency(),
            inner_concurrency: Self::default_concurrency(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            summarize_timeout_ms: Self::default_summarize_timeout_ms(),
            synthesis_timeout_ms: Self::default_synthesis_timeout_ms(),
            query_generation_timeout_ms: Self::default_query_generation_timeout_ms(),
            query_parse_retries: 0,
        }
    }
}

/// Retry budget for transient search and summarize failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        2
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        8_000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

/// Optional replacements for the built-in prompt templates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptOverrides {
    pub query_generation: Option<String>,
    pub summary: Option<String>,
    pub writer_system: Option<String>,
    pub report: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("").expect("defaults are valid");
        assert_eq!(config.pipeline.sub_query_count, 3);
        assert_eq!(config.pipeline.results_per_query, 3);
        assert_eq!(config.pipeline.max_page_chars, 10_000);
        assert_eq!(config.pipeline.min_report_words, 1_200);
        assert_eq!(config.pipeline.query_parse_retries, 0);
        assert_eq!(config.search.provider, SearchProviderKind::DuckDuckGo);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [pipeline]
            sub_query_count = 2
            inner_concurrency = 5

            [search]
            provider = "serper"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.sub_query_count, 2);
        assert_eq!(config.pipeline.inner_concurrency, 5);
        assert_eq!(config.pipeline.results_per_query, 3);
        assert_eq!(config.search.provider, SearchProviderKind::Serper);
        assert_eq!(config.search.api_key_env, "SERPER_API_KEY");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = ConfigLoader::parse("[pipeline]\nouter_concurrency = 0\n").unwrap_err();
        assert!(err.to_string().contains("outer_concurrency"));
    }

    #[test]
    fn rejects_per_call_timeout_not_below_request_timeout() {
        let err = ConfigLoader::parse(
            "[pipeline]\nrequest_timeout_ms = 1000\nsummarize_timeout_ms = 1000\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = ConfigLoader::parse("[search]\nprovider = \"altavista\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
    }

    #[test]
    fn loads_explicit_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[llm]\nmodel = \"local-model\"\napi_key_env = \"LOCAL_KEY\"").unwrap();

        let config = ConfigLoader::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.api_key_env.as_deref(), Some("LOCAL_KEY"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/research.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConfigIo { .. }));
    }
}
