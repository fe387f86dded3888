use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

/// Errors that may succeed when the same call is issued again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Failure reported by the language-model service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("language-model service rate limited the request")]
    RateLimited,
    #[error("language-model request timed out")]
    Timeout,
    #[error("language-model transport failure: {0}")]
    Transport(String),
    #[error("language-model service returned status {0}")]
    Status(u16),
    #[error("malformed language-model response: {0}")]
    Malformed(String),
    #[error("language-model returned an empty completion")]
    EmptyCompletion,
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited | LlmError::Timeout | LlmError::Transport(_) => true,
            LlmError::Status(code) => *code >= 500,
            LlmError::Malformed(_) | LlmError::EmptyCompletion => false,
        }
    }
}

/// The search provider was unreachable or rejected the query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("search provider unreachable: {0}")]
    Unreachable(String),
    #[error("search provider rejected the query with status {0}")]
    Rejected(u16),
    #[error("search provider rate limited the query")]
    RateLimited,
    #[error("search timed out")]
    Timeout,
    #[error("unreadable search response: {0}")]
    Malformed(String),
}

impl Transient for SearchError {
    fn is_transient(&self) -> bool {
        match self {
            SearchError::Unreachable(_) | SearchError::RateLimited | SearchError::Timeout => true,
            SearchError::Rejected(code) => *code >= 500,
            SearchError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// DNS, connection, reset or timeout.
    Transport,
    /// The server answered with a non-success status code.
    HttpStatus(u16),
    /// The page loaded but contained no visible text.
    NoContent,
}

/// Failure to retrieve the text of a single page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetching {url} failed: {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub detail: String,
}

impl FetchError {
    pub fn transport(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transport,
            url: url.into(),
            detail: detail.into(),
        }
    }

    pub fn http_status(url: impl Into<String>, code: u16) -> Self {
        Self {
            kind: FetchErrorKind::HttpStatus(code),
            url: url.into(),
            detail: format!("server answered with status {code}"),
        }
    }

    pub fn no_content(url: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::NoContent,
            url: url.into(),
            detail: "page contained no visible text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SummarizeError {
    #[error("summarizer service failure: {0}")]
    Service(#[from] LlmError),
    #[error("summarization timed out")]
    Timeout,
}

impl Transient for SummarizeError {
    fn is_transient(&self) -> bool {
        match self {
            SummarizeError::Service(err) => err.is_transient(),
            SummarizeError::Timeout => true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryGenerationError {
    #[error("query generation service failure: {0}")]
    Service(#[from] LlmError),
    #[error("unparsable sub-query list ({reason}): {raw}")]
    Unparsable { reason: String, raw: String },
    #[error("query generation timed out")]
    Timeout,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("report synthesis service failure: {0}")]
    Service(#[from] LlmError),
    #[error("report synthesis timed out")]
    Timeout,
}

/// Terminal failure of a research request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid question: {0}")]
    InvalidQuestion(String),
    #[error("invalid request options: {0}")]
    InvalidOptions(String),
    #[error("query generation failed: {0}")]
    QueryGeneration(#[from] QueryGenerationError),
    #[error("report synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),
    #[error("research request exceeded its {0:?} deadline")]
    Timeout(Duration),
}

impl PipelineError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::InvalidQuestion(_) | PipelineError::InvalidOptions(_) => "input",
            PipelineError::QueryGeneration(_) => "query_generation",
            PipelineError::Synthesis(_) => "synthesis",
            PipelineError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Status(503).is_transient());
        assert!(!LlmError::Status(400).is_transient());
        assert!(!LlmError::EmptyCompletion.is_transient());
        assert!(SearchError::Timeout.is_transient());
        assert!(!SearchError::Rejected(403).is_transient());
        assert!(SummarizeError::Service(LlmError::RateLimited).is_transient());
    }

    #[test]
    fn pipeline_error_names_stage() {
        let err = PipelineError::from(QueryGenerationError::Timeout);
        assert_eq!(err.stage(), "query_generation");
        let err = PipelineError::from(SynthesisError::Service(LlmError::Status(500)));
        assert_eq!(err.stage(), "synthesis");
        assert!(err.to_string().contains("500"));
    }
}
