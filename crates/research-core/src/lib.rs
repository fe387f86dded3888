//! Research assistant core: turns a question into a cited report.
//!
//! A question is expanded into sub-queries, each sub-query is searched, every
//! hit is fetched and summarized, and the surviving summaries are written up
//! into a single report. The [`PipelineOrchestrator`] wires these stages
//! together behind pluggable language-model, search and fetch adapters.

mod aggregator;
mod collector;
mod config;
mod error;
mod events;
mod evidence;
mod expander;
mod fanout;
mod fetch;
mod llm;
mod metrics;
mod orchestrator;
mod prompts;
mod retry;
mod search;
mod security;
mod summarize;
mod synthesize;
mod telemetry;
mod trace;

pub mod stub;

pub use aggregator::{Gathered, ResearchAggregator};
pub use collector::{EvidenceCollector, SubQueryEvidence};
pub use config::{
    ConfigLoader, FetchConfig, LlmConfig, LoggingConfig, PipelineConfig, PromptOverrides,
    ResearchConfig, RetryConfig, SearchConfig, SearchProviderKind,
};
pub use error::{
    ConfigError, FetchError, FetchErrorKind, LlmError, PipelineError, QueryGenerationError,
    SearchError, SummarizeError, SynthesisError, Transient,
};
pub use events::{EventCollector, PipelineEvent, Stage};
pub use evidence::{
    Evidence, EvidenceStatus, NO_FINDINGS_NOTICE, Question, Report, ResearchCorpus, SearchHit,
    SubQuery, dedup_sources,
};
pub use expander::{QueryExpander, parse_sub_queries};
pub use fanout::TaskGroup;
pub use fetch::{
    ContentFetcher, DynTransport, FetchTransport, HttpTransport, RawPage, TransportError,
    html_to_text, page_to_text,
};
pub use llm::{ChatRequest, DynLanguageModel, LanguageModel, OpenAiChatClient, PromptPurpose};
pub use metrics::init_metrics_from_env;
pub use orchestrator::{
    OrchestratorBuilder, PipelineOrchestrator, ResearchOptions, ResearchOutcome, ResearchStats,
};
pub use prompts::PromptTemplates;
pub use retry::RetryPolicy;
pub use search::{
    DuckDuckGoSearch, DynSearchProvider, SearchProvider, SerperSearch, build_search_provider,
    parse_duckduckgo_results,
};
pub use security::{SecretValue, require_env};
pub use summarize::{Summarizer, truncate_chars};
pub use synthesize::ReportSynthesizer;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
