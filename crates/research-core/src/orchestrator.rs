//! Request-level coordinator: expand, gather, synthesize.
//!
//! Owns the concurrency limits, the request deadline and the failure policy.
//! Only query generation and synthesis failures are terminal; failed searches,
//! fetches and summaries shrink the corpus instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::aggregator::{Gathered, ResearchAggregator};
use crate::collector::EvidenceCollector;
use crate::config::{ConfigLoader, ResearchConfig};
use crate::error::{ConfigError, PipelineError};
use crate::events::{EventCollector, Stage};
use crate::evidence::{EvidenceStatus, Question, Report, SubQuery};
use crate::expander::QueryExpander;
use crate::fetch::{ContentFetcher, DynTransport, HttpTransport};
use crate::llm::{DynLanguageModel, OpenAiChatClient};
use crate::metrics::{record_request, record_stage_duration};
use crate::prompts::PromptTemplates;
use crate::retry::RetryPolicy;
use crate::search::{DynSearchProvider, build_search_provider};
use crate::summarize::Summarizer;
use crate::synthesize::ReportSynthesizer;
use crate::trace::TraceCollector;

/// Per-request overrides of the configured counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResearchOptions {
    pub sub_query_count: Option<usize>,
    pub results_per_query: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResearchStats {
    pub sub_queries: usize,
    pub hits: usize,
    pub evidence_ok: usize,
    pub fetch_failed: usize,
    pub summarize_failed: usize,
    pub failed_searches: usize,
    pub elapsed_ms: u64,
}

impl ResearchStats {
    fn from_gathered(sub_queries: usize, gathered: &Gathered, elapsed: Duration) -> Self {
        let mut stats = Self {
            sub_queries,
            hits: gathered.hit_count(),
            failed_searches: gathered.failed_searches(),
            elapsed_ms: elapsed.as_millis() as u64,
            ..Self::default()
        };
        for evidence in gathered.evidence() {
            match evidence.status {
                EvidenceStatus::Ok => stats.evidence_ok += 1,
                EvidenceStatus::FetchFailed => stats.fetch_failed += 1,
                EvidenceStatus::SummarizeFailed => stats.summarize_failed += 1,
            }
        }
        stats
    }
}

/// Report plus the bookkeeping collected while producing it.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchOutcome {
    pub request_id: String,
    pub report: Report,
    pub sub_queries: Vec<SubQuery>,
    pub stats: ResearchStats,
    pub trace: TraceCollector,
}

pub struct PipelineOrchestrator {
    expander: QueryExpander,
    aggregator: ResearchAggregator,
    synthesizer: ReportSynthesizer,
    events: EventCollector,
    sub_query_count: usize,
    results_per_query: usize,
    request_timeout: Duration,
    synthesis_timeout: Duration,
}

/// Wires the pipeline from configuration. Collaborators that are not set
/// explicitly are built from the configuration's live clients.
pub struct OrchestratorBuilder {
    config: ResearchConfig,
    llm: Option<DynLanguageModel>,
    search: Option<DynSearchProvider>,
    transport: Option<DynTransport>,
    events: EventCollector,
}

impl OrchestratorBuilder {
    pub fn language_model(mut self, llm: DynLanguageModel) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn search_provider(mut self, search: DynSearchProvider) -> Self {
        self.search = Some(search);
        self
    }

    pub fn transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn events(mut self, events: EventCollector) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator, ConfigError> {
        let config = self.config;
        ConfigLoader::validate(&config)?;

        let llm: DynLanguageModel = match self.llm {
            Some(llm) => llm,
            None => Arc::new(OpenAiChatClient::from_config(&config.llm)?),
        };
        let search = match self.search {
            Some(search) => search,
            None => build_search_provider(&config.search, &config.fetch.user_agent)?,
        };
        let transport: DynTransport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.fetch)?),
        };

        let pipeline = &config.pipeline;
        let prompts = Arc::new(PromptTemplates::from_overrides(&config.prompts));

        let expander = QueryExpander::new(
            Arc::clone(&llm),
            Arc::clone(&prompts),
            pipeline.query_parse_retries,
            pipeline.query_generation_timeout(),
        );
        let collector = EvidenceCollector::new(
            search,
            ContentFetcher::new(transport, config.fetch.timeout()),
            Summarizer::new(Arc::clone(&llm), Arc::clone(&prompts), pipeline.max_page_chars),
            pipeline.inner_concurrency,
        )
        .with_retry(RetryPolicy::from_config(&config.retry))
        .with_timeouts(config.search.timeout(), pipeline.summarize_timeout());
        let aggregator = ResearchAggregator::new(Arc::new(collector), pipeline.outer_concurrency);
        let synthesizer = ReportSynthesizer::new(
            llm,
            prompts,
            pipeline.min_report_words,
            pipeline.synthesis_timeout(),
        );

        Ok(PipelineOrchestrator {
            expander,
            aggregator,
            synthesizer,
            events: self.events,
            sub_query_count: pipeline.sub_query_count,
            results_per_query: pipeline.results_per_query,
            request_timeout: pipeline.request_timeout(),
            synthesis_timeout: pipeline.synthesis_timeout(),
        })
    }
}

impl PipelineOrchestrator {
    pub fn builder(config: ResearchConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            llm: None,
            search: None,
            transport: None,
            events: EventCollector::disabled(),
        }
    }

    /// Orchestrator backed by the live services named in `config`.
    pub fn from_config(config: ResearchConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Research `question` and return the cited report.
    pub async fn research(&self, question: &Question) -> Result<Report, PipelineError> {
        self.research_with_outcome(question)
            .await
            .map(|outcome| outcome.report)
    }

    pub async fn research_with_outcome(
        &self,
        question: &Question,
    ) -> Result<ResearchOutcome, PipelineError> {
        self.research_with_options(question, ResearchOptions::default())
            .await
    }

    pub async fn research_with_options(
        &self,
        question: &Question,
        options: ResearchOptions,
    ) -> Result<ResearchOutcome, PipelineError> {
        let sub_query_count = options.sub_query_count.unwrap_or(self.sub_query_count);
        let results_per_query = options.results_per_query.unwrap_or(self.results_per_query);
        if sub_query_count == 0 || results_per_query == 0 {
            return Err(PipelineError::InvalidOptions(
                "sub_query_count and results_per_query must be greater than zero".to_string(),
            ));
        }

        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("research", request_id = %request_id);
        let events = self.events.for_request(request_id.clone());
        let started = Instant::now();
        let deadline = started + self.request_timeout;

        let run = self.run(
            request_id,
            question,
            sub_query_count,
            results_per_query,
            deadline,
            &events,
        );
        let result = match tokio::time::timeout_at(deadline, run.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(self.request_timeout)),
        };

        match &result {
            Ok(outcome) => {
                record_request("ok");
                info!(
                    request_id = %outcome.request_id,
                    sources = outcome.report.sources.len(),
                    elapsed_ms = outcome.stats.elapsed_ms,
                    "research complete"
                );
            }
            Err(err) => {
                record_request(err.stage());
                warn!(stage = err.stage(), error = %err, "research failed");
            }
        }
        result
    }

    async fn run(
        &self,
        request_id: String,
        question: &Question,
        sub_query_count: usize,
        results_per_query: usize,
        deadline: Instant,
        events: &EventCollector,
    ) -> Result<ResearchOutcome, PipelineError> {
        let started = Instant::now();
        let mut trace = TraceCollector::new();

        events.emit_stage_started(Stage::QueryGeneration);
        let stage_started = Instant::now();
        let sub_queries = self.expander.expand(question, sub_query_count).await?;
        record_stage_duration(Stage::QueryGeneration.as_str(), elapsed_ms(stage_started));
        events.emit_sub_queries(&sub_queries);
        trace.record(
            "expand",
            format!(
                "{} sub-queries: {}",
                sub_queries.len(),
                sub_queries
                    .iter()
                    .map(|query| format!("\"{query}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        // Leave the synthesis budget untouched by slow gathering.
        let gather_deadline = deadline
            .checked_sub(self.synthesis_timeout)
            .unwrap_or(started)
            .max(Instant::now());

        events.emit_stage_started(Stage::Gathering);
        let stage_started = Instant::now();
        let gathered = self
            .aggregator
            .gather(&sub_queries, results_per_query, Some(gather_deadline), events)
            .await;
        record_stage_duration(Stage::Gathering.as_str(), elapsed_ms(stage_started));
        record_gathering(&mut trace, &gathered);

        let corpus = gathered.corpus();
        if corpus.is_empty() {
            warn!("no evidence survived; writing report without findings");
        }

        events.emit_stage_started(Stage::Synthesis);
        let stage_started = Instant::now();
        let report = self
            .synthesizer
            .synthesize_within(question, &corpus, Some(deadline))
            .await?;
        record_stage_duration(Stage::Synthesis.as_str(), elapsed_ms(stage_started));
        trace.record(
            "synthesize",
            format!(
                "report from {} findings citing {} sources",
                corpus.len(),
                report.sources.len()
            ),
        );

        let stats = ResearchStats::from_gathered(sub_queries.len(), &gathered, started.elapsed());
        events.emit_report_ready(report.sources.len(), stats.elapsed_ms);

        Ok(ResearchOutcome {
            request_id,
            report,
            sub_queries,
            stats,
            trace,
        })
    }
}

fn record_gathering(trace: &mut TraceCollector, gathered: &Gathered) {
    for entry in &gathered.per_query {
        match &entry.search_error {
            Some(err) => trace.record("search", format!("\"{}\" failed: {err}", entry.sub_query)),
            None => trace.record(
                "search",
                format!("\"{}\" returned {} hits", entry.sub_query, entry.hits.len()),
            ),
        }
        for evidence in &entry.evidence {
            let message = match &evidence.failure {
                Some(failure) => format!("{} {}: {failure}", evidence.source_url, evidence.status.as_str()),
                None => format!("{} {}", evidence.source_url, evidence.status.as_str()),
            };
            trace.record("evidence", message);
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{StubLanguageModel, StubSearchProvider, StubTransport};

    fn offline(config: ResearchConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::builder(config)
            .language_model(Arc::new(StubLanguageModel::offline()))
            .search_provider(Arc::new(StubSearchProvider::new()))
            .transport(Arc::new(StubTransport::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn options_override_configured_counts() {
        let orchestrator = offline(ResearchConfig::default());
        let question = Question::new("How do heat pumps work?").unwrap();

        let outcome = orchestrator
            .research_with_options(
                &question,
                ResearchOptions {
                    sub_query_count: Some(2),
                    results_per_query: Some(1),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.stats.sub_queries, 2);
        assert_eq!(outcome.stats.hits, 2);
        assert_eq!(outcome.stats.evidence_ok, 2);
        assert_eq!(outcome.report.sources.len(), 2);
    }

    #[tokio::test]
    async fn zero_counts_are_rejected() {
        let orchestrator = offline(ResearchConfig::default());
        let question = Question::new("q").unwrap();

        let err = orchestrator
            .research_with_options(
                &question,
                ResearchOptions {
                    sub_query_count: Some(0),
                    results_per_query: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "input");
    }

    #[tokio::test]
    async fn trace_follows_pipeline_order() {
        let orchestrator = offline(ResearchConfig::default());
        let question = Question::new("q").unwrap();

        let outcome = orchestrator
            .research_with_options(
                &question,
                ResearchOptions {
                    sub_query_count: Some(1),
                    results_per_query: Some(2),
                },
            )
            .await
            .unwrap();

        let steps: Vec<_> = outcome
            .trace
            .events()
            .iter()
            .map(|event| event.step.as_str())
            .collect();
        assert_eq!(
            steps,
            vec!["expand", "search", "evidence", "evidence", "synthesize"]
        );
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let mut config = ResearchConfig::default();
        config.pipeline.outer_concurrency = 0;
        let result = PipelineOrchestrator::builder(config)
            .language_model(Arc::new(StubLanguageModel::offline()))
            .search_provider(Arc::new(StubSearchProvider::new()))
            .transport(Arc::new(StubTransport::new()))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
    }
}
