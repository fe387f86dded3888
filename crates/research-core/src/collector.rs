//! Researches one sub-query: search, then fetch and summarize every hit.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{FetchError, SearchError, SummarizeError};
use crate::events::EventCollector;
use crate::evidence::{Evidence, SearchHit, SubQuery};
use crate::fanout::TaskGroup;
use crate::fetch::ContentFetcher;
use crate::metrics::{record_evidence, record_search_failure};
use crate::retry::RetryPolicy;
use crate::search::DynSearchProvider;
use crate::summarize::Summarizer;

/// Everything gathered for one sub-query.
#[derive(Debug, Clone)]
pub struct SubQueryEvidence {
    pub sub_query: SubQuery,
    pub hits: Vec<SearchHit>,
    /// One record per hit, in hit order.
    pub evidence: Vec<Evidence>,
    pub search_error: Option<SearchError>,
}

pub struct EvidenceCollector {
    search: DynSearchProvider,
    fetcher: ContentFetcher,
    summarizer: Summarizer,
    inner_limit: usize,
    retry: RetryPolicy,
    search_timeout: Duration,
    summarize_timeout: Duration,
}

impl EvidenceCollector {
    pub fn new(
        search: DynSearchProvider,
        fetcher: ContentFetcher,
        summarizer: Summarizer,
        inner_limit: usize,
    ) -> Self {
        Self {
            search,
            fetcher,
            summarizer,
            inner_limit,
            retry: RetryPolicy::none(),
            search_timeout: Duration::from_secs(15),
            summarize_timeout: Duration::from_secs(45),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, search: Duration, summarize: Duration) -> Self {
        self.search_timeout = search;
        self.summarize_timeout = summarize;
        self
    }

    /// Evidence for `sub_query`, one entry per search hit.
    pub async fn collect(&self, sub_query: &SubQuery, results_per_query: usize) -> Vec<Evidence> {
        self.collect_within(sub_query, results_per_query, None, &EventCollector::disabled())
            .await
            .evidence
    }

    /// Like [`collect`](Self::collect), but work still running at `deadline`
    /// is abandoned and recorded as failed.
    #[instrument(name = "collect", skip(self, sub_query, deadline, events), fields(sub_query = %sub_query))]
    pub async fn collect_within(
        &self,
        sub_query: &SubQuery,
        results_per_query: usize,
        deadline: Option<Instant>,
        events: &EventCollector,
    ) -> SubQueryEvidence {
        let hits = match self.search_hits(sub_query, results_per_query, deadline).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, provider = self.search.name(), "search failed");
                record_search_failure();
                events.emit_search_completed(sub_query, 0, Some(err.to_string()));
                return SubQueryEvidence {
                    sub_query: sub_query.clone(),
                    hits: Vec::new(),
                    evidence: Vec::new(),
                    search_error: Some(err),
                };
            }
        };
        events.emit_search_completed(sub_query, hits.len(), None);

        let group = TaskGroup::new(self.inner_limit);
        let tasks: Vec<_> = hits
            .iter()
            .map(|hit| self.research_hit(hit.clone(), deadline, events))
            .collect();
        let evidence = group.run_ordered(tasks).await;

        info!(
            hits = hits.len(),
            ok = evidence.iter().filter(|item| item.is_ok()).count(),
            "sub-query researched"
        );

        SubQueryEvidence {
            sub_query: sub_query.clone(),
            hits,
            evidence,
            search_error: None,
        }
    }

    async fn search_hits(
        &self,
        sub_query: &SubQuery,
        results_per_query: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let provider = &self.search;
        let query = sub_query.as_str();
        let per_call = self.search_timeout;

        let search = self.retry.run("search", move || async move {
            tokio::time::timeout(per_call, provider.search(query, results_per_query))
                .await
                .unwrap_or(Err(SearchError::Timeout))
        });
        let mut urls = within(deadline, search, || Err(SearchError::Timeout)).await?;
        urls.truncate(results_per_query);

        debug!(count = urls.len(), "search returned");
        Ok(urls
            .into_iter()
            .enumerate()
            .map(|(rank, url)| SearchHit {
                url,
                sub_query: sub_query.clone(),
                rank,
            })
            .collect())
    }

    async fn research_hit(
        &self,
        hit: SearchHit,
        deadline: Option<Instant>,
        events: &EventCollector,
    ) -> Evidence {
        let evidence = self.fetch_and_summarize(hit, deadline).await;
        record_evidence(evidence.status);
        events.emit_evidence(&evidence);
        evidence
    }

    async fn fetch_and_summarize(&self, hit: SearchHit, deadline: Option<Instant>) -> Evidence {
        let fetched = within(deadline, self.fetcher.fetch(&hit.url), || {
            Err(FetchError::transport(&hit.url, "request deadline reached"))
        })
        .await;
        let text = match fetched {
            Ok(text) => text,
            Err(err) => {
                warn!(url = %hit.url, error = %err, "fetch failed");
                return Evidence::fetch_failed(hit, &err);
            }
        };

        let summarizer = &self.summarizer;
        let focus = hit.sub_query.as_str();
        let text = text.as_str();
        let per_call = self.summarize_timeout;

        let summarize = self.retry.run("summarize", move || async move {
            tokio::time::timeout(per_call, summarizer.summarize(text, focus))
                .await
                .unwrap_or(Err(SummarizeError::Timeout))
        });
        let summarized = within(deadline, summarize, || Err(SummarizeError::Timeout)).await;

        match summarized {
            Ok(summary) => Evidence::ok(hit, summary),
            Err(err) => {
                warn!(url = %hit.url, error = %err, "summarize failed");
                Evidence::summarize_failed(hit, &err)
            }
        }
    }
}

/// Await `future`, or produce `on_expiry()` once `deadline` passes.
async fn within<F, T>(deadline: Option<Instant>, future: F, on_expiry: impl FnOnce() -> T) -> T
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, future).await {
            Ok(output) => output,
            Err(_) => on_expiry(),
        },
        None => future.await,
    }
}
