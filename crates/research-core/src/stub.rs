//! In-memory stand-ins for the language model, search provider and fetch
//! transport. Used by tests and by offline runs.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, SearchError};
use crate::fetch::{FetchTransport, RawPage, TransportError};
use crate::llm::{ChatRequest, LanguageModel, PromptPurpose};
use crate::search::SearchProvider;

const OFFLINE_SUB_QUERIES: &[&str] = &[
    "background and definitions",
    "recent developments",
    "key statistics",
    "expert opinions",
    "open questions",
];

type Responder = Box<dyn Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync>;

/// Language model answering through a closure and recording every request.
pub struct StubLanguageModel {
    responder: Responder,
    delay: Option<Duration>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl StubLanguageModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with `responses` in call order, repeating the last one.
    pub fn sequence(responses: Vec<Result<String, LlmError>>) -> Self {
        let next = AtomicUsize::new(0);
        Self::new(move |_| {
            let idx = next.fetch_add(1, Ordering::SeqCst);
            responses
                .get(idx)
                .or_else(|| responses.last())
                .cloned()
                .unwrap_or(Err(LlmError::EmptyCompletion))
        })
    }

    /// Deterministic replies for every prompt purpose, without a network.
    pub fn offline() -> Self {
        Self::new(|request| {
            Ok(match request.purpose {
                PromptPurpose::QueryGeneration => {
                    serde_json::to_string(OFFLINE_SUB_QUERIES).unwrap_or_else(|_| "[]".into())
                }
                PromptPurpose::Summary => offline_summary(&request.user),
                PromptPurpose::Report => offline_report(&request.user),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests_for(&self, purpose: PromptPurpose) -> Vec<ChatRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.purpose == purpose)
            .collect()
    }
}

#[async_trait]
impl LanguageModel for StubLanguageModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request)
    }
}

fn offline_summary(prompt: &str) -> String {
    let excerpt: String = prompt
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(160)
        .collect();
    format!("Offline summary: {excerpt}")
}

fn offline_report(prompt: &str) -> String {
    let sources: Vec<&str> = prompt
        .lines()
        .filter_map(|line| line.strip_prefix("URL: "))
        .collect();

    let mut report = String::from("# Offline research report\n\n");
    if sources.is_empty() {
        report.push_str("No findings were collected, so the question cannot be answered.\n");
        return report;
    }
    let _ = writeln!(
        report,
        "This report was assembled from {} offline findings.",
        sources.len()
    );
    report
}

#[derive(Debug, Clone)]
enum ScriptedSearch {
    Results(Vec<String>),
    Failure(SearchError),
}

/// Search provider with per-query scripted results.
///
/// Unscripted queries return `count` deterministic URLs derived from the
/// query text.
#[derive(Debug, Clone, Default)]
pub struct StubSearchProvider {
    scripted: HashMap<String, ScriptedSearch>,
    delays: HashMap<String, Duration>,
    calls: Arc<AtomicUsize>,
}

impl StubSearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results<I, S>(mut self, query: &str, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls = urls.into_iter().map(Into::into).collect();
        self.scripted
            .insert(query.to_string(), ScriptedSearch::Results(urls));
        self
    }

    pub fn with_failure(mut self, query: &str, error: SearchError) -> Self {
        self.scripted
            .insert(query.to_string(), ScriptedSearch::Failure(error));
        self
    }

    pub fn with_delay(mut self, query: &str, delay: Duration) -> Self {
        self.delays.insert(query.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StubSearchProvider {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<String>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(query) {
            tokio::time::sleep(*delay).await;
        }

        match self.scripted.get(query) {
            Some(ScriptedSearch::Results(urls)) => Ok(urls.iter().take(count).cloned().collect()),
            Some(ScriptedSearch::Failure(err)) => Err(err.clone()),
            None => {
                let slug = slugify(query);
                Ok((1..=count)
                    .map(|idx| format!("https://{slug}.example/result-{idx}"))
                    .collect())
            }
        }
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

fn slugify(text: &str) -> String {
    let slug = text
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "query".to_string()
    } else {
        slug
    }
}

/// A scripted response for [`StubTransport`].
#[derive(Debug, Clone)]
pub struct StubPage {
    status: u16,
    content_type: Option<String>,
    body: String,
    delay: Option<Duration>,
}

impl StubPage {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: body.into(),
            delay: None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/plain".to_string()),
            ..Self::html(body)
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
enum ScriptedFetch {
    Page(StubPage),
    Failure(TransportError),
}

/// Fetch transport with per-URL scripted pages and failures.
///
/// Unscripted URLs answer with a small HTML page naming the URL.
#[derive(Debug, Clone, Default)]
pub struct StubTransport {
    scripted: HashMap<String, ScriptedFetch>,
    calls: Arc<AtomicUsize>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, page: StubPage) -> Self {
        self.scripted
            .insert(url.to_string(), ScriptedFetch::Page(page));
        self
    }

    pub fn with_failure(mut self, url: &str, error: TransportError) -> Self {
        self.scripted
            .insert(url.to_string(), ScriptedFetch::Failure(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchTransport for StubTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<RawPage, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let page = match self.scripted.get(url) {
            Some(ScriptedFetch::Failure(err)) => return Err(err.clone()),
            Some(ScriptedFetch::Page(page)) => page.clone(),
            None => StubPage::html(format!(
                "<html><body><h1>{url}</h1><p>Reference material published at {url}.</p></body></html>"
            )),
        };

        if let Some(delay) = page.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(RawPage {
            status: page.status,
            content_type: page.content_type,
            body: page.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unscripted_queries_get_deterministic_urls() {
        let search = StubSearchProvider::new();
        let urls = search.search("Compare X and Y!", 2).await.unwrap();
        assert_eq!(
            urls,
            vec![
                "https://compare-x-and-y.example/result-1",
                "https://compare-x-and-y.example/result-2",
            ]
        );
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn sequence_repeats_last_reply() {
        let llm = StubLanguageModel::sequence(vec![Ok("one".into()), Ok("two".into())]);
        let request = || ChatRequest::new(PromptPurpose::Summary, "x");
        assert_eq!(llm.complete(request()).await.unwrap(), "one");
        assert_eq!(llm.complete(request()).await.unwrap(), "two");
        assert_eq!(llm.complete(request()).await.unwrap(), "two");
        assert_eq!(llm.requests().len(), 3);
    }

    #[tokio::test]
    async fn offline_model_answers_every_purpose() {
        let llm = StubLanguageModel::offline();
        let queries = llm
            .complete(ChatRequest::new(PromptPurpose::QueryGeneration, "q"))
            .await
            .unwrap();
        assert!(queries.starts_with("[\"background"));

        let report = llm
            .complete(ChatRequest::new(
                PromptPurpose::Report,
                "URL: https://a.example\n\nSUMMARY: s",
            ))
            .await
            .unwrap();
        assert!(report.contains("1 offline findings"));
    }

    #[tokio::test]
    async fn transport_serves_default_page_and_counts_calls() {
        let transport = StubTransport::new();
        let handle = transport.clone();
        let page = transport
            .get("https://any.example", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert!(page.body.contains("https://any.example"));
        assert_eq!(handle.calls(), 1);
    }
}
