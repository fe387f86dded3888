//! Request-scoped research data: questions, sub-queries, evidence and reports.

use std::collections::HashSet;
use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, PipelineError, SummarizeError};

/// Context handed to the writer when no evidence survived.
pub const NO_FINDINGS_NOTICE: &str = "No research findings could be collected for this question. \
Every search or page retrieval failed. State clearly that there is insufficient information \
to answer in depth.";

/// The caller's original free-text question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Question(String);

impl Question {
    pub fn new(text: impl Into<String>) -> Result<Self, PipelineError> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidQuestion(
                "question must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A machine-generated search query derived from a [`Question`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubQuery(String);

impl SubQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A URL returned by the search provider for one sub-query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub sub_query: SubQuery,
    /// Position in the provider's result list, starting at zero.
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    Ok,
    FetchFailed,
    SummarizeFailed,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceStatus::Ok => "ok",
            EvidenceStatus::FetchFailed => "fetch_failed",
            EvidenceStatus::SummarizeFailed => "summarize_failed",
        }
    }
}

/// Outcome of researching one search hit. Exactly one is produced per hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub source_url: String,
    pub sub_query: SubQuery,
    pub summary_text: String,
    pub status: EvidenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Evidence {
    pub fn ok(hit: SearchHit, summary_text: String) -> Self {
        Self {
            source_url: hit.url,
            sub_query: hit.sub_query,
            summary_text,
            status: EvidenceStatus::Ok,
            failure: None,
        }
    }

    pub fn fetch_failed(hit: SearchHit, error: &FetchError) -> Self {
        Self {
            source_url: hit.url,
            sub_query: hit.sub_query,
            summary_text: String::new(),
            status: EvidenceStatus::FetchFailed,
            failure: Some(error.to_string()),
        }
    }

    pub fn summarize_failed(hit: SearchHit, error: &SummarizeError) -> Self {
        Self {
            source_url: hit.url,
            sub_query: hit.sub_query,
            summary_text: String::new(),
            status: EvidenceStatus::SummarizeFailed,
            failure: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == EvidenceStatus::Ok
    }
}

/// Successful evidence of one request, in sub-query order then hit order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResearchCorpus {
    evidence: Vec<Evidence>,
}

impl ResearchCorpus {
    /// Keep only successful evidence, preserving the given order.
    pub fn from_evidence<I>(evidence: I) -> Self
    where
        I: IntoIterator<Item = Evidence>,
    {
        Self {
            evidence: evidence.into_iter().filter(Evidence::is_ok).collect(),
        }
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn len(&self) -> usize {
        self.evidence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evidence.is_empty()
    }

    /// Render the findings as one context block for the report writer.
    pub fn render_context(&self) -> String {
        if self.evidence.is_empty() {
            return NO_FINDINGS_NOTICE.to_string();
        }

        let mut output = String::new();
        for (idx, item) in self.evidence.iter().enumerate() {
            if idx > 0 {
                output.push_str("\n\n");
            }
            let _ = write!(
                output,
                "URL: {}\n\nSUMMARY: {}",
                item.source_url, item.summary_text
            );
        }
        output
    }

    /// Source URLs in corpus order with duplicates removed.
    pub fn source_urls(&self) -> Vec<String> {
        dedup_sources(self.evidence.iter().map(|item| item.source_url.as_str()))
    }
}

/// Remove duplicate URLs, keeping the first occurrence of each.
///
/// URLs that differ only by surrounding whitespace, a `#fragment` or a
/// trailing slash are treated as the same source.
pub fn dedup_sources<'a, I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for url in urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        if seen.insert(source_key(url)) {
            sources.push(url.to_string());
        }
    }
    sources
}

fn source_key(url: &str) -> String {
    let without_fragment = url.split_once('#').map_or(url, |(head, _)| head);
    without_fragment.trim_end_matches('/').to_string()
}

/// The final cited research report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub question: String,
    /// Markdown body produced by the writer.
    pub body: String,
    /// Deduplicated source URLs in citation order.
    pub sources: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    /// Markdown rendering with a source list appended when the body does not
    /// already mention every source.
    pub fn to_markdown(&self) -> String {
        let mut output = self.body.trim_end().to_string();
        let all_cited = self
            .sources
            .iter()
            .all(|source| self.body.contains(source.as_str()));
        if !all_cited {
            output.push_str("\n\n## Sources\n");
            for (idx, source) in self.sources.iter().enumerate() {
                let _ = writeln!(output, "{}. {}", idx + 1, source);
            }
        } else {
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str, query: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            sub_query: SubQuery::new(query),
            rank: 0,
        }
    }

    #[test]
    fn question_rejects_blank_text() {
        assert!(Question::new("   ").is_err());
        assert_eq!(Question::new("  why? ").unwrap().as_str(), "why?");
    }

    #[test]
    fn corpus_keeps_only_successful_evidence_in_order() {
        let evidence = vec![
            Evidence::ok(hit("https://a.example", "q1"), "alpha".into()),
            Evidence::fetch_failed(
                hit("https://b.example", "q1"),
                &FetchError::http_status("https://b.example", 404),
            ),
            Evidence::ok(hit("https://c.example", "q2"), "gamma".into()),
        ];

        let corpus = ResearchCorpus::from_evidence(evidence);
        let urls: Vec<_> = corpus
            .evidence()
            .iter()
            .map(|item| item.source_url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a.example", "https://c.example"]);
    }

    #[test]
    fn render_context_formats_findings() {
        let corpus = ResearchCorpus::from_evidence(vec![
            Evidence::ok(hit("https://a.example/x", "q1"), "Alpha grew 12%.".into()),
            Evidence::ok(hit("https://b.example/y", "q2"), "Beta shrank.".into()),
        ]);

        insta::assert_snapshot!(corpus.render_context(), @r"
        URL: https://a.example/x

        SUMMARY: Alpha grew 12%.

        URL: https://b.example/y

        SUMMARY: Beta shrank.
        ");
    }

    #[test]
    fn empty_corpus_renders_notice() {
        let corpus = ResearchCorpus::default();
        assert_eq!(corpus.render_context(), NO_FINDINGS_NOTICE);
        assert!(corpus.source_urls().is_empty());
    }

    #[test]
    fn dedup_treats_fragment_and_trailing_slash_as_same_source() {
        let sources = dedup_sources([
            "https://a.example/page",
            "https://b.example",
            "https://a.example/page/",
            " https://a.example/page#section ",
            "https://b.example",
        ]);
        assert_eq!(sources, vec!["https://a.example/page", "https://b.example"]);
    }

    #[test]
    fn markdown_appends_missing_sources() {
        let report = Report {
            question: "q".into(),
            body: "# Findings\n\nSee https://a.example".into(),
            sources: vec!["https://a.example".into(), "https://b.example".into()],
            generated_at: Utc::now(),
        };
        let markdown = report.to_markdown();
        assert!(markdown.contains("## Sources"));
        assert!(markdown.contains("2. https://b.example"));

        let cited = Report {
            body: "Cites https://a.example and https://b.example".into(),
            ..report
        };
        assert!(!cited.to_markdown().contains("## Sources"));
    }
}
