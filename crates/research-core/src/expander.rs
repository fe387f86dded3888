//! Turns a question into a list of web search queries.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::error::QueryGenerationError;
use crate::evidence::{Question, SubQuery};
use crate::llm::{ChatRequest, DynLanguageModel, PromptPurpose};
use crate::prompts::PromptTemplates;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\s*\n?(.*?)\n?\s*```$").expect("invalid code fence pattern")
});

pub struct QueryExpander {
    llm: DynLanguageModel,
    prompts: Arc<PromptTemplates>,
    parse_retries: u32,
    timeout: Duration,
}

impl QueryExpander {
    pub fn new(
        llm: DynLanguageModel,
        prompts: Arc<PromptTemplates>,
        parse_retries: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            prompts,
            parse_retries,
            timeout,
        }
    }

    /// Ask the language model for `count` search queries covering `question`.
    ///
    /// The reply must be a JSON array of strings, optionally wrapped in a
    /// markdown code fence. Anything else is a `QueryGenerationError`; a
    /// reply that cannot be parsed is re-requested up to `parse_retries`
    /// more times.
    #[instrument(name = "expand", skip(self, question), fields(question = %question))]
    pub async fn expand(
        &self,
        question: &Question,
        count: usize,
    ) -> Result<Vec<SubQuery>, QueryGenerationError> {
        let prompt = self.prompts.render_query_generation(question.as_str(), count);
        let mut attempt = 0;

        loop {
            let request =
                ChatRequest::new(PromptPurpose::QueryGeneration, prompt.clone()).with_temperature(0.0);
            let raw = tokio::time::timeout(self.timeout, self.llm.complete(request))
                .await
                .map_err(|_| QueryGenerationError::Timeout)??;

            match parse_sub_queries(&raw, count) {
                Ok(queries) => {
                    if queries.len() < count {
                        warn!(
                            requested = count,
                            received = queries.len(),
                            "fewer sub-queries than requested"
                        );
                    }
                    debug!(queries = ?queries, "sub-queries generated");
                    return Ok(queries);
                }
                Err(err) if attempt < self.parse_retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "retrying unparsable sub-query list");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Parse a reply into at most `count` sub-queries.
///
/// Accepts a JSON array of strings, optionally inside a code fence. Entries
/// are trimmed; an empty entry or an empty list is rejected.
pub fn parse_sub_queries(raw: &str, count: usize) -> Result<Vec<SubQuery>, QueryGenerationError> {
    let trimmed = raw.trim();
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |inner| inner.as_str().trim());

    let unparsable = |reason: &str| QueryGenerationError::Unparsable {
        reason: reason.to_string(),
        raw: raw.to_string(),
    };

    let entries: Vec<String> =
        serde_json::from_str(body).map_err(|_| unparsable("expected a JSON array of strings"))?;

    if entries.is_empty() {
        return Err(unparsable("empty list"));
    }

    let mut queries = Vec::with_capacity(entries.len().min(count));
    for entry in entries.into_iter().take(count) {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(unparsable("blank query"));
        }
        queries.push(SubQuery::new(entry));
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::stub::StubLanguageModel;

    fn texts(queries: &[SubQuery]) -> Vec<&str> {
        queries.iter().map(SubQuery::as_str).collect()
    }

    #[test]
    fn parses_plain_and_fenced_arrays() {
        let plain = parse_sub_queries(r#"["a", " b "]"#, 3).unwrap();
        assert_eq!(texts(&plain), vec!["a", "b"]);

        let fenced = parse_sub_queries("```json\n[\"x\", \"y\"]\n```", 2).unwrap();
        assert_eq!(texts(&fenced), vec!["x", "y"]);
    }

    #[test]
    fn truncates_to_requested_count() {
        let queries = parse_sub_queries(r#"["1", "2", "3", "4"]"#, 2).unwrap();
        assert_eq!(texts(&queries), vec!["1", "2"]);
    }

    #[test]
    fn rejects_malformed_replies() {
        for raw in [
            "Here are some queries: a, b, c",
            "[]",
            r#"["ok", ""]"#,
            r#"{"queries": ["a"]}"#,
            "[1, 2]",
        ] {
            let err = parse_sub_queries(raw, 3).unwrap_err();
            assert!(
                matches!(err, QueryGenerationError::Unparsable { .. }),
                "{raw} should be unparsable"
            );
        }
    }

    #[tokio::test]
    async fn expansion_uses_zero_temperature() {
        let llm = Arc::new(StubLanguageModel::new(|_| {
            Ok(r#"["X specs", "Y specs"]"#.to_string())
        }));
        let expander = QueryExpander::new(
            llm.clone(),
            Arc::new(PromptTemplates::default()),
            0,
            Duration::from_secs(5),
        );

        let question = Question::new("Compare X and Y").unwrap();
        let queries = expander.expand(&question, 2).await.unwrap();
        assert_eq!(texts(&queries), vec!["X specs", "Y specs"]);

        let requests = llm.requests();
        assert_eq!(requests[0].temperature, Some(0.0));
        assert_eq!(requests[0].purpose, PromptPurpose::QueryGeneration);
    }

    #[tokio::test]
    async fn parse_retries_request_a_new_list() {
        let llm = Arc::new(StubLanguageModel::sequence(vec![
            Ok("not json".to_string()),
            Ok(r#"["second try"]"#.to_string()),
        ]));
        let expander = QueryExpander::new(
            llm.clone(),
            Arc::new(PromptTemplates::default()),
            1,
            Duration::from_secs(5),
        );

        let question = Question::new("q").unwrap();
        let queries = expander.expand(&question, 1).await.unwrap();
        assert_eq!(texts(&queries), vec!["second try"]);
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn service_failure_is_not_retried() {
        let llm = Arc::new(StubLanguageModel::new(|_| Err(LlmError::Status(400))));
        let expander = QueryExpander::new(
            llm.clone(),
            Arc::new(PromptTemplates::default()),
            3,
            Duration::from_secs(5),
        );

        let question = Question::new("q").unwrap();
        let err = expander.expand(&question, 2).await.unwrap_err();
        assert_eq!(err, QueryGenerationError::Service(LlmError::Status(400)));
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_times_out() {
        let llm = Arc::new(
            StubLanguageModel::new(|_| Ok(r#"["a"]"#.to_string()))
                .with_delay(Duration::from_secs(60)),
        );
        let expander = QueryExpander::new(
            llm,
            Arc::new(PromptTemplates::default()),
            0,
            Duration::from_secs(5),
        );

        let question = Question::new("q").unwrap();
        let err = expander.expand(&question, 1).await.unwrap_err();
        assert_eq!(err, QueryGenerationError::Timeout);
    }
}
