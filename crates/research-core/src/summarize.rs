//! Condenses page text into a focused summary.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{LlmError, SummarizeError};
use crate::llm::{ChatRequest, DynLanguageModel, PromptPurpose};
use crate::prompts::PromptTemplates;

pub struct Summarizer {
    llm: DynLanguageModel,
    prompts: Arc<PromptTemplates>,
    max_chars: usize,
}

impl Summarizer {
    pub fn new(llm: DynLanguageModel, prompts: Arc<PromptTemplates>, max_chars: usize) -> Self {
        Self {
            llm,
            prompts,
            max_chars,
        }
    }

    /// Summarize `text` with respect to `question`. Text longer than the
    /// configured limit is cut to its first `max_chars` characters.
    #[instrument(name = "summarize", skip(self, text), fields(input_chars = text.len()))]
    pub async fn summarize(&self, text: &str, question: &str) -> Result<String, SummarizeError> {
        let excerpt = truncate_chars(text, self.max_chars);
        let prompt = self.prompts.render_summary(excerpt, question);

        let summary = self
            .llm
            .complete(ChatRequest::new(PromptPurpose::Summary, prompt))
            .await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SummarizeError::Service(LlmError::EmptyCompletion));
        }

        debug!(summary_chars = summary.len(), "page summarized");
        Ok(summary.to_string())
    }
}

/// First `max` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubLanguageModel;

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[tokio::test]
    async fn long_input_is_cut_before_prompting() {
        let llm = Arc::new(StubLanguageModel::new(|_| Ok("condensed".to_string())));
        let summarizer = Summarizer::new(
            llm.clone(),
            Arc::new(PromptTemplates::default()),
            5,
        );

        let text = "abcdefghij".repeat(3);
        let summary = summarizer.summarize(&text, "what?").await.unwrap();
        assert_eq!(summary, "condensed");

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].user.starts_with("abcde\n"));
        assert!(!requests[0].user.contains("abcdef"));
        assert_eq!(requests[0].purpose, PromptPurpose::Summary);
    }

    #[tokio::test]
    async fn same_input_gives_same_prompt() {
        let llm = Arc::new(StubLanguageModel::new(|_| Ok("s".to_string())));
        let summarizer = Summarizer::new(llm.clone(), Arc::new(PromptTemplates::default()), 8);

        summarizer.summarize("ünïcödé text body", "q").await.unwrap();
        summarizer.summarize("ünïcödé text body", "q").await.unwrap();

        let requests = llm.requests();
        assert_eq!(requests[0].user, requests[1].user);
    }

    #[tokio::test]
    async fn whitespace_completion_is_a_failure() {
        let llm = Arc::new(StubLanguageModel::new(|_| Ok("  \n ".to_string())));
        let summarizer = Summarizer::new(llm, Arc::new(PromptTemplates::default()), 100);

        let err = summarizer.summarize("text", "q").await.unwrap_err();
        assert_eq!(err, SummarizeError::Service(LlmError::EmptyCompletion));
    }
}
