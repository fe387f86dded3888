//! Writes the final report from the research corpus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::error::{LlmError, SynthesisError};
use crate::evidence::{Question, Report, ResearchCorpus};
use crate::llm::{ChatRequest, DynLanguageModel, PromptPurpose};
use crate::prompts::PromptTemplates;

pub struct ReportSynthesizer {
    llm: DynLanguageModel,
    prompts: Arc<PromptTemplates>,
    min_report_words: usize,
    timeout: Duration,
}

impl ReportSynthesizer {
    pub fn new(
        llm: DynLanguageModel,
        prompts: Arc<PromptTemplates>,
        min_report_words: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            prompts,
            min_report_words,
            timeout,
        }
    }

    pub async fn synthesize(
        &self,
        question: &Question,
        corpus: &ResearchCorpus,
    ) -> Result<Report, SynthesisError> {
        self.synthesize_within(question, corpus, None).await
    }

    /// Write the report, giving up at the earlier of the configured timeout
    /// and `deadline`.
    ///
    /// An empty corpus is still sent to the writer, which is told that no
    /// findings were collected.
    #[instrument(name = "synthesize", skip_all, fields(evidence = corpus.len()))]
    pub async fn synthesize_within(
        &self,
        question: &Question,
        corpus: &ResearchCorpus,
        deadline: Option<Instant>,
    ) -> Result<Report, SynthesisError> {
        let context = corpus.render_context();
        let prompt = self
            .prompts
            .render_report(&context, question.as_str(), self.min_report_words);
        let request = ChatRequest::new(PromptPurpose::Report, prompt)
            .with_system(self.prompts.writer_system.clone());

        let mut expires = Instant::now() + self.timeout;
        if let Some(deadline) = deadline {
            expires = expires.min(deadline);
        }

        let body = tokio::time::timeout_at(expires, self.llm.complete(request))
            .await
            .map_err(|_| SynthesisError::Timeout)??;
        let body = body.trim();
        if body.is_empty() {
            return Err(SynthesisError::Service(LlmError::EmptyCompletion));
        }

        let sources = corpus.source_urls();
        info!(sources = sources.len(), words = body.split_whitespace().count(), "report written");

        Ok(Report {
            question: question.as_str().to_string(),
            body: body.to_string(),
            sources,
            generated_at: Utc::now(),
        })
    }
}
