//! Prompt templates sent to the language-model service.
//!
//! Templates use `{placeholder}` markers that are filled in a single pass, so
//! text inserted for one placeholder is never re-scanned for another.

use crate::config::PromptOverrides;

pub const QUERY_GENERATION_TEMPLATE: &str = "Write {count} web search queries that together \
help form an objective opinion on the following: {question}\n\
Respond with a JSON array of exactly {count} strings and nothing else, for example: \
[\"query 1\", \"query 2\"].";

pub const SUMMARY_TEMPLATE: &str = "{text}\n\
-----------\n\
Using the above text, answer the following question briefly:\n\
> {question}\n\
-----------\n\
If the question cannot be answered from the text, summarize the text instead. \
Keep every factual detail such as numbers and statistics.";

pub const WRITER_SYSTEM_TEMPLATE: &str = "You are a critical-thinking research assistant. \
Your only purpose is to write well-written, objective and well-structured reports on the \
text you are given.";

pub const REPORT_TEMPLATE: &str = "Information:\n\
--------\n\
{research_summary}\n\
--------\n\
Using the information above, answer the following question or topic in a detailed report: \
\"{question}\"\n\
The report must focus on answering the question, be well structured, informative and in \
depth, include facts and numbers where available, and be at least {min_words} words long.\n\
Write the report in markdown.\n\
Reach your own concrete, well-founded opinion from the information; avoid vague or generic \
conclusions.\n\
List every source URL you used at the end of the report, once each, without duplicates, \
formatted as APA references.";

/// The four templates used by the pipeline.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub query_generation: String,
    pub summary: String,
    pub writer_system: String,
    pub report: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            query_generation: QUERY_GENERATION_TEMPLATE.to_string(),
            summary: SUMMARY_TEMPLATE.to_string(),
            writer_system: WRITER_SYSTEM_TEMPLATE.to_string(),
            report: REPORT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn from_overrides(overrides: &PromptOverrides) -> Self {
        let defaults = Self::default();
        Self {
            query_generation: overrides
                .query_generation
                .clone()
                .unwrap_or(defaults.query_generation),
            summary: overrides.summary.clone().unwrap_or(defaults.summary),
            writer_system: overrides
                .writer_system
                .clone()
                .unwrap_or(defaults.writer_system),
            report: overrides.report.clone().unwrap_or(defaults.report),
        }
    }

    pub fn render_query_generation(&self, question: &str, count: usize) -> String {
        let count = count.to_string();
        fill(
            &self.query_generation,
            &[("question", question), ("count", &count)],
        )
    }

    pub fn render_summary(&self, text: &str, question: &str) -> String {
        fill(&self.summary, &[("text", text), ("question", question)])
    }

    pub fn render_report(&self, research_summary: &str, question: &str, min_words: usize) -> String {
        let min_words = min_words.to_string();
        fill(
            &self.report,
            &[
                ("research_summary", research_summary),
                ("question", question),
                ("min_words", &min_words),
            ],
        )
    }
}

/// Replace `{key}` markers in one left-to-right pass. Unknown markers are
/// kept verbatim.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                output.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_is_single_pass() {
        let rendered = fill(
            "{text} / {question}",
            &[("text", "literal {question} here"), ("question", "Q")],
        );
        assert_eq!(rendered, "literal {question} here / Q");
    }

    #[test]
    fn fill_keeps_unknown_markers_and_json_braces() {
        let rendered = fill("[\"a\"] {nope} {count}", &[("count", "3")]);
        assert_eq!(rendered, "[\"a\"] {nope} 3");
    }

    #[test]
    fn query_prompt_mentions_count_and_question() {
        let prompts = PromptTemplates::default();
        let prompt = prompts.render_query_generation("Compare X and Y", 2);
        assert!(prompt.contains("Write 2 web search queries"));
        assert!(prompt.contains("Compare X and Y"));
    }

    #[test]
    fn overrides_replace_only_given_templates() {
        let overrides = PromptOverrides {
            summary: Some("S: {question}".into()),
            ..Default::default()
        };
        let prompts = PromptTemplates::from_overrides(&overrides);
        assert_eq!(prompts.render_summary("ignored", "why"), "S: why");
        assert_eq!(prompts.report, REPORT_TEMPLATE);
    }
}
