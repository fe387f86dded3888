use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: String,
    pub message: String,
    pub timestamp_ms: i64,
}

impl TraceEvent {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Ordered record of the steps taken for one research request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, step: impl Into<String>, message: impl Into<String>) {
        self.events.push(TraceEvent::new(step, message));
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub step: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                step: event.step.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Research Trace\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. **{}**: {}", step.index, step.step, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured\n".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = sanitize_mermaid(&format!("{}: {}", step.step, step.message));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }
        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} --> step{}", pair[0].index, pair[1].index);
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "#quot;")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the trace as pretty JSON to `<dir>/<request_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    request_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{request_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
