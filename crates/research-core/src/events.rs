//! Progress events emitted while a research request runs.
//!
//! Subscribers receive notifications about stage transitions and completed
//! work items. Events never carry partial report content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::evidence::{Evidence, EvidenceStatus, SubQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    QueryGeneration,
    Gathering,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::QueryGeneration => "query_generation",
            Stage::Gathering => "gathering",
            Stage::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        request_id: String,
        timestamp: DateTime<Utc>,
        stage: Stage,
    },
    SubQueriesGenerated {
        request_id: String,
        timestamp: DateTime<Utc>,
        sub_queries: Vec<SubQuery>,
    },
    /// A search call finished; `error` is set when it failed.
    SearchCompleted {
        request_id: String,
        timestamp: DateTime<Utc>,
        sub_query: SubQuery,
        hits: usize,
        error: Option<String>,
    },
    EvidenceCollected {
        request_id: String,
        timestamp: DateTime<Utc>,
        sub_query: SubQuery,
        source_url: String,
        status: EvidenceStatus,
    },
    ReportReady {
        request_id: String,
        timestamp: DateTime<Utc>,
        sources: usize,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    pub fn request_id(&self) -> &str {
        match self {
            PipelineEvent::StageStarted { request_id, .. }
            | PipelineEvent::SubQueriesGenerated { request_id, .. }
            | PipelineEvent::SearchCompleted { request_id, .. }
            | PipelineEvent::EvidenceCollected { request_id, .. }
            | PipelineEvent::ReportReady { request_id, .. } => request_id,
        }
    }
}

/// Cheap, cloneable handle that forwards events to an optional subscriber.
#[derive(Debug, Clone, Default)]
pub struct EventCollector {
    sender: Option<mpsc::UnboundedSender<PipelineEvent>>,
    request_id: String,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
                request_id: String::new(),
            },
            receiver,
        )
    }

    /// A collector that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Same subscriber, tagging events with `request_id`.
    pub fn for_request(&self, request_id: impl Into<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            request_id: request_id.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn emit_stage_started(&self, stage: Stage) {
        self.send(PipelineEvent::StageStarted {
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            stage,
        });
    }

    pub fn emit_sub_queries(&self, sub_queries: &[SubQuery]) {
        self.send(PipelineEvent::SubQueriesGenerated {
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            sub_queries: sub_queries.to_vec(),
        });
    }

    pub fn emit_search_completed(&self, sub_query: &SubQuery, hits: usize, error: Option<String>) {
        self.send(PipelineEvent::SearchCompleted {
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            sub_query: sub_query.clone(),
            hits,
            error,
        });
    }

    pub fn emit_evidence(&self, evidence: &Evidence) {
        self.send(PipelineEvent::EvidenceCollected {
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            sub_query: evidence.sub_query.clone(),
            source_url: evidence.source_url.clone(),
            status: evidence.status,
        });
    }

    pub fn emit_report_ready(&self, sources: usize, duration_ms: u64) {
        self.send(PipelineEvent::ReportReady {
            request_id: self.request_id.clone(),
            timestamp: Utc::now(),
            sources,
            duration_ms,
        });
    }

    fn send(&self, event: PipelineEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(err) = sender.send(event) {
            tracing::debug!(error = %err, "event subscriber went away");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_carry_request_id() {
        let (collector, mut receiver) = EventCollector::new();
        let scoped = collector.for_request("req-1");

        scoped.emit_stage_started(Stage::Gathering);
        scoped.emit_sub_queries(&[SubQuery::new("a"), SubQuery::new("b")]);

        match receiver.recv().await.unwrap() {
            PipelineEvent::StageStarted {
                request_id, stage, ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(stage, Stage::Gathering);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match receiver.recv().await.unwrap() {
            PipelineEvent::SubQueriesGenerated { sub_queries, .. } => {
                assert_eq!(sub_queries.len(), 2)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn disabled_collector_is_silent() {
        let collector = EventCollector::disabled();
        assert!(!collector.is_enabled());
        collector.emit_report_ready(3, 10);
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (collector, receiver) = EventCollector::new();
        drop(receiver);
        collector.emit_stage_started(Stage::Synthesis);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let (collector, mut receiver) = EventCollector::new();
        collector.for_request("r").emit_report_ready(2, 42);
        let event = receiver.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "report_ready");
        assert_eq!(json["sources"], 2);
        assert_eq!(event.request_id(), "r");
    }
}
