//! Fans out across sub-queries and merges their evidence into one corpus.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, instrument};

use crate::collector::{EvidenceCollector, SubQueryEvidence};
use crate::events::EventCollector;
use crate::evidence::{Evidence, ResearchCorpus, SubQuery};
use crate::fanout::TaskGroup;

/// Per-sub-query results of one gathering pass, in sub-query order.
#[derive(Debug, Clone, Default)]
pub struct Gathered {
    pub per_query: Vec<SubQueryEvidence>,
}

impl Gathered {
    /// Every evidence record, sub-query order then hit order.
    pub fn evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.per_query.iter().flat_map(|entry| entry.evidence.iter())
    }

    pub fn hit_count(&self) -> usize {
        self.per_query.iter().map(|entry| entry.hits.len()).sum()
    }

    pub fn failed_searches(&self) -> usize {
        self.per_query
            .iter()
            .filter(|entry| entry.search_error.is_some())
            .count()
    }

    pub fn corpus(&self) -> ResearchCorpus {
        ResearchCorpus::from_evidence(self.evidence().cloned())
    }
}

pub struct ResearchAggregator {
    collector: Arc<EvidenceCollector>,
    outer_limit: usize,
}

impl ResearchAggregator {
    pub fn new(collector: Arc<EvidenceCollector>, outer_limit: usize) -> Self {
        Self {
            collector,
            outer_limit,
        }
    }

    /// Research every sub-query and keep the successful evidence.
    pub async fn aggregate(
        &self,
        sub_queries: &[SubQuery],
        results_per_query: usize,
    ) -> ResearchCorpus {
        self.gather(sub_queries, results_per_query, None, &EventCollector::disabled())
            .await
            .corpus()
    }

    /// Research every sub-query, keeping failures alongside successes.
    ///
    /// A failed search contributes no evidence and never aborts the others.
    #[instrument(name = "gather", skip_all, fields(sub_queries = sub_queries.len()))]
    pub async fn gather(
        &self,
        sub_queries: &[SubQuery],
        results_per_query: usize,
        deadline: Option<Instant>,
        events: &EventCollector,
    ) -> Gathered {
        let group = TaskGroup::new(self.outer_limit);
        let tasks: Vec<_> = sub_queries
            .iter()
            .map(|sub_query| {
                self.collector
                    .collect_within(sub_query, results_per_query, deadline, events)
            })
            .collect();
        let gathered = Gathered {
            per_query: group.run_ordered(tasks).await,
        };

        info!(
            hits = gathered.hit_count(),
            failed_searches = gathered.failed_searches(),
            "evidence gathered"
        );
        gathered
    }
}
