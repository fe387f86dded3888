//! Bounded concurrent execution with input-ordered results.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

/// Runs a batch of futures with at most `limit` in flight at once.
///
/// Results are returned in input order regardless of completion order.
/// Each batch gets its own permits, so nested groups limit independently.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    semaphore: Arc<Semaphore>,
}

impl TaskGroup {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub async fn run_ordered<F, T>(&self, tasks: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        let total = tasks.len();
        let mut pending = FuturesUnordered::new();

        for (slot, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            pending.push(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                (slot, task.await)
            });
        }

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        while let Some((slot, output)) = pending.next().await {
            slots[slot] = Some(output);
        }

        slots.into_iter().flatten().collect()
    }
}
