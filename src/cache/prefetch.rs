//! Background warm-up of critical keys at start-up.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::error::QueryError;
use super::executor::{Fetcher, QueryExecutor};
use super::keys::CacheKey;
use super::policy::PolicyTable;

pub struct Prefetcher<V> {
    executor: Arc<QueryExecutor<V>>,
    fetcher: Arc<dyn Fetcher<V>>,
    policies: Arc<PolicyTable>,
    targets: Vec<CacheKey>,
}

impl<V> Prefetcher<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        executor: Arc<QueryExecutor<V>>,
        fetcher: Arc<dyn Fetcher<V>>,
        policies: Arc<PolicyTable>,
        targets: Vec<CacheKey>,
    ) -> Self {
        Self {
            executor,
            fetcher,
            policies,
            targets,
        }
    }

    pub fn targets(&self) -> &[CacheKey] {
        &self.targets
    }

    /// Fire one fetch per target through the executor and return at once.
    ///
    /// Each target uses its resource's regular policy, so a prefetched entry is
    /// indistinguishable from one loaded by a reader.
    pub fn prefetch_all(&self) -> PrefetchHandle {
        let tasks = self
            .targets
            .iter()
            .cloned()
            .map(|key| {
                let executor = Arc::clone(&self.executor);
                let fetcher = Arc::clone(&self.fetcher);
                let policy = self.policies.get(key.domain()).clone();
                tokio::spawn(async move {
                    let result = executor
                        .execute(key.clone(), fetcher, &policy)
                        .await
                        .map(|_| ());
                    if let Err(error) = &result {
                        warn!(key = %key, error = %error, "Prefetch failed");
                    }
                    (key, result)
                })
            })
            .collect::<Vec<_>>();

        info!(targets = tasks.len(), "Prefetch started");
        PrefetchHandle { tasks }
    }
}

/// Outstanding prefetch tasks. Dropping the handle leaves them running.
#[derive(Debug)]
pub struct PrefetchHandle {
    tasks: Vec<JoinHandle<(CacheKey, Result<(), QueryError>)>>,
}

impl PrefetchHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every prefetch to settle.
    pub async fn join(self) -> PrefetchReport {
        let mut report = PrefetchReport::default();
        for task in self.tasks {
            match task.await {
                Ok((key, Ok(()))) => report.warmed.push(key),
                Ok((key, Err(error))) => report.failed.push((key, error.to_string())),
                Err(join_error) => warn!(error = %join_error, "Prefetch task aborted"),
            }
        }
        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Prefetch finished"
        );
        report
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrefetchReport {
    pub warmed: Vec<CacheKey>,
    pub failed: Vec<(CacheKey, String)>,
}
