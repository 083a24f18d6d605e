//! Batched create/update/delete with bounded concurrency.
//!
//! Operations run in sequential waves of `batch_size`. Inside a wave at most
//! `max_concurrency` operations are in flight. Outcome counters live behind a
//! single mutex so totals stay exact under contention.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{CmsClient, Entity};
use crate::error::{FailureKind, Result};
use crate::model::EntityKey;

/// Progress callback receiving `(completed, total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Default number of operations per wave.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default number of operations in flight within a wave.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// One write against the target instance.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Create an entity.
    Create {
        /// Content type uid.
        content_type: String,
        /// Entity body.
        body: Map<String, Value>,
    },
    /// Update an entity.
    Update {
        /// Content type uid.
        content_type: String,
        /// Target identifier.
        key: EntityKey,
        /// Fields to write.
        body: Map<String, Value>,
    },
    /// Delete an entity.
    Delete {
        /// Content type uid.
        content_type: String,
        /// Target identifier.
        key: EntityKey,
    },
}

impl BulkOperation {
    /// Content type the operation writes to.
    #[must_use]
    pub fn content_type(&self) -> &str {
        match self {
            Self::Create { content_type, .. }
            | Self::Update { content_type, .. }
            | Self::Delete { content_type, .. } => content_type,
        }
    }

    async fn execute(self, client: &dyn CmsClient) -> Result<Option<Entity>> {
        match self {
            Self::Create { content_type, body } => {
                client.create(&content_type, body).await.map(Some)
            }
            Self::Update {
                content_type,
                key,
                body,
            } => client.update(&content_type, &key, body).await.map(Some),
            Self::Delete { content_type, key } => {
                client.delete(&content_type, &key).await.map(|()| None)
            }
        }
    }
}

/// A successful operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkSuccess {
    /// Position in the submitted operation list.
    pub index: usize,
    /// Entity returned by create/update (`None` for delete).
    pub entity: Option<Entity>,
}

/// A failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkFailure {
    /// Position in the submitted operation list.
    pub index: usize,
    /// Failure category.
    pub kind: FailureKind,
    /// Error message.
    pub error: String,
}

/// Aggregate outcome of a bulk run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    /// Operations submitted.
    pub total: usize,
    /// Operations that ran to completion (success or failure).
    pub completed: usize,
    /// Successful operations.
    pub succeeded: usize,
    /// Failed operations.
    pub failed: usize,
    /// Successes sorted by index.
    pub successes: Vec<BulkSuccess>,
    /// Failures sorted by index.
    pub failures: Vec<BulkFailure>,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
}

impl BulkResult {
    /// True if every submitted operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed == 0 && self.succeeded == self.total
    }

    /// Indices of failed operations.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

#[derive(Default)]
struct Counters {
    completed: usize,
    succeeded: usize,
    failed: usize,
    successes: Vec<BulkSuccess>,
    failures: Vec<BulkFailure>,
}

/// Runs [`BulkOperation`]s against a [`CmsClient`].
pub struct BulkExecutor {
    client: Arc<dyn CmsClient>,
    progress: Option<ProgressCallback>,
    cancellation: Option<CancellationToken>,
}

impl BulkExecutor {
    /// Creates an executor over a client.
    pub fn new(client: Arc<dyn CmsClient>) -> Self {
        Self {
            client,
            progress: None,
            cancellation: None,
        }
    }

    /// Reports `(completed, total)` after each operation.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stops starting new operations once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Runs `operations` in waves of `batch_size` with at most
    /// `max_concurrency` in flight. Failures never cancel siblings.
    pub async fn run(
        &self,
        operations: Vec<BulkOperation>,
        batch_size: usize,
        max_concurrency: usize,
    ) -> BulkResult {
        let total = operations.len();
        let batch_size = batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let counters = Arc::new(Mutex::new(Counters::default()));
        let mut cancelled = false;

        let mut pending = operations.into_iter().enumerate();
        loop {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            let wave: Vec<(usize, BulkOperation)> = pending.by_ref().take(batch_size).collect();
            if wave.is_empty() {
                break;
            }
            debug!("Bulk wave of {} operations", wave.len());

            let mut handles = Vec::with_capacity(wave.len());
            for (index, operation) in wave {
                let client = Arc::clone(&self.client);
                let semaphore = Arc::clone(&semaphore);
                let counters = Arc::clone(&counters);
                let progress = self.progress.clone();
                let cancellation = self.cancellation.clone();

                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return false;
                    };
                    if cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        return false;
                    }
                    let outcome = operation.execute(client.as_ref()).await;
                    let completed = {
                        let mut c = counters.lock();
                        c.completed += 1;
                        match outcome {
                            Ok(entity) => {
                                c.succeeded += 1;
                                c.successes.push(BulkSuccess { index, entity });
                            }
                            Err(e) => {
                                c.failed += 1;
                                c.failures.push(BulkFailure {
                                    index,
                                    kind: e.kind(),
                                    error: e.to_string(),
                                });
                            }
                        }
                        c.completed
                    };
                    if let Some(progress) = progress {
                        progress(completed, total);
                    }
                    true
                });
                handles.push((index, handle));
            }

            for (index, handle) in handles {
                match handle.await {
                    Ok(true) => {}
                    Ok(false) => cancelled = true,
                    Err(join_err) => {
                        warn!("Bulk operation {} panicked: {}", index, join_err);
                        let mut c = counters.lock();
                        c.completed += 1;
                        c.failed += 1;
                        c.failures.push(BulkFailure {
                            index,
                            kind: FailureKind::Write,
                            error: join_err.to_string(),
                        });
                    }
                }
            }
        }

        let mut counters = std::mem::take(&mut *counters.lock());
        counters.successes.sort_by_key(|s| s.index);
        counters.failures.sort_by_key(|f| f.index);
        if cancelled {
            debug!(
                "Bulk run cancelled after {}/{} operations",
                counters.completed, total
            );
        }

        BulkResult {
            total,
            completed: counters.completed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            successes: counters.successes,
            failures: counters.failures,
            cancelled,
        }
    }
}

#[cfg(test)]
#[path = "bulk_tests.rs"]
mod tests;
