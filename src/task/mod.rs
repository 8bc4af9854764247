//! Bounded fan-out of shard-scoped work.
//!
//! A [`ParallelTaskGroup`] collects one unit of work per shard and runs them
//! all on a [`ShardTaskExecutor`], whose semaphore bounds how many units run
//! at the same time. The caller waits for every unit; there is no fail-fast,
//! no timeout and no cancellation.

use crate::core::{DbError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

type ShardTask = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Shared worker budget for fan-out batches.
///
/// Units of a batch larger than `pool_size` queue for a permit rather than
/// blocking a worker, so an oversize batch cannot deadlock the pool.
#[derive(Debug, Clone)]
pub struct ShardTaskExecutor {
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl ShardTaskExecutor {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Permits not currently held by a running unit.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for ShardTaskExecutor {
    fn default() -> Self {
        Self::new(8)
    }
}

/// One multi-shard batch.
#[derive(Default)]
pub struct ParallelTaskGroup {
    units: Vec<(u32, ShardTask)>,
}

impl ParallelTaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit of work bound to `shard`. The closure receives the shard
    /// index and returns the future to run.
    pub fn add_task<F, Fut>(&mut self, shard: u32, task: F)
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.units.push((shard, Box::pin(task(shard))));
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Runs every unit and waits for all of them.
    ///
    /// On failure returns the first failed unit in submission order as
    /// `ShardTaskFailed`; other failures are logged and dropped. Side effects
    /// of units that succeeded are kept.
    pub async fn execute(self, executor: &ShardTaskExecutor) -> Result<()> {
        let total = self.units.len();
        if total == 0 {
            return Ok(());
        }
        debug!(units = total, pool_size = executor.pool_size, "executing shard tasks");

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Result<()>)>();
        let mut handles = Vec::with_capacity(total);

        for (index, (shard, unit)) in self.units.into_iter().enumerate() {
            let permits = Arc::clone(&executor.permits);
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => unit.await,
                    Err(_) => Err(DbError::LockError("task executor semaphore closed".into())),
                };
                let _ = tx.send((index, outcome));
            });
            handles.push((shard, handle));
        }
        drop(tx);

        // A unit that panics drops its sender without reporting, so the
        // channel still closes once every unit is done.
        let mut outcomes: Vec<Option<Result<()>>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = rx.recv().await {
            outcomes[index] = Some(outcome);
        }

        let mut first_failure = None;
        for ((shard, handle), outcome) in handles.into_iter().zip(outcomes) {
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => match handle.await {
                    Err(join_err) => Err(DbError::TaskPanicked(join_err.to_string())),
                    Ok(()) => Err(DbError::TaskPanicked("unit finished without reporting".into())),
                },
            };

            if let Err(err) = outcome {
                if first_failure.is_none() {
                    first_failure = Some(DbError::ShardTaskFailed {
                        shard_id: shard,
                        source: Box::new(err),
                    });
                } else {
                    warn!(shard, error = %err, "shard task failed");
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_of_one_unit_does_not_stop_others() {
        let executor = ShardTaskExecutor::new(2);
        let finished = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut group = ParallelTaskGroup::new();
        for shard in 0..5u32 {
            let finished = Arc::clone(&finished);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            group.add_task(shard, move |shard| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);

                if shard == 3 {
                    return Err(DbError::QueryError("unit 3 failed".into()));
                }
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DbError>(())
            });
        }

        let err = group.execute(&executor).await.unwrap_err();
        match err {
            DbError::ShardTaskFailed { shard_id, source } => {
                assert_eq!(shard_id, 3);
                assert!(matches!(*source, DbError::QueryError(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available_permits(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_failure_by_submission_order() {
        let executor = ShardTaskExecutor::new(4);
        let mut group = ParallelTaskGroup::new();

        group.add_task(7, |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<(), _>(DbError::QueryError("slow".into()))
        });
        group.add_task(2, |_| async { Err::<(), _>(DbError::QueryError("fast".into())) });

        match group.execute(&executor).await {
            Err(DbError::ShardTaskFailed { shard_id, .. }) => assert_eq!(shard_id, 7),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversize_batch_completes() {
        let executor = ShardTaskExecutor::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut group = ParallelTaskGroup::new();
        for shard in 0..16u32 {
            let seen = Arc::clone(&seen);
            group.add_task(shard, move |shard| async move {
                seen.lock()?.push(shard);
                Ok::<_, DbError>(())
            });
        }
        group.execute(&executor).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_unit_is_reported() {
        let executor = ShardTaskExecutor::new(2);
        let mut group = ParallelTaskGroup::new();
        group.add_task(0, |_| async { Ok::<_, DbError>(()) });
        group.add_task(1, |_| async {
            if true {
                panic!("boom");
            }
            Ok::<_, DbError>(())
        });

        match group.execute(&executor).await {
            Err(DbError::ShardTaskFailed { shard_id, source }) => {
                assert_eq!(shard_id, 1);
                assert!(matches!(*source, DbError::TaskPanicked(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(executor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_empty_group() {
        let executor = ShardTaskExecutor::default();
        assert!(ParallelTaskGroup::new().execute(&executor).await.is_ok());
    }
}
