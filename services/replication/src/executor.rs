//! Running replication tasks with bounded concurrency.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// A unit of work submitted to an executor.
pub type Job = BoxFuture<'static, ()>;

/// Runs jobs from a queue.
///
/// Implementations must keep at most `concurrency` jobs in flight and stop
/// taking new jobs from the queue while they are saturated, so producers
/// feel backpressure. `run` returns once the queue is closed and every job
/// has finished.
#[async_trait]
pub trait JobExecutor: fmt::Debug + Send + Sync {
    /// Drain `queue`.
    async fn run(&self, queue: mpsc::Receiver<Job>, concurrency: usize);
}

/// Executor spawning each job on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPool;

#[async_trait]
impl JobExecutor for WorkerPool {
    async fn run(&self, mut queue: mpsc::Receiver<Job>, concurrency: usize) {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut running = JoinSet::new();

        loop {
            // Take a permit before a job so the queue backs up when saturated.
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let Some(job) = queue.recv().await else {
                break;
            };
            running.spawn(async move {
                job.await;
                drop(permit);
            });
            while let Some(finished) = running.try_join_next() {
                log_panic(finished);
            }
        }

        while let Some(finished) = running.join_next().await {
            log_panic(finished);
        }
    }
}

fn log_panic(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            tracing::error!(error = %err, "Replication job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_concurrency() {
        let (tx, rx) = mpsc::channel::<Job>(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let pool = tokio::spawn(async move { WorkerPool.run(rx, 2).await });
        for _ in 0..6 {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            tx.send(
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await
            .unwrap();
        }
        drop(tx);
        pool.await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
