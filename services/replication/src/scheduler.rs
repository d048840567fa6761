//! Cron triggers.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use harbor_core::model::{PolicyId, ReplicationPolicy, ReplicationTrigger, TriggerSource};
use harbor_core::{Error, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::ReplicationEngine;

/// Parse a six field (seconds first) cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|err| {
        Error::invalid(format!("invalid cron expression {expression:?}: {err}"))
    })
}

/// Run `job` at every occurrence of `schedule` until `cancel` fires.
///
/// Occurrences missed while a job runs are skipped.
pub fn spawn_cron<F, Fut>(schedule: Schedule, cancel: CancellationToken, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::debug!("Schedule has no further occurrences");
                break;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => job().await,
            }
        }
    })
}

/// Keeps one cron job per scheduled replication policy.
#[derive(Debug)]
pub struct Scheduler {
    engine: ReplicationEngine,
    jobs: DashMap<PolicyId, CancellationToken>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// A scheduler starting executions on `engine`.
    pub fn new(engine: ReplicationEngine) -> Self {
        Scheduler {
            engine,
            jobs: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Schedule `policy` if it is enabled and cron triggered, replacing any
    /// previous schedule; otherwise drop its schedule.
    pub fn schedule(&self, policy: &ReplicationPolicy) -> Result<()> {
        self.unschedule(policy.id);
        let ReplicationTrigger::Scheduled { cron } = &policy.trigger else {
            return Ok(());
        };
        if !policy.enabled {
            return Ok(());
        }
        let schedule = parse_cron(cron)?;
        let token = self.shutdown.child_token();
        let engine = self.engine.clone();
        let policy_id = policy.id;
        spawn_cron(schedule, token.clone(), move || {
            let engine = engine.clone();
            async move {
                match engine.start(policy_id, TriggerSource::Scheduled).await {
                    Ok(execution) => {
                        tracing::info!(policy = policy_id, execution, "Started scheduled replication")
                    }
                    Err(err) => {
                        tracing::warn!(policy = policy_id, error = %err, "Scheduled replication did not start")
                    }
                }
            }
        });
        self.jobs.insert(policy.id, token);
        tracing::debug!(policy = policy.id, %cron, "Scheduled replication policy");
        Ok(())
    }

    /// Drop the schedule of `policy_id`, if any.
    pub fn unschedule(&self, policy_id: PolicyId) {
        if let Some((_, token)) = self.jobs.remove(&policy_id) {
            token.cancel();
        }
    }

    /// Schedule every stored policy. Policies with a bad cron expression are
    /// logged and skipped.
    pub async fn sync(&self) -> Result<()> {
        for policy in self.engine.store().list_replication_policies().await? {
            if let Err(err) = self.schedule(&policy) {
                tracing::warn!(policy = policy.id, error = %err, "Could not schedule policy");
            }
        }
        Ok(())
    }

    /// Policies with an active schedule.
    pub fn scheduled(&self) -> Vec<PolicyId> {
        let mut ids: Vec<PolicyId> = self.jobs.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every schedule.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn six_field_expressions() {
        assert!(parse_cron("0 0 * * * *").is_ok());
        let err = parse_cron("every hour").unwrap_err();
        assert_eq!(err.kind(), harbor_core::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn cron_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counted = runs.clone();
        let handle = spawn_cron(parse_cron("* * * * * *").unwrap(), cancel.clone(), move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("the schedule fires every second");

        cancel.cancel();
        handle.await.unwrap();
    }
}
