//! The replication engine: executions, tasks and their lifecycle.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt as _;
use harbor_core::backoff::BackoffPolicy;
use harbor_core::config::ReplicationConfig;
use harbor_core::event::{Event, EventBus, EventKind, EventPayload};
use harbor_core::model::{
    Execution, ExecutionId, ExecutionStatus, NewTask, PolicyId, RegistryId, ReplicationPolicy,
    ReplicationTrigger, Task, TaskCounters, TaskStatus, TriggerSource,
};
use harbor_core::store::Store;
use harbor_core::{Error, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterRegistry, Health, Resource};
use crate::executor::{Job, JobExecutor, WorkerPool};
use crate::filter::{self, destination_repository, Filters};
use crate::plan::{plan, PlanOptions, PlannedTask};
use crate::scheduler::parse_cron;
use crate::transfer::{MountCache, Transfer};

fn counter(counters: &mut TaskCounters, status: TaskStatus) -> &mut u32 {
    match status {
        TaskStatus::Pending => &mut counters.pending,
        TaskStatus::InProgress => &mut counters.in_progress,
        TaskStatus::Succeed => &mut counters.succeed,
        TaskStatus::Failed => &mut counters.failed,
        TaskStatus::Stopped => &mut counters.stopped,
    }
}

/// Keeps an execution row and its counters in step with task transitions.
struct Tracker {
    execution: Mutex<Execution>,
    store: Arc<dyn Store>,
    events: Option<EventBus>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker").finish_non_exhaustive()
    }
}

impl Tracker {
    async fn publish(&self, execution: &Execution) {
        if let Some(events) = &self.events {
            events
                .publish(Event::new(
                    EventKind::ReplicationStatusChanged,
                    "",
                    EventPayload::Replication {
                        policy_id: execution.policy_id,
                        execution_id: execution.id,
                        status: execution.status,
                    },
                ))
                .await;
        }
    }

    async fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        let snapshot = {
            let mut execution = self.execution.lock().await;
            execution.status = status;
            self.store.update_execution(&execution).await?;
            execution.clone()
        };
        self.publish(&snapshot).await;
        Ok(())
    }

    async fn set_total(&self, total: u32) -> Result<()> {
        let mut execution = self.execution.lock().await;
        execution.total = total;
        execution.counters.pending = total;
        self.store.update_execution(&execution).await
    }

    async fn transition(&self, task: &mut Task, status: TaskStatus) -> Result<()> {
        let mut execution = self.execution.lock().await;
        let previous = counter(&mut execution.counters, task.status);
        *previous = previous.saturating_sub(1);
        *counter(&mut execution.counters, status) += 1;

        task.status = status;
        let now = Utc::now();
        if status == TaskStatus::InProgress && task.start_time.is_none() {
            task.start_time = Some(now);
        }
        if status.is_terminal() {
            task.end_time = Some(now);
        }
        self.store.update_task(task).await?;
        self.store.update_execution(&execution).await
    }

    async fn request_stop(&self) -> Result<()> {
        let mut execution = self.execution.lock().await;
        if execution.stop_requested {
            return Ok(());
        }
        execution.stop_requested = true;
        self.store.update_execution(&execution).await
    }

    /// Stop leftover tasks and settle the aggregate status.
    async fn finish(&self, failure: Option<&Error>) -> Result<Execution> {
        let execution_id = self.execution.lock().await.id;
        for mut task in self.store.list_tasks(execution_id).await? {
            if !task.status.is_terminal() {
                self.transition(&mut task, TaskStatus::Stopped).await?;
            }
        }

        let snapshot = {
            let mut execution = self.execution.lock().await;
            let counters = execution.counters;
            execution.status = match failure {
                Some(err) if !err.is_cancelled() => {
                    execution.status_text = err.message().to_owned();
                    ExecutionStatus::Failed
                }
                _ if counters.failed > 0 => {
                    execution.status_text =
                        format!("{} of {} tasks failed", counters.failed, execution.total);
                    ExecutionStatus::Failed
                }
                _ if counters.stopped > 0 => ExecutionStatus::Stopped,
                // Cancelled before any task was planned.
                Some(_) if execution.total == 0 => ExecutionStatus::Stopped,
                _ => ExecutionStatus::Succeed,
            };
            execution.end_time = Some(Utc::now());
            self.store.update_execution(&execution).await?;
            execution.clone()
        };
        self.publish(&snapshot).await;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone)]
struct Running {
    cancel: CancellationToken,
    tracker: Arc<Tracker>,
    done: watch::Receiver<bool>,
}

/// Everything the tasks of one execution share.
#[derive(Debug)]
struct ExecutionContext {
    policy: ReplicationPolicy,
    src: Arc<dyn Adapter>,
    dst: Arc<dyn Adapter>,
    cancel: CancellationToken,
    tracker: Arc<Tracker>,
    mounts: MountCache,
    backoff: BackoffPolicy,
    chunk_size: usize,
}

impl ExecutionContext {
    fn transfer(&self) -> Transfer<'_> {
        Transfer {
            src: self.src.as_ref(),
            dst: self.dst.as_ref(),
            cancel: &self.cancel,
            speed_limit_kb: self.policy.speed_limit_kb,
            chunk_size: self.policy.copy_by_chunk.then_some(self.chunk_size),
            override_existing: self.policy.override_existing,
            same_registry: self.src.endpoint().url == self.dst.endpoint().url,
            mounts: &self.mounts,
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    adapters: AdapterRegistry,
    executor: Arc<dyn JobExecutor>,
    events: Option<EventBus>,
    config: ReplicationConfig,
    local: Option<Arc<dyn Adapter>>,
    running: DashMap<ExecutionId, Running>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("adapters", &self.adapters)
            .field("executor", &self.executor)
            .field("running", &self.running.len())
            .finish()
    }
}

/// Builder for [`ReplicationEngine`].
#[derive(Debug)]
pub struct EngineBuilder {
    store: Arc<dyn Store>,
    adapters: Option<AdapterRegistry>,
    executor: Arc<dyn JobExecutor>,
    events: Option<EventBus>,
    config: ReplicationConfig,
    local: Option<Arc<dyn Adapter>>,
}

impl EngineBuilder {
    /// Adapter types available to registry endpoints. Defaults to the
    /// built-in types enabled in the configuration.
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Executor running tasks. Defaults to [`WorkerPool`].
    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Bus receiving execution status changes.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Concurrency, retry and transfer settings.
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Adapter for the local registry, used where a policy names no
    /// registry.
    pub fn local(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.local = Some(adapter);
        self
    }

    /// Build the engine.
    pub fn build(self) -> ReplicationEngine {
        let adapters = self
            .adapters
            .unwrap_or_else(|| AdapterRegistry::builtin(&self.config.enabled_adapters));
        ReplicationEngine {
            inner: Arc::new(Inner {
                store: self.store,
                adapters,
                executor: self.executor,
                events: self.events,
                config: self.config,
                local: self.local,
                running: DashMap::new(),
            }),
        }
    }
}

/// Runs replication policies.
///
/// Each [`start`](ReplicationEngine::start) creates an execution, lists and
/// filters the source, plans one task per artifact reference and runs the
/// tasks on the executor. Executions can be stopped at any time; their
/// unfinished tasks end as `Stopped`.
#[derive(Debug, Clone)]
pub struct ReplicationEngine {
    inner: Arc<Inner>,
}

impl ReplicationEngine {
    /// Start building an engine persisting to `store`.
    pub fn builder(store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            store,
            adapters: None,
            executor: Arc::new(WorkerPool),
            events: None,
            config: ReplicationConfig::default(),
            local: None,
        }
    }

    /// The persistence layer.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Registered adapter types.
    pub fn adapter_types(&self) -> Vec<&str> {
        self.inner.adapters.types()
    }

    /// Adapter for `registry`, or for the local registry.
    pub async fn adapter(&self, registry: Option<RegistryId>) -> Result<Arc<dyn Adapter>> {
        match registry {
            None => self.inner.local.clone().ok_or_else(|| {
                Error::invalid("no local registry adapter is configured")
            }),
            Some(id) => {
                let endpoint = self.inner.store.get_registry(id).await?;
                self.inner.adapters.create(&endpoint)
            }
        }
    }

    /// Whether `registry` is reachable.
    pub async fn health_check(&self, registry: RegistryId) -> Result<Health> {
        self.adapter(Some(registry)).await?.health_check().await
    }

    /// Check a policy before it is stored.
    pub async fn validate_policy(&self, policy: &ReplicationPolicy) -> Result<()> {
        if policy.name.trim().is_empty() {
            return Err(Error::invalid("policy name must not be empty"));
        }
        match (policy.src_registry, policy.dst_registry) {
            (None, None) => {
                return Err(Error::invalid(
                    "source and destination cannot both be the local registry",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(Error::invalid(
                    "either source or destination must be the local registry",
                ))
            }
            (Some(remote), None) | (None, Some(remote)) => {
                let endpoint = self.inner.store.get_registry(remote).await?;
                if !self.inner.adapters.types().contains(&endpoint.registry_type.as_str()) {
                    return Err(Error::invalid(format!(
                        "adapter type {:?} is not enabled",
                        endpoint.registry_type
                    ))
                    .with_code("UNSUPPORTED"));
                }
            }
        }
        if policy.dst_namespace_replace_count < -1 {
            return Err(Error::invalid("dst_namespace_replace_count must be -1 or more"));
        }
        filter::validate(&policy.filters)?;
        if let ReplicationTrigger::Scheduled { cron } = &policy.trigger {
            parse_cron(cron)?;
        }
        Ok(())
    }

    /// Start an execution of `policy_id`, listing resources at the source.
    pub async fn start(&self, policy_id: PolicyId, trigger: TriggerSource) -> Result<ExecutionId> {
        self.start_with_resources(policy_id, trigger, None).await
    }

    /// Start an execution of `policy_id` over `resources`, or over the
    /// source listing when `None`. Returns once the execution row exists;
    /// the work continues in the background.
    #[tracing::instrument(skip(self, resources))]
    pub async fn start_with_resources(
        &self,
        policy_id: PolicyId,
        trigger: TriggerSource,
        resources: Option<Vec<Resource>>,
    ) -> Result<ExecutionId> {
        let policy = self.inner.store.get_replication_policy(policy_id).await?;
        if !policy.enabled {
            return Err(Error::invalid(format!("policy {} is disabled", policy.name))
                .with_code("PRECONDITION"));
        }

        let execution = self.inner.store.create_execution(policy_id, trigger).await?;
        let execution_id = execution.id;
        let tracker = Arc::new(Tracker {
            execution: Mutex::new(execution),
            store: self.inner.store.clone(),
            events: self.inner.events.clone(),
        });
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.running.insert(
            execution_id,
            Running {
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                done: done_rx,
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine
                .execute(policy, tracker.clone(), cancel, resources)
                .await;
            if let Err(err) = &outcome {
                tracing::warn!(execution = execution_id, error = %err, "Replication execution failed");
            }
            match tracker.finish(outcome.as_ref().err()).await {
                Ok(execution) => {
                    tracing::info!(
                        execution = execution_id,
                        status = %execution.status,
                        succeed = execution.counters.succeed,
                        failed = execution.counters.failed,
                        stopped = execution.counters.stopped,
                        "Replication execution finished"
                    );
                }
                Err(err) => {
                    tracing::error!(execution = execution_id, error = %err, "Could not record execution result");
                }
            }
            engine.inner.running.remove(&execution_id);
            let _ = done_tx.send(true);
        });

        tracing::info!(execution = execution_id, "Started replication");
        Ok(execution_id)
    }

    async fn execute(
        &self,
        policy: ReplicationPolicy,
        tracker: Arc<Tracker>,
        cancel: CancellationToken,
        resources: Option<Vec<Resource>>,
    ) -> Result<()> {
        tracker.set_status(ExecutionStatus::InProgress).await?;
        let src = self.adapter(policy.src_registry).await?;
        let dst = self.adapter(policy.dst_registry).await?;

        let filters = Filters::new(&policy.filters)?;
        let resources = match resources {
            Some(resources) => resources,
            None => src.list_resources(&policy.filters).await?,
        };
        let resources = filters.apply(resources);
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let namespace = policy.dst_namespace.as_deref();
        let pushed = resources
            .iter()
            .filter(|resource| !resource.deleted)
            .map(|resource| {
                Ok(Resource {
                    repository: destination_repository(
                        &resource.repository,
                        namespace,
                        policy.dst_namespace_replace_count,
                    )?,
                    ..resource.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if !pushed.is_empty() {
            dst.prepare_for_push(&pushed).await?;
        }

        let options = PlanOptions {
            dst_namespace: namespace,
            replace_count: policy.dst_namespace_replace_count,
            override_existing: policy.override_existing,
            concurrency: self.inner.config.concurrency,
        };
        let planned = plan(&resources, dst.as_ref(), &options).await?;

        let execution_id = tracker.execution.lock().await.id;
        let mut work = Vec::with_capacity(planned.len());
        for task in planned {
            let row = self
                .inner
                .store
                .create_task(NewTask {
                    execution_id,
                    resource_type: task.resource_type,
                    src_resource: task.src_resource(),
                    dst_resource: task.dst_resource(),
                    operation: task.operation,
                    digest: task.digest.as_ref().map(ToString::to_string),
                })
                .await?;
            work.push((row, task));
        }
        tracker.set_total(work.len() as u32).await?;
        tracing::info!(execution = execution_id, tasks = work.len(), "Planned replication");

        let context = Arc::new(ExecutionContext {
            policy,
            src,
            dst,
            cancel: cancel.clone(),
            tracker,
            mounts: MountCache::new(),
            backoff: self.inner.config.backoff.clone(),
            chunk_size: self.inner.config.chunk_size,
        });

        let concurrency = self.inner.config.concurrency.max(1);
        let (queue, jobs) = mpsc::channel::<Job>(concurrency);
        let producer = async move {
            for (row, task) in work {
                let context = context.clone();
                let job = run_task(context, row, task).boxed();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = queue.send(job) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        };
        tokio::join!(self.inner.executor.run(jobs, concurrency), producer);
        Ok(())
    }

    /// Request that an execution stop. Stopping a finished execution does
    /// nothing.
    pub async fn stop(&self, execution_id: ExecutionId) -> Result<()> {
        let running = self
            .inner
            .running
            .get(&execution_id)
            .map(|entry| entry.value().clone());
        if let Some(running) = running {
            running.tracker.request_stop().await?;
            running.cancel.cancel();
            tracing::info!(execution = execution_id, "Stopping replication");
            return Ok(());
        }

        let mut execution = self.inner.store.get_execution(execution_id).await?;
        if !execution.status.is_terminal() {
            // Not running in this process, so nothing will ever finish it.
            execution.stop_requested = true;
            execution.status = ExecutionStatus::Stopped;
            execution.end_time = Some(Utc::now());
            self.inner.store.update_execution(&execution).await?;
        }
        Ok(())
    }

    /// Stop every running execution.
    pub async fn stop_all(&self) {
        let ids: Vec<ExecutionId> = self.inner.running.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Err(err) = self.stop(id).await {
                tracing::warn!(execution = id, error = %err, "Could not stop execution");
            }
        }
    }

    /// Wait for an execution to finish and return its final row.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<Execution> {
        let done = self
            .inner
            .running
            .get(&execution_id)
            .map(|entry| entry.value().done.clone());
        if let Some(mut done) = done {
            // A closed channel means the execution finished.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.inner.store.get_execution(execution_id).await
    }

    /// Current state of an execution.
    pub async fn execution(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.inner.store.get_execution(execution_id).await
    }

    /// Tasks of an execution.
    pub async fn tasks(&self, execution_id: ExecutionId) -> Result<Vec<Task>> {
        self.inner.store.list_tasks(execution_id).await
    }

    /// Executions running in this process.
    pub fn running(&self) -> Vec<ExecutionId> {
        self.inner.running.iter().map(|e| *e.key()).collect()
    }
}

/// Run one task with retries until it succeeds, fails for good, or the
/// execution is stopped.
async fn run_task(context: Arc<ExecutionContext>, mut task: Task, planned: PlannedTask) {
    let tracker = &context.tracker;
    if context.cancel.is_cancelled() {
        let result = tracker.transition(&mut task, TaskStatus::Stopped).await;
        log_state(task.id, result);
        return;
    }
    let result = tracker.transition(&mut task, TaskStatus::InProgress).await;
    log_state(task.id, result);

    let transfer = context.transfer();
    let mut backoff = context.backoff.start();
    let status = loop {
        let err = match transfer.run(&planned).await {
            Ok(outcome) => {
                tracing::debug!(task = task.id, ?outcome, "Task finished");
                break TaskStatus::Succeed;
            }
            Err(err) => err,
        };
        if err.is_cancelled() || context.cancel.is_cancelled() {
            break TaskStatus::Stopped;
        }
        task.last_error = Some(err.message().to_owned());
        if !err.is_retryable() {
            tracing::warn!(task = task.id, resource = %task.src_resource, error = %err, "Task failed");
            break TaskStatus::Failed;
        }
        let Some(delay) = backoff.next_delay(err.retry_after()) else {
            tracing::warn!(task = task.id, resource = %task.src_resource, error = %err, "Task failed after retries");
            break TaskStatus::Failed;
        };
        task.retries = backoff.retries();
        tracing::info!(task = task.id, retry = task.retries, ?delay, error = %err, "Retrying task");
        if let Err(err) = context.tracker.store.update_task(&task).await {
            tracing::warn!(task = task.id, error = %err, "Could not record retry");
        }
        tokio::select! {
            _ = context.cancel.cancelled() => break TaskStatus::Stopped,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    let result = tracker.transition(&mut task, status).await;
    log_state(task.id, result);
}

fn log_state(task: harbor_core::model::TaskId, result: Result<()>) {
    if let Err(err) = result {
        tracing::error!(task, error = %err, "Could not record task state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::{Operation, ResourceType};
    use harbor_core::store::{MemoryStore, ReplicationStore};

    async fn tracker(tasks: usize) -> (Tracker, Vec<Task>) {
        let store = Arc::new(MemoryStore::new());
        let policy = store
            .create_replication_policy(ReplicationPolicy {
                id: 0,
                name: "push".into(),
                src_registry: None,
                dst_registry: None,
                dst_namespace: None,
                dst_namespace_replace_count: -1,
                filters: Vec::new(),
                trigger: ReplicationTrigger::Manual,
                override_existing: false,
                enabled: true,
                speed_limit_kb: None,
                copy_by_chunk: false,
                replicate_deletion: false,
            })
            .await
            .unwrap();
        let execution = store
            .create_execution(policy.id, TriggerSource::Manual)
            .await
            .unwrap();
        let mut rows = Vec::new();
        for n in 0..tasks {
            rows.push(
                store
                    .create_task(NewTask {
                        execution_id: execution.id,
                        resource_type: ResourceType::Image,
                        src_resource: format!("team/app:v{n}"),
                        dst_resource: format!("mirror/app:v{n}"),
                        operation: Operation::Copy,
                        digest: None,
                    })
                    .await
                    .unwrap(),
            );
        }
        let tracker = Tracker {
            execution: Mutex::new(execution),
            store,
            events: None,
        };
        tracker.set_total(tasks as u32).await.unwrap();
        (tracker, rows)
    }

    #[tokio::test]
    async fn late_stop_keeps_a_clean_run_succeeded() {
        let (tracker, tasks) = tracker(2).await;
        for mut task in tasks {
            tracker.transition(&mut task, TaskStatus::InProgress).await.unwrap();
            tracker.transition(&mut task, TaskStatus::Succeed).await.unwrap();
        }
        tracker.request_stop().await.unwrap();

        let execution = tracker.finish(Some(&Error::cancelled())).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeed);
        assert!(execution.stop_requested);
        assert_eq!(execution.counters.succeed, 2);
    }

    #[tokio::test]
    async fn stop_with_leftover_tasks_is_stopped() {
        let (tracker, mut tasks) = tracker(2).await;
        tracker.transition(&mut tasks[0], TaskStatus::InProgress).await.unwrap();
        tracker.transition(&mut tasks[0], TaskStatus::Succeed).await.unwrap();
        tracker.request_stop().await.unwrap();

        let execution = tracker.finish(None).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
        assert_eq!((execution.counters.succeed, execution.counters.stopped), (1, 1));
    }

    #[tokio::test]
    async fn failures_outrank_stops() {
        let (tracker, mut tasks) = tracker(2).await;
        tracker.transition(&mut tasks[0], TaskStatus::Failed).await.unwrap();
        tracker.request_stop().await.unwrap();

        let execution = tracker.finish(None).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.status_text, "1 of 2 tasks failed");
    }

    #[test]
    fn counters_follow_transitions() {
        let mut counters = TaskCounters {
            pending: 2,
            ..TaskCounters::default()
        };
        *counter(&mut counters, TaskStatus::Pending) -= 1;
        *counter(&mut counters, TaskStatus::InProgress) += 1;
        assert_eq!(counters.running(), 2);
        assert_eq!(counters.in_progress, 1);
    }
}
