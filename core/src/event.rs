//! In-process event bus.
//!
//! Publishers (the proxy, the artifact controller, the replication engine)
//! hand [`Event`]s to the [`EventBus`], which fans them out to named
//! subscribers. Each subscriber has its own bounded queue and consumer task,
//! so events reach a given subscriber in publish order. Durable subscribers
//! additionally get a [`HookExecution`] row per event which a retry worker
//! re-delivers until it succeeds or the backoff policy gives up.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::digest::Digest;
use crate::error::Result;
use crate::model::{
    ExecutionId, ExecutionStatus, HookExecution, HookExecutionId, HookStatus, PolicyId, Severity,
};
use crate::store::Store;

const QUEUE_DEPTH: usize = 1024;

/// Kinds of events published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A manifest was pushed.
    #[serde(rename = "artifact.pushed")]
    ArtifactPushed,
    /// A manifest was pulled.
    #[serde(rename = "artifact.pulled")]
    ArtifactPulled,
    /// An artifact was deleted.
    #[serde(rename = "artifact.deleted")]
    ArtifactDeleted,
    /// A tag was created or moved.
    #[serde(rename = "tag.created")]
    TagCreated,
    /// A tag was deleted.
    #[serde(rename = "tag.deleted")]
    TagDeleted,
    /// A scan report was recorded.
    #[serde(rename = "scan.completed")]
    ScanCompleted,
    /// A replication execution changed status.
    #[serde(rename = "replication.status_changed")]
    ReplicationStatusChanged,
    /// A write was refused by the project quota.
    #[serde(rename = "quota.exceeded")]
    QuotaExceeded,
}

impl EventKind {
    /// Dotted name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ArtifactPushed => "artifact.pushed",
            EventKind::ArtifactPulled => "artifact.pulled",
            EventKind::ArtifactDeleted => "artifact.deleted",
            EventKind::TagCreated => "tag.created",
            EventKind::TagDeleted => "tag.deleted",
            EventKind::ScanCompleted => "scan.completed",
            EventKind::ReplicationStatusChanged => "replication.status_changed",
            EventKind::QuotaExceeded => "quota.exceeded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind specific data of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An artifact in a repository.
    Artifact {
        /// Project name.
        project: String,
        /// Full repository path.
        repository: String,
        /// Manifest digest.
        digest: Digest,
        /// Tags involved, if any.
        #[serde(default)]
        tags: Vec<String>,
        /// Manifest media type.
        media_type: String,
    },
    /// A single tag.
    Tag {
        /// Project name.
        project: String,
        /// Full repository path.
        repository: String,
        /// Tag name.
        tag: String,
        /// Digest the tag pointed at.
        digest: Digest,
    },
    /// A scan summary.
    Scan {
        /// Project name.
        project: String,
        /// Full repository path.
        repository: String,
        /// Scanned manifest.
        digest: Digest,
        /// Worst severity found.
        severity: Severity,
    },
    /// A replication execution.
    Replication {
        /// Policy.
        policy_id: PolicyId,
        /// Execution.
        execution_id: ExecutionId,
        /// New status.
        status: ExecutionStatus,
    },
    /// A refused quota reservation.
    Quota {
        /// Project name.
        project: String,
        /// Bytes requested.
        requested: u64,
        /// Bytes in use.
        used: u64,
        /// Limit.
        hard: Option<u64>,
    },
}

impl EventPayload {
    /// Project the event concerns, if any.
    pub fn project(&self) -> Option<&str> {
        match self {
            EventPayload::Artifact { project, .. }
            | EventPayload::Tag { project, .. }
            | EventPayload::Scan { project, .. }
            | EventPayload::Quota { project, .. } => Some(project),
            EventPayload::Replication { .. } => None,
        }
    }

    /// Repository the event concerns, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            EventPayload::Artifact { repository, .. }
            | EventPayload::Tag { repository, .. }
            | EventPayload::Scan { repository, .. } => Some(repository),
            _ => None,
        }
    }
}

/// Something that happened in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: Uuid,
    /// Kind.
    pub kind: EventKind,
    /// Publication time.
    pub occurred_at: DateTime<Utc>,
    /// User that caused the event; empty for anonymous and system actions.
    pub operator: String,
    /// Data.
    pub payload: EventPayload,
}

impl Event {
    /// A new event occurring now.
    pub fn new(kind: EventKind, operator: impl Into<String>, payload: EventPayload) -> Self {
        Event {
            id: Uuid::new_v4(),
            kind,
            occurred_at: Utc::now(),
            operator: operator.into(),
            payload,
        }
    }
}

/// Which events a subscriber receives. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Accepted kinds.
    pub kinds: Vec<EventKind>,
    /// Accepted project names.
    pub projects: Vec<String>,
}

impl EventFilter {
    /// A filter accepting every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter accepting the given kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        EventFilter {
            kinds: kinds.into_iter().collect(),
            projects: Vec::new(),
        }
    }

    /// Restrict the filter to one more project.
    pub fn project(mut self, name: impl Into<String>) -> Self {
        self.projects.push(name.into());
        self
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        let kind = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let project = self.projects.is_empty()
            || event
                .payload
                .project()
                .is_some_and(|p| self.projects.iter().any(|name| name == p));
        kind && project
    }
}

/// How hard the bus tries to deliver to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Deliver once; drop when the queue is full or delivery fails.
    #[default]
    BestEffort,
    /// Persist and retry until delivered or retries are exhausted.
    Durable,
}

/// Receiver of events.
#[async_trait]
pub trait Subscriber: fmt::Debug + Send + Sync {
    /// Handle one event. An error schedules a retry for durable subscribers.
    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// A [`Subscriber`] backed by an async closure.
pub struct FnSubscriber<F> {
    handler: F,
}

impl<F> FnSubscriber<F> {
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        FnSubscriber { handler }
    }
}

impl<F> fmt::Debug for FnSubscriber<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSubscriber").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn deliver(&self, event: &Event) -> Result<()> {
        (self.handler)(event.clone()).await
    }
}

type Envelope = (Event, Option<HookExecutionId>);

#[derive(Debug)]
struct Registration {
    name: String,
    filter: EventFilter,
    mode: DeliveryMode,
    subscriber: Arc<dyn Subscriber>,
    queue: mpsc::Sender<Envelope>,
}

struct Inner {
    subscribers: RwLock<Vec<Arc<Registration>>>,
    store: Option<Arc<dyn Store>>,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .subscribers
            .read()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        f.debug_struct("EventBus")
            .field("subscribers", &names)
            .field("durable", &self.store.is_some())
            .finish()
    }
}

/// Publish/subscribe hub. Cloning is cheap and shares subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// A bus without persistence. Durable subscribers degrade to best effort
    /// delivery with in-memory retries only.
    pub fn new() -> Self {
        Self::build(None, BackoffPolicy::default())
    }

    /// A bus recording durable deliveries in `store`.
    pub fn with_store(store: Arc<dyn Store>, backoff: BackoffPolicy) -> Self {
        Self::build(Some(store), backoff)
    }

    fn build(store: Option<Arc<dyn Store>>, backoff: BackoffPolicy) -> Self {
        EventBus {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                store,
                backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a subscriber and start its consumer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        mode: DeliveryMode,
        subscriber: Arc<dyn Subscriber>,
    ) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let registration = Arc::new(Registration {
            name: name.into(),
            filter,
            mode,
            subscriber,
            queue: tx,
        });
        tracing::debug!(subscriber = %registration.name, ?mode, "Subscribed to events");
        self.inner.subscribers.write().push(registration.clone());
        tokio::spawn(consume(self.inner.clone(), registration, rx));
    }

    /// Names of the registered subscribers.
    pub fn subscribers(&self) -> Vec<String> {
        self.inner
            .subscribers
            .read()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Best effort subscribers never block the publisher; durable ones wait
    /// for queue space once their delivery record is written.
    pub async fn publish(&self, event: Event) {
        let targets: Vec<Arc<Registration>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|r| r.filter.matches(&event))
            .cloned()
            .collect();

        tracing::trace!(kind = %event.kind, id = %event.id, targets = targets.len(), "Publishing event");

        for registration in targets {
            match registration.mode {
                DeliveryMode::BestEffort => {
                    if let Err(error) = registration.queue.try_send((event.clone(), None)) {
                        tracing::warn!(
                            subscriber = %registration.name,
                            kind = %event.kind,
                            "Dropping event: {error}"
                        );
                    }
                }
                DeliveryMode::Durable => {
                    let hook = self.record(&registration, &event).await;
                    if registration
                        .queue
                        .send((event.clone(), hook))
                        .await
                        .is_err()
                    {
                        tracing::warn!(subscriber = %registration.name, "Subscriber queue closed");
                    }
                }
            }
        }
    }

    /// Write the delivery record of a durable event. The record is leased
    /// until the consumer reports back so the retry worker leaves it alone.
    async fn record(&self, registration: &Registration, event: &Event) -> Option<HookExecutionId> {
        let store = self.inner.store.as_ref()?;
        let lease = chrono::Duration::from_std(self.inner.backoff.max).unwrap_or_default();
        let row = HookExecution {
            id: 0,
            subscriber: registration.name.clone(),
            event: event.clone(),
            status: HookStatus::Pending,
            attempts: 0,
            next_attempt: Utc::now() + lease,
            last_error: None,
        };
        match store.create_hook_execution(row).await {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::error!(subscriber = %registration.name, "Failed to record hook execution: {error}");
                None
            }
        }
    }

    /// Re-deliver every durable event whose retry is due. Returns the number
    /// of rows attempted.
    pub async fn retry_due(&self) -> Result<usize> {
        let Some(store) = self.inner.store.as_ref() else {
            return Ok(0);
        };
        let due = store.due_hook_executions(Utc::now()).await?;
        let count = due.len();
        for mut row in due {
            let registration = self
                .inner
                .subscribers
                .read()
                .iter()
                .find(|r| r.name == row.subscriber)
                .cloned();
            let Some(registration) = registration else {
                continue;
            };
            let outcome = registration.subscriber.deliver(&row.event).await;
            settle(&self.inner, &mut row, outcome);
            store.update_hook_execution(&row).await?;
        }
        Ok(count)
    }

    /// Run [`EventBus::retry_due`] every `interval` until `cancel` fires or
    /// the bus shuts down.
    pub fn spawn_retry_worker(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = bus.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = bus.retry_due().await {
                            tracing::warn!("Hook retry sweep failed: {error}");
                        }
                    }
                }
            }
        })
    }

    /// Stop every consumer task. Queued best effort events are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Apply a delivery outcome to a durable record.
fn settle(inner: &Inner, row: &mut HookExecution, outcome: Result<()>) {
    row.attempts += 1;
    match outcome {
        Ok(()) => {
            row.status = HookStatus::Succeeded;
            row.last_error = None;
        }
        Err(error) => {
            row.last_error = Some(error.to_string());
            if row.attempts > inner.backoff.max_retries {
                tracing::warn!(subscriber = %row.subscriber, attempts = row.attempts, "Giving up on event delivery: {error}");
                row.status = HookStatus::Failed;
            } else {
                let delay = inner.backoff.delay(row.attempts - 1);
                row.next_attempt = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                row.status = HookStatus::Pending;
            }
        }
    }
}

async fn consume(
    inner: Arc<Inner>,
    registration: Arc<Registration>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    loop {
        let (event, hook) = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let outcome = registration.subscriber.deliver(&event).await;
        if let Err(error) = &outcome {
            tracing::warn!(
                subscriber = %registration.name,
                kind = %event.kind,
                "Event delivery failed: {error}"
            );
        }

        let (Some(id), Some(store)) = (hook, inner.store.as_ref()) else {
            continue;
        };
        let mut row = HookExecution {
            id,
            subscriber: registration.name.clone(),
            event,
            status: HookStatus::Pending,
            attempts: 0,
            next_attempt: Utc::now(),
            last_error: None,
        };
        settle(&inner, &mut row, outcome);
        if let Err(error) = store.update_hook_execution(&row).await {
            tracing::error!(subscriber = %registration.name, "Failed to update hook execution: {error}");
        }
    }
    tracing::trace!(subscriber = %registration.name, "Event consumer stopped");
}
