use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Decoration;
use crate::secret::Secret;

/// Registry endpoint identifier.
pub type RegistryId = i64;

/// Credential used to talk to a remote registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    /// Username, access key, or the literal `_json_key` for service accounts.
    pub access_key: String,
    /// Password or token.
    pub access_secret: Secret,
}

/// A remote (or the local) registry known to the replication engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    /// Identifier.
    #[serde(default)]
    pub id: RegistryId,
    /// Display name.
    pub name: String,
    /// Adapter type, e.g. `harbor`, `docker-hub`, `quay`.
    #[serde(rename = "type")]
    pub registry_type: String,
    /// Base URL.
    pub url: String,
    /// Credential, if any.
    #[serde(default)]
    pub credential: Option<RegistryCredential>,
    /// Skip TLS verification.
    #[serde(default)]
    pub insecure: bool,
}

/// What a replication filter looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Resource type (`image`, `chart`, `artifact`).
    Resource,
    /// Repository path.
    Name,
    /// Tag.
    Tag,
    /// Harbor label.
    Label,
}

/// A `{type, pattern}` predicate over source resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFilter {
    /// Attribute tested.
    #[serde(rename = "type")]
    pub kind: FilterKind,
    /// Doublestar pattern (or resource type name).
    pub value: String,
    /// Matches or excludes.
    #[serde(default)]
    pub decoration: Decoration,
}

/// When a policy runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationTrigger {
    /// Only on request.
    Manual,
    /// On a six field cron schedule.
    Scheduled {
        /// Cron expression.
        cron: String,
    },
    /// When matching push or delete events are published.
    EventBased,
}

/// Replication policy identifier.
pub type PolicyId = i64;

/// Source, destination, filters and trigger of a replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Identifier.
    #[serde(default)]
    pub id: PolicyId,
    /// Display name.
    pub name: String,
    /// Source registry; `None` means the local registry.
    #[serde(default)]
    pub src_registry: Option<RegistryId>,
    /// Destination registry; `None` means the local registry.
    #[serde(default)]
    pub dst_registry: Option<RegistryId>,
    /// Namespace prefixed to destination repositories.
    #[serde(default)]
    pub dst_namespace: Option<String>,
    /// Leading source path components replaced by `dst_namespace`;
    /// `-1` replaces only the project component.
    #[serde(default = "default_replace_count")]
    pub dst_namespace_replace_count: i8,
    /// Source filters.
    #[serde(default)]
    pub filters: Vec<ReplicationFilter>,
    /// Trigger.
    pub trigger: ReplicationTrigger,
    /// Replace destination artifacts whose digest differs.
    #[serde(default, rename = "override")]
    pub override_existing: bool,
    /// Disabled policies are never triggered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transfer rate limit in KiB/s; `None` means unlimited.
    #[serde(default)]
    pub speed_limit_kb: Option<u32>,
    /// Upload blobs in chunks.
    #[serde(default)]
    pub copy_by_chunk: bool,
    /// Replicate deletions for event based policies.
    #[serde(default)]
    pub replicate_deletion: bool,
}

fn default_replace_count() -> i8 {
    -1
}

fn default_true() -> bool {
    true
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// API request.
    Manual,
    /// Cron schedule.
    Scheduled,
    /// Published event.
    Event,
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Created, planning not started.
    Pending,
    /// Tasks are running.
    InProgress,
    /// Every task succeeded.
    Succeed,
    /// A task failed.
    Failed,
    /// Stopped on request.
    Stopped,
}

impl ExecutionStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeed | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    /// Waiting.
    pub pending: u32,
    /// Running.
    pub in_progress: u32,
    /// Succeeded.
    pub succeed: u32,
    /// Failed.
    pub failed: u32,
    /// Stopped.
    pub stopped: u32,
}

impl TaskCounters {
    /// Count one task.
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Succeed => self.succeed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Stopped => self.stopped += 1,
        }
    }

    /// Tasks not yet terminal.
    pub fn running(&self) -> u32 {
        self.pending + self.in_progress
    }
}

/// Execution identifier.
pub type ExecutionId = i64;

/// One run of a replication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Identifier.
    pub id: ExecutionId,
    /// Policy run.
    pub policy_id: PolicyId,
    /// What started it.
    pub trigger: TriggerSource,
    /// Aggregate status.
    pub status: ExecutionStatus,
    /// Explanation of a failure.
    pub status_text: String,
    /// Start.
    pub start_time: DateTime<Utc>,
    /// End, once terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Planned tasks.
    pub total: u32,
    /// Task counts.
    pub counters: TaskCounters,
    /// A stop was requested.
    pub stop_requested: bool,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Queued.
    Pending,
    /// Running.
    InProgress,
    /// Done.
    Succeed,
    /// Gave up.
    Failed,
    /// Cancelled.
    Stopped,
}

impl TaskStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }
}

/// Kind of resource replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Container image.
    Image,
    /// Helm chart stored as an OCI artifact.
    Chart,
    /// Any other OCI artifact.
    Artifact,
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Copy source to destination.
    Copy,
    /// Delete the destination.
    Delete,
}

/// Task identifier.
pub type TaskId = i64;

/// One unit of work of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// `repo:reference` at the source.
    pub src_resource: String,
    /// `repo:reference` at the destination.
    pub dst_resource: String,
    /// Copy or delete.
    pub operation: Operation,
    /// Status.
    pub status: TaskStatus,
    /// Retries performed.
    pub retries: u32,
    /// Last error message.
    pub last_error: Option<String>,
    /// Source digest at plan time, recorded for traceability.
    pub digest: Option<String>,
    /// Start of the first attempt.
    pub start_time: Option<DateTime<Utc>>,
    /// End, once terminal.
    pub end_time: Option<DateTime<Utc>>,
}

/// Fields needed to create a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Source resource.
    pub src_resource: String,
    /// Destination resource.
    pub dst_resource: String,
    /// Copy or delete.
    pub operation: Operation,
    /// Source digest at plan time.
    pub digest: Option<String>,
}
