//! Persistence interface consumed by the access plane.
//!
//! The database schema and ORM wiring live outside this workspace; the
//! services only see these traits. [`MemoryStore`] implements all of them
//! in process and enforces the same referential rules a database would.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::digest::Digest;
use crate::error::Result;
use crate::model::*;

mod memory;

pub use self::memory::MemoryStore;

/// Projects, members and repositories.
#[async_trait]
pub trait ProjectStore: fmt::Debug + Send + Sync {
    /// Create a project and its quota row. Names are unique.
    async fn create_project(&self, project: NewProject) -> Result<Project>;

    /// Project by id.
    async fn get_project(&self, id: ProjectId) -> Result<Project>;

    /// Project by name.
    async fn get_project_by_name(&self, name: &str) -> Result<Project>;

    /// Live projects, by id.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Replace project metadata.
    async fn update_project_metadata(&self, id: ProjectId, metadata: ProjectMetadata)
        -> Result<()>;

    /// Replace the project CVE allow-list.
    async fn set_project_allowlist(&self, id: ProjectId, allowlist: CveAllowlist) -> Result<()>;

    /// Soft-delete a project; fails with `Conflict` while repositories remain.
    async fn delete_project(&self, id: ProjectId) -> Result<()>;

    /// Add or change a member's role.
    async fn set_member(&self, project_id: ProjectId, username: &str, role: Role) -> Result<()>;

    /// Role of a user in a project.
    async fn member_role(&self, project_id: ProjectId, username: &str) -> Result<Option<Role>>;

    /// Create a repository, returning the existing row if present.
    async fn ensure_repository(&self, project_id: ProjectId, name: &str) -> Result<Repository>;

    /// Repository by full path.
    async fn get_repository(&self, name: &str) -> Result<Repository>;

    /// Repositories of one project, or of all projects, sorted by name.
    async fn list_repositories(&self, project_id: Option<ProjectId>) -> Result<Vec<Repository>>;

    /// Remove a repository; fails with `Conflict` while artifacts remain.
    async fn delete_repository(&self, id: RepositoryId) -> Result<()>;
}

/// Artifacts, the graph edges between them, tags, labels and scan summaries.
#[async_trait]
pub trait ArtifactStore: fmt::Debug + Send + Sync {
    /// Insert an artifact keyed by `(repository, digest)`, or return the
    /// existing row. The flag is true when the row was created.
    async fn upsert_artifact(&self, artifact: NewArtifact) -> Result<(Artifact, bool)>;

    /// Artifact by id.
    async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact>;

    /// Artifact by repository and digest.
    async fn find_artifact(
        &self,
        repository_id: RepositoryId,
        digest: &Digest,
    ) -> Result<Option<Artifact>>;

    /// Artifacts of a repository, newest push first.
    async fn list_artifacts(&self, repository_id: RepositoryId) -> Result<Vec<Artifact>>;

    /// Any artifact whose icon is `digest`.
    async fn find_artifact_by_icon(&self, digest: &Digest) -> Result<Option<Artifact>>;

    /// Delete an artifact with its tags and labels. Fails with `Conflict`
    /// while it is the child of an index or the subject of an accessory.
    async fn delete_artifact(&self, id: ArtifactId) -> Result<()>;

    /// Record a pull.
    async fn record_pull(&self, id: ArtifactId, at: DateTime<Utc>) -> Result<()>;

    /// Insert an index to child edge (idempotent).
    async fn add_reference(&self, reference: ArtifactReference) -> Result<()>;

    /// Children of an index.
    async fn references_of(&self, parent_id: ArtifactId) -> Result<Vec<ArtifactReference>>;

    /// Indexes containing an artifact.
    async fn parents_of(&self, child_id: ArtifactId) -> Result<Vec<ArtifactReference>>;

    /// Drop every edge from an index to its children.
    async fn remove_references(&self, parent_id: ArtifactId) -> Result<()>;

    /// Insert an accessory edge (idempotent).
    async fn add_accessory(&self, accessory: Accessory) -> Result<()>;

    /// Accessories of a subject.
    async fn accessories_of(&self, subject_id: ArtifactId) -> Result<Vec<Accessory>>;

    /// The accessory edge of an accessory artifact, if it is one.
    async fn accessory_for(&self, artifact_id: ArtifactId) -> Result<Option<Accessory>>;

    /// Point a tag at an artifact. The previous binding, if any, is kept as
    /// history and its artifact id returned.
    async fn upsert_tag(
        &self,
        repository_id: RepositoryId,
        name: &str,
        artifact_id: ArtifactId,
    ) -> Result<Option<ArtifactId>>;

    /// Tag by repository and name.
    async fn get_tag(&self, repository_id: RepositoryId, name: &str) -> Result<Option<Tag>>;

    /// Tags of an artifact.
    async fn tags_of(&self, artifact_id: ArtifactId) -> Result<Vec<Tag>>;

    /// Tags of a repository, sorted by name.
    async fn list_tags(&self, repository_id: RepositoryId) -> Result<Vec<Tag>>;

    /// Remove a tag, keeping its binding as history.
    async fn delete_tag(&self, id: TagId) -> Result<()>;

    /// Previous bindings of a tag, oldest first.
    async fn tag_history(&self, repository_id: RepositoryId, name: &str)
        -> Result<Vec<TagHistory>>;

    /// Record a pull through a tag.
    async fn record_tag_pull(&self, id: TagId, at: DateTime<Utc>) -> Result<()>;

    /// Create a label; names are unique within a scope.
    async fn create_label(&self, label: Label) -> Result<Label>;

    /// Label by id.
    async fn get_label(&self, id: LabelId) -> Result<Label>;

    /// Label usable in `project_id` named `name`, project scope first.
    async fn find_label(&self, name: &str, project_id: ProjectId) -> Result<Option<Label>>;

    /// Attach a label (idempotent).
    async fn add_artifact_label(&self, artifact_id: ArtifactId, label_id: LabelId) -> Result<()>;

    /// Detach a label.
    async fn remove_artifact_label(&self, artifact_id: ArtifactId, label_id: LabelId)
        -> Result<()>;

    /// Labels of an artifact.
    async fn labels_of(&self, artifact_id: ArtifactId) -> Result<Vec<Label>>;

    /// Store the latest scan summary of a digest.
    async fn put_scan_report(&self, report: ScanReportRef) -> Result<()>;

    /// Latest scan summary of a digest.
    async fn latest_scan_report(&self, digest: &Digest) -> Result<Option<ScanReportRef>>;
}

/// Immutability rules, retention policies and the system allow-list.
#[async_trait]
pub trait PolicyStore: fmt::Debug + Send + Sync {
    /// Add an immutability rule.
    async fn create_immutable_rule(&self, rule: ImmutableRule) -> Result<ImmutableRule>;

    /// Rules of a project.
    async fn list_immutable_rules(&self, project_id: ProjectId) -> Result<Vec<ImmutableRule>>;

    /// Remove a rule.
    async fn delete_immutable_rule(&self, id: ImmutableRuleId) -> Result<()>;

    /// Create or replace a retention policy.
    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<RetentionPolicy>;

    /// Retention policy by id.
    async fn get_retention_policy(&self, id: RetentionPolicyId) -> Result<RetentionPolicy>;

    /// System wide CVE allow-list.
    async fn system_allowlist(&self) -> Result<CveAllowlist>;

    /// Replace the system CVE allow-list.
    async fn set_system_allowlist(&self, allowlist: CveAllowlist) -> Result<()>;
}

/// Project storage accounting.
#[async_trait]
pub trait QuotaStore: fmt::Debug + Send + Sync {
    /// Quota of a project, with expired reservations excluded.
    async fn get_quota(&self, project_id: ProjectId) -> Result<Quota>;

    /// Change the limit.
    async fn set_quota_limit(&self, project_id: ProjectId, hard: Option<u64>) -> Result<()>;

    /// Overwrite committed usage.
    async fn set_quota_usage(&self, project_id: ProjectId, used: u64) -> Result<()>;

    /// Atomically reserve `size` bytes if `used + reserved + size <= hard`.
    /// Reservations expire after `ttl`.
    async fn reserve(&self, project_id: ProjectId, size: u64, ttl: Duration)
        -> Result<ReservationId>;

    /// Turn a reservation into usage. Fails with `NotFound` once the
    /// reservation has expired and been purged.
    async fn commit_reservation(&self, id: ReservationId) -> Result<()>;

    /// Charge `size` bytes without a reservation, if `used + reserved + size
    /// <= hard`.
    async fn charge_usage(&self, project_id: ProjectId, size: u64) -> Result<()>;

    /// Drop a reservation without using it. Unknown ids are ignored.
    async fn release_reservation(&self, id: ReservationId) -> Result<()>;

    /// Decrease committed usage, saturating at zero.
    async fn release_usage(&self, project_id: ProjectId, size: u64) -> Result<()>;

    /// Record that a project stores a blob. Returns false if it already did.
    async fn add_project_blob(&self, project_id: ProjectId, digest: &Digest, size: u64)
        -> Result<bool>;

    /// Forget a project blob, returning its size if it was recorded.
    async fn remove_project_blob(&self, project_id: ProjectId, digest: &Digest)
        -> Result<Option<u64>>;
}

/// Replication registries, policies, executions and tasks.
#[async_trait]
pub trait ReplicationStore: fmt::Debug + Send + Sync {
    /// Add a registry endpoint.
    async fn create_registry(&self, registry: RegistryEndpoint) -> Result<RegistryEndpoint>;

    /// Registry by id.
    async fn get_registry(&self, id: RegistryId) -> Result<RegistryEndpoint>;

    /// All registries.
    async fn list_registries(&self) -> Result<Vec<RegistryEndpoint>>;

    /// Add a policy.
    async fn create_replication_policy(&self, policy: ReplicationPolicy)
        -> Result<ReplicationPolicy>;

    /// Replace a policy.
    async fn update_replication_policy(&self, policy: ReplicationPolicy) -> Result<()>;

    /// Policy by id.
    async fn get_replication_policy(&self, id: PolicyId) -> Result<ReplicationPolicy>;

    /// All policies.
    async fn list_replication_policies(&self) -> Result<Vec<ReplicationPolicy>>;

    /// Remove a policy.
    async fn delete_replication_policy(&self, id: PolicyId) -> Result<()>;

    /// Start a `Pending` execution.
    async fn create_execution(&self, policy_id: PolicyId, trigger: TriggerSource)
        -> Result<Execution>;

    /// Execution by id.
    async fn get_execution(&self, id: ExecutionId) -> Result<Execution>;

    /// Executions, optionally of one policy, newest first.
    async fn list_executions(&self, policy_id: Option<PolicyId>) -> Result<Vec<Execution>>;

    /// Replace an execution row.
    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    /// Add a `Pending` task.
    async fn create_task(&self, task: NewTask) -> Result<Task>;

    /// Task by id.
    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Tasks of an execution, by id.
    async fn list_tasks(&self, execution_id: ExecutionId) -> Result<Vec<Task>>;

    /// Replace a task row.
    async fn update_task(&self, task: &Task) -> Result<()>;
}

/// Durable event delivery records.
#[async_trait]
pub trait HookStore: fmt::Debug + Send + Sync {
    /// Insert a record, returning its id.
    async fn create_hook_execution(&self, execution: HookExecution) -> Result<HookExecutionId>;

    /// Replace a record.
    async fn update_hook_execution(&self, execution: &HookExecution) -> Result<()>;

    /// `Pending` records due at `now`.
    async fn due_hook_executions(&self, now: DateTime<Utc>) -> Result<Vec<HookExecution>>;

    /// Records of one subscriber, or all.
    async fn list_hook_executions(&self, subscriber: Option<&str>) -> Result<Vec<HookExecution>>;
}

/// Everything the services persist.
pub trait Store:
    ProjectStore + ArtifactStore + PolicyStore + QuotaStore + ReplicationStore + HookStore
{
}

impl<T> Store for T where
    T: ProjectStore + ArtifactStore + PolicyStore + QuotaStore + ReplicationStore + HookStore
{
}
