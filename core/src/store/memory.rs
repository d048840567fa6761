use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{ArtifactStore, HookStore, PolicyStore, ProjectStore, QuotaStore, ReplicationStore};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Debug, Clone, Copy)]
struct QuotaRow {
    hard: Option<u64>,
    used: u64,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    project_id: ProjectId,
    size: u64,
    expires: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,

    projects: BTreeMap<ProjectId, Project>,
    members: HashMap<(ProjectId, String), Role>,
    repositories: BTreeMap<RepositoryId, Repository>,

    artifacts: BTreeMap<ArtifactId, Artifact>,
    references: Vec<ArtifactReference>,
    accessories: Vec<Accessory>,
    tags: BTreeMap<TagId, Tag>,
    tag_history: Vec<TagHistory>,
    labels: BTreeMap<LabelId, Label>,
    artifact_labels: BTreeSet<(ArtifactId, LabelId)>,
    scan_reports: HashMap<Digest, ScanReportRef>,

    immutable_rules: BTreeMap<ImmutableRuleId, ImmutableRule>,
    retention_policies: BTreeMap<RetentionPolicyId, RetentionPolicy>,
    system_allowlist: CveAllowlist,

    quotas: HashMap<ProjectId, QuotaRow>,
    reservations: HashMap<ReservationId, Reservation>,
    project_blobs: HashMap<(ProjectId, Digest), u64>,

    registries: BTreeMap<RegistryId, RegistryEndpoint>,
    policies: BTreeMap<PolicyId, ReplicationPolicy>,
    executions: BTreeMap<ExecutionId, Execution>,
    tasks: BTreeMap<TaskId, Task>,

    hooks: BTreeMap<HookExecutionId, HookExecution>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn project(&self, id: ProjectId) -> Result<&Project> {
        self.projects
            .get(&id)
            .filter(|p| !p.deleted)
            .ok_or_else(|| Error::not_found(format!("project {id} not found")))
    }

    fn artifact(&self, id: ArtifactId) -> Result<&Artifact> {
        self.artifacts
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("artifact {id} not found")))
    }

    fn reserved(&self, project_id: ProjectId, now: Instant) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.project_id == project_id && r.expires > now)
            .map(|r| r.size)
            .sum()
    }

    /// Refuse `size` more bytes if they would take the project over its limit.
    fn check_room(&self, project_id: ProjectId, size: u64, now: Instant) -> Result<()> {
        let row = self.quota(project_id)?;
        let reserved = self.reserved(project_id, now);
        if let Some(hard) = row.hard {
            let wanted = row.used.saturating_add(reserved).saturating_add(size);
            if wanted > hard {
                return Err(Error::quota_exceeded(format!(
                    "adding {size} bytes would exceed the project quota: used {} + reserved {reserved} of {hard} bytes",
                    row.used
                ))
                .with_code("QUOTA_EXCEEDED")
                .with_detail(serde_json::json!({
                    "requested": size,
                    "used": row.used,
                    "reserved": reserved,
                    "hard": hard,
                })));
            }
        }
        Ok(())
    }

    fn quota(&self, project_id: ProjectId) -> Result<QuotaRow> {
        self.quotas
            .get(&project_id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("quota of project {project_id} not found")))
    }

    fn remember_tag(&mut self, tag: &Tag, at: DateTime<Utc>) {
        if let Some(artifact) = self.artifacts.get(&tag.artifact_id) {
            self.tag_history.push(TagHistory {
                repository_id: tag.repository_id,
                name: tag.name.clone(),
                digest: artifact.digest.clone(),
                replaced_at: at,
            });
        }
    }
}

/// In-process implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(&self, project: NewProject) -> Result<Project> {
        let mut tables = self.tables.write().await;
        if tables
            .projects
            .values()
            .any(|p| !p.deleted && p.name == project.name)
        {
            return Err(Error::conflict(format!(
                "project {} already exists",
                project.name
            )));
        }

        let id = tables.id();
        let row = Project {
            id,
            name: project.name,
            owner: project.owner,
            metadata: project.metadata,
            cve_allowlist: CveAllowlist::default(),
            created: Utc::now(),
            deleted: false,
        };
        tables.projects.insert(id, row.clone());
        tables.quotas.insert(
            id,
            QuotaRow {
                hard: project.storage_limit,
                used: 0,
            },
        );
        Ok(row)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.tables.read().await.project(id).cloned()
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Project> {
        self.tables
            .read()
            .await
            .projects
            .values()
            .find(|p| !p.deleted && p.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("project {name} not found")))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self
            .tables
            .read()
            .await
            .projects
            .values()
            .filter(|p| !p.deleted)
            .cloned()
            .collect())
    }

    async fn update_project_metadata(
        &self,
        id: ProjectId,
        metadata: ProjectMetadata,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.project(id)?;
        if let Some(project) = tables.projects.get_mut(&id) {
            project.metadata = metadata;
        }
        Ok(())
    }

    async fn set_project_allowlist(&self, id: ProjectId, allowlist: CveAllowlist) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.project(id)?;
        if let Some(project) = tables.projects.get_mut(&id) {
            project.cve_allowlist = allowlist;
        }
        Ok(())
    }

    async fn delete_project(&self, id: ProjectId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.project(id)?;
        if tables.repositories.values().any(|r| r.project_id == id) {
            return Err(Error::conflict(format!(
                "project {id} still contains repositories"
            )));
        }
        if let Some(project) = tables.projects.get_mut(&id) {
            project.deleted = true;
        }
        Ok(())
    }

    async fn set_member(&self, project_id: ProjectId, username: &str, role: Role) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.project(project_id)?;
        tables
            .members
            .insert((project_id, username.to_owned()), role);
        Ok(())
    }

    async fn member_role(&self, project_id: ProjectId, username: &str) -> Result<Option<Role>> {
        Ok(self
            .tables
            .read()
            .await
            .members
            .get(&(project_id, username.to_owned()))
            .copied())
    }

    async fn ensure_repository(&self, project_id: ProjectId, name: &str) -> Result<Repository> {
        let mut tables = self.tables.write().await;
        tables.project(project_id)?;
        if let Some(existing) = tables.repositories.values().find(|r| r.name == name) {
            return Ok(existing.clone());
        }
        let id = tables.id();
        let now = Utc::now();
        let repository = Repository {
            id,
            project_id,
            name: name.to_owned(),
            created: now,
            updated: now,
            pull_count: 0,
        };
        tables.repositories.insert(id, repository.clone());
        Ok(repository)
    }

    async fn get_repository(&self, name: &str) -> Result<Repository> {
        self.tables
            .read()
            .await
            .repositories
            .values()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("repository {name} not found")).with_code("NAME_UNKNOWN")
            })
    }

    async fn list_repositories(&self, project_id: Option<ProjectId>) -> Result<Vec<Repository>> {
        let tables = self.tables.read().await;
        let mut repositories: Vec<_> = tables
            .repositories
            .values()
            .filter(|r| project_id.map_or(true, |id| r.project_id == id))
            .cloned()
            .collect();
        repositories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repositories)
    }

    async fn delete_repository(&self, id: RepositoryId) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.artifacts.values().any(|a| a.repository_id == id) {
            return Err(Error::conflict(format!(
                "repository {id} still contains artifacts"
            )));
        }
        tables
            .repositories
            .remove(&id)
            .map(drop)
            .ok_or_else(|| Error::not_found(format!("repository {id} not found")))
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn upsert_artifact(&self, artifact: NewArtifact) -> Result<(Artifact, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .artifacts
            .values()
            .find(|a| a.repository_id == artifact.repository_id && a.digest == artifact.digest)
        {
            return Ok((existing.clone(), false));
        }
        if !tables.repositories.contains_key(&artifact.repository_id) {
            return Err(Error::not_found(format!(
                "repository {} not found",
                artifact.repository_id
            )));
        }

        let id = tables.id();
        let row = Artifact {
            id,
            project_id: artifact.project_id,
            repository_id: artifact.repository_id,
            repository_name: artifact.repository_name,
            digest: artifact.digest,
            manifest_media_type: artifact.manifest_media_type,
            media_type: artifact.media_type,
            artifact_type: artifact.artifact_type,
            size: artifact.size,
            icon: artifact.icon,
            annotations: artifact.annotations,
            extra_attrs: artifact.extra_attrs,
            push_time: Utc::now(),
            pull_time: None,
            pull_count: 0,
        };
        tables.artifacts.insert(id, row.clone());
        if let Some(repository) = tables.repositories.get_mut(&row.repository_id) {
            repository.updated = row.push_time;
        }
        Ok((row, true))
    }

    async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact> {
        self.tables.read().await.artifact(id).cloned()
    }

    async fn find_artifact(
        &self,
        repository_id: RepositoryId,
        digest: &Digest,
    ) -> Result<Option<Artifact>> {
        Ok(self
            .tables
            .read()
            .await
            .artifacts
            .values()
            .find(|a| a.repository_id == repository_id && &a.digest == digest)
            .cloned())
    }

    async fn list_artifacts(&self, repository_id: RepositoryId) -> Result<Vec<Artifact>> {
        let tables = self.tables.read().await;
        let mut artifacts: Vec<_> = tables
            .artifacts
            .values()
            .filter(|a| a.repository_id == repository_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| b.push_time.cmp(&a.push_time).then(b.id.cmp(&a.id)));
        Ok(artifacts)
    }

    async fn find_artifact_by_icon(&self, digest: &Digest) -> Result<Option<Artifact>> {
        let icon = digest.to_string();
        Ok(self
            .tables
            .read()
            .await
            .artifacts
            .values()
            .find(|a| a.icon.as_deref() == Some(icon.as_str()))
            .cloned())
    }

    async fn delete_artifact(&self, id: ArtifactId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.artifact(id)?;

        if tables.references.iter().any(|r| r.child_id == id) {
            return Err(Error::conflict(format!(
                "artifact {id} is referenced by an index"
            )));
        }
        if tables
            .accessories
            .iter()
            .any(|a| a.subject_artifact_id == id)
        {
            return Err(Error::conflict(format!(
                "artifact {id} is the subject of accessories"
            )));
        }

        let now = Utc::now();
        let tags: Vec<Tag> = tables
            .tags
            .values()
            .filter(|t| t.artifact_id == id)
            .cloned()
            .collect();
        for tag in tags {
            tables.remember_tag(&tag, now);
            tables.tags.remove(&tag.id);
        }
        tables.references.retain(|r| r.parent_id != id);
        tables.accessories.retain(|a| a.artifact_id != id);
        tables.artifact_labels.retain(|(artifact, _)| *artifact != id);
        tables.artifacts.remove(&id);
        Ok(())
    }

    async fn record_pull(&self, id: ArtifactId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let repository_id = {
            let artifact = tables
                .artifacts
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("artifact {id} not found")))?;
            artifact.pull_time = Some(at);
            artifact.pull_count += 1;
            artifact.repository_id
        };
        if let Some(repository) = tables.repositories.get_mut(&repository_id) {
            repository.pull_count += 1;
        }
        Ok(())
    }

    async fn add_reference(&self, reference: ArtifactReference) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.artifact(reference.parent_id)?;
        tables.artifact(reference.child_id)?;
        let exists = tables
            .references
            .iter()
            .any(|r| r.parent_id == reference.parent_id && r.child_id == reference.child_id);
        if !exists {
            tables.references.push(reference);
        }
        Ok(())
    }

    async fn references_of(&self, parent_id: ArtifactId) -> Result<Vec<ArtifactReference>> {
        Ok(self
            .tables
            .read()
            .await
            .references
            .iter()
            .filter(|r| r.parent_id == parent_id)
            .cloned()
            .collect())
    }

    async fn parents_of(&self, child_id: ArtifactId) -> Result<Vec<ArtifactReference>> {
        Ok(self
            .tables
            .read()
            .await
            .references
            .iter()
            .filter(|r| r.child_id == child_id)
            .cloned()
            .collect())
    }

    async fn remove_references(&self, parent_id: ArtifactId) -> Result<()> {
        self.tables
            .write()
            .await
            .references
            .retain(|r| r.parent_id != parent_id);
        Ok(())
    }

    async fn add_accessory(&self, accessory: Accessory) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.artifact(accessory.artifact_id)?;
        tables.artifact(accessory.subject_artifact_id)?;
        let exists = tables.accessories.iter().any(|a| {
            a.artifact_id == accessory.artifact_id
                && a.subject_artifact_id == accessory.subject_artifact_id
        });
        if !exists {
            tables.accessories.push(accessory);
        }
        Ok(())
    }

    async fn accessories_of(&self, subject_id: ArtifactId) -> Result<Vec<Accessory>> {
        Ok(self
            .tables
            .read()
            .await
            .accessories
            .iter()
            .filter(|a| a.subject_artifact_id == subject_id)
            .cloned()
            .collect())
    }

    async fn accessory_for(&self, artifact_id: ArtifactId) -> Result<Option<Accessory>> {
        Ok(self
            .tables
            .read()
            .await
            .accessories
            .iter()
            .find(|a| a.artifact_id == artifact_id)
            .cloned())
    }

    async fn upsert_tag(
        &self,
        repository_id: RepositoryId,
        name: &str,
        artifact_id: ArtifactId,
    ) -> Result<Option<ArtifactId>> {
        let mut tables = self.tables.write().await;
        tables.artifact(artifact_id)?;
        let now = Utc::now();

        let existing = tables
            .tags
            .values()
            .find(|t| t.repository_id == repository_id && t.name == name)
            .cloned();

        match existing {
            Some(tag) if tag.artifact_id == artifact_id => Ok(Some(artifact_id)),
            Some(tag) => {
                tables.remember_tag(&tag, now);
                if let Some(row) = tables.tags.get_mut(&tag.id) {
                    row.artifact_id = artifact_id;
                    row.push_time = now;
                    row.pull_time = None;
                }
                Ok(Some(tag.artifact_id))
            }
            None => {
                let id = tables.id();
                tables.tags.insert(
                    id,
                    Tag {
                        id,
                        repository_id,
                        artifact_id,
                        name: name.to_owned(),
                        push_time: now,
                        pull_time: None,
                    },
                );
                Ok(None)
            }
        }
    }

    async fn get_tag(&self, repository_id: RepositoryId, name: &str) -> Result<Option<Tag>> {
        Ok(self
            .tables
            .read()
            .await
            .tags
            .values()
            .find(|t| t.repository_id == repository_id && t.name == name)
            .cloned())
    }

    async fn tags_of(&self, artifact_id: ArtifactId) -> Result<Vec<Tag>> {
        let tables = self.tables.read().await;
        let mut tags: Vec<_> = tables
            .tags
            .values()
            .filter(|t| t.artifact_id == artifact_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn list_tags(&self, repository_id: RepositoryId) -> Result<Vec<Tag>> {
        let tables = self.tables.read().await;
        let mut tags: Vec<_> = tables
            .tags
            .values()
            .filter(|t| t.repository_id == repository_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn delete_tag(&self, id: TagId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let tag = tables
            .tags
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("tag {id} not found")))?;
        tables.remember_tag(&tag, Utc::now());
        Ok(())
    }

    async fn tag_history(
        &self,
        repository_id: RepositoryId,
        name: &str,
    ) -> Result<Vec<TagHistory>> {
        Ok(self
            .tables
            .read()
            .await
            .tag_history
            .iter()
            .filter(|h| h.repository_id == repository_id && h.name == name)
            .cloned()
            .collect())
    }

    async fn record_tag_pull(&self, id: TagId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(tag) = tables.tags.get_mut(&id) {
            tag.pull_time = Some(at);
        }
        Ok(())
    }

    async fn create_label(&self, label: Label) -> Result<Label> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.labels.values().any(|l| {
            l.name == label.name && l.scope == label.scope && l.project_id == label.project_id
        });
        if duplicate {
            return Err(Error::conflict(format!("label {} already exists", label.name)));
        }
        let id = tables.id();
        let label = Label { id, ..label };
        tables.labels.insert(id, label.clone());
        Ok(label)
    }

    async fn get_label(&self, id: LabelId) -> Result<Label> {
        self.tables
            .read()
            .await
            .labels
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("label {id} not found")))
    }

    async fn find_label(&self, name: &str, project_id: ProjectId) -> Result<Option<Label>> {
        let tables = self.tables.read().await;
        let project_scoped = tables.labels.values().find(|l| {
            l.name == name && l.scope == LabelScope::Project && l.project_id == Some(project_id)
        });
        let global = || {
            tables
                .labels
                .values()
                .find(|l| l.name == name && l.scope == LabelScope::Global)
        };
        Ok(project_scoped.or_else(global).cloned())
    }

    async fn add_artifact_label(&self, artifact_id: ArtifactId, label_id: LabelId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.artifact(artifact_id)?;
        if !tables.labels.contains_key(&label_id) {
            return Err(Error::not_found(format!("label {label_id} not found")));
        }
        tables.artifact_labels.insert((artifact_id, label_id));
        Ok(())
    }

    async fn remove_artifact_label(
        &self,
        artifact_id: ArtifactId,
        label_id: LabelId,
    ) -> Result<()> {
        let removed = self
            .tables
            .write()
            .await
            .artifact_labels
            .remove(&(artifact_id, label_id));
        if removed {
            Ok(())
        } else {
            Err(Error::not_found(format!(
                "label {label_id} is not attached to artifact {artifact_id}"
            )))
        }
    }

    async fn labels_of(&self, artifact_id: ArtifactId) -> Result<Vec<Label>> {
        let tables = self.tables.read().await;
        Ok(tables
            .artifact_labels
            .iter()
            .filter(|(artifact, _)| *artifact == artifact_id)
            .filter_map(|(_, label)| tables.labels.get(label).cloned())
            .collect())
    }

    async fn put_scan_report(&self, report: ScanReportRef) -> Result<()> {
        self.tables
            .write()
            .await
            .scan_reports
            .insert(report.digest.clone(), report);
        Ok(())
    }

    async fn latest_scan_report(&self, digest: &Digest) -> Result<Option<ScanReportRef>> {
        Ok(self.tables.read().await.scan_reports.get(digest).cloned())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn create_immutable_rule(&self, rule: ImmutableRule) -> Result<ImmutableRule> {
        let mut tables = self.tables.write().await;
        tables.project(rule.project_id)?;
        let id = tables.id();
        let rule = ImmutableRule { id, ..rule };
        tables.immutable_rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn list_immutable_rules(&self, project_id: ProjectId) -> Result<Vec<ImmutableRule>> {
        Ok(self
            .tables
            .read()
            .await
            .immutable_rules
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn delete_immutable_rule(&self, id: ImmutableRuleId) -> Result<()> {
        self.tables
            .write()
            .await
            .immutable_rules
            .remove(&id)
            .map(drop)
            .ok_or_else(|| Error::not_found(format!("immutable rule {id} not found")))
    }

    async fn put_retention_policy(&self, policy: RetentionPolicy) -> Result<RetentionPolicy> {
        let mut tables = self.tables.write().await;
        tables.project(policy.project_id)?;
        let id = if policy.id == 0 { tables.id() } else { policy.id };
        let policy = RetentionPolicy { id, ..policy };
        tables.retention_policies.insert(id, policy.clone());
        Ok(policy)
    }

    async fn get_retention_policy(&self, id: RetentionPolicyId) -> Result<RetentionPolicy> {
        self.tables
            .read()
            .await
            .retention_policies
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("retention policy {id} not found")))
    }

    async fn system_allowlist(&self) -> Result<CveAllowlist> {
        Ok(self.tables.read().await.system_allowlist.clone())
    }

    async fn set_system_allowlist(&self, allowlist: CveAllowlist) -> Result<()> {
        self.tables.write().await.system_allowlist = allowlist;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_quota(&self, project_id: ProjectId) -> Result<Quota> {
        let tables = self.tables.read().await;
        let row = tables.quota(project_id)?;
        Ok(Quota {
            project_id,
            hard: row.hard,
            used: row.used,
            reserved: tables.reserved(project_id, Instant::now()),
        })
    }

    async fn set_quota_limit(&self, project_id: ProjectId, hard: Option<u64>) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.quota(project_id)?;
        if let Some(row) = tables.quotas.get_mut(&project_id) {
            row.hard = hard;
        }
        Ok(())
    }

    async fn set_quota_usage(&self, project_id: ProjectId, used: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.quota(project_id)?;
        if let Some(row) = tables.quotas.get_mut(&project_id) {
            row.used = used;
        }
        Ok(())
    }

    async fn reserve(
        &self,
        project_id: ProjectId,
        size: u64,
        ttl: Duration,
    ) -> Result<ReservationId> {
        let mut tables = self.tables.write().await;
        let now = Instant::now();
        tables.reservations.retain(|_, r| r.expires > now);

        tables.check_room(project_id, size, now)?;

        let id = ReservationId(uuid::Uuid::new_v4());
        tables.reservations.insert(
            id,
            Reservation {
                project_id,
                size,
                expires: now + ttl,
            },
        );
        Ok(id)
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let reservation = tables
            .reservations
            .remove(&id)
            .filter(|r| r.expires > Instant::now())
            .ok_or_else(|| Error::not_found("quota reservation not found"))?;
        if let Some(row) = tables.quotas.get_mut(&reservation.project_id) {
            row.used = row.used.saturating_add(reservation.size);
        }
        Ok(())
    }

    async fn charge_usage(&self, project_id: ProjectId, size: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        let now = Instant::now();
        tables.reservations.retain(|_, r| r.expires > now);
        tables.check_room(project_id, size, now)?;
        if let Some(row) = tables.quotas.get_mut(&project_id) {
            row.used = row.used.saturating_add(size);
        }
        Ok(())
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<()> {
        self.tables.write().await.reservations.remove(&id);
        Ok(())
    }

    async fn release_usage(&self, project_id: ProjectId, size: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.quotas.get_mut(&project_id) {
            row.used = row.used.saturating_sub(size);
        }
        Ok(())
    }

    async fn add_project_blob(
        &self,
        project_id: ProjectId,
        digest: &Digest,
        size: u64,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let key = (project_id, digest.clone());
        if tables.project_blobs.contains_key(&key) {
            return Ok(false);
        }
        tables.project_blobs.insert(key, size);
        Ok(true)
    }

    async fn remove_project_blob(
        &self,
        project_id: ProjectId,
        digest: &Digest,
    ) -> Result<Option<u64>> {
        Ok(self
            .tables
            .write()
            .await
            .project_blobs
            .remove(&(project_id, digest.clone())))
    }
}

#[async_trait]
impl ReplicationStore for MemoryStore {
    async fn create_registry(&self, registry: RegistryEndpoint) -> Result<RegistryEndpoint> {
        let mut tables = self.tables.write().await;
        if tables.registries.values().any(|r| r.name == registry.name) {
            return Err(Error::conflict(format!(
                "registry {} already exists",
                registry.name
            )));
        }
        let id = tables.id();
        let registry = RegistryEndpoint { id, ..registry };
        tables.registries.insert(id, registry.clone());
        Ok(registry)
    }

    async fn get_registry(&self, id: RegistryId) -> Result<RegistryEndpoint> {
        self.tables
            .read()
            .await
            .registries
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("registry {id} not found")))
    }

    async fn list_registries(&self) -> Result<Vec<RegistryEndpoint>> {
        Ok(self.tables.read().await.registries.values().cloned().collect())
    }

    async fn create_replication_policy(
        &self,
        policy: ReplicationPolicy,
    ) -> Result<ReplicationPolicy> {
        let mut tables = self.tables.write().await;
        if tables.policies.values().any(|p| p.name == policy.name) {
            return Err(Error::conflict(format!(
                "replication policy {} already exists",
                policy.name
            )));
        }
        for registry in [policy.src_registry, policy.dst_registry].into_iter().flatten() {
            if !tables.registries.contains_key(&registry) {
                return Err(Error::not_found(format!("registry {registry} not found")));
            }
        }
        let id = tables.id();
        let policy = ReplicationPolicy { id, ..policy };
        tables.policies.insert(id, policy.clone());
        Ok(policy)
    }

    async fn update_replication_policy(&self, policy: ReplicationPolicy) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.policies.get_mut(&policy.id) {
            Some(row) => {
                *row = policy;
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "replication policy {} not found",
                policy.id
            ))),
        }
    }

    async fn get_replication_policy(&self, id: PolicyId) -> Result<ReplicationPolicy> {
        self.tables
            .read()
            .await
            .policies
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("replication policy {id} not found")))
    }

    async fn list_replication_policies(&self) -> Result<Vec<ReplicationPolicy>> {
        Ok(self.tables.read().await.policies.values().cloned().collect())
    }

    async fn delete_replication_policy(&self, id: PolicyId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let running = tables
            .executions
            .values()
            .any(|e| e.policy_id == id && !e.status.is_terminal());
        if running {
            return Err(Error::conflict(format!(
                "replication policy {id} has running executions"
            )));
        }
        tables
            .policies
            .remove(&id)
            .map(drop)
            .ok_or_else(|| Error::not_found(format!("replication policy {id} not found")))
    }

    async fn create_execution(
        &self,
        policy_id: PolicyId,
        trigger: TriggerSource,
    ) -> Result<Execution> {
        let mut tables = self.tables.write().await;
        if !tables.policies.contains_key(&policy_id) {
            return Err(Error::not_found(format!(
                "replication policy {policy_id} not found"
            )));
        }
        let id = tables.id();
        let execution = Execution {
            id,
            policy_id,
            trigger,
            status: ExecutionStatus::Pending,
            status_text: String::new(),
            start_time: Utc::now(),
            end_time: None,
            total: 0,
            counters: TaskCounters::default(),
            stop_requested: false,
        };
        tables.executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Execution> {
        self.tables
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("execution {id} not found")))
    }

    async fn list_executions(&self, policy_id: Option<PolicyId>) -> Result<Vec<Execution>> {
        Ok(self
            .tables
            .read()
            .await
            .executions
            .values()
            .rev()
            .filter(|e| policy_id.map_or(true, |id| e.policy_id == id))
            .cloned()
            .collect())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.executions.get_mut(&execution.id) {
            Some(row) => {
                *row = execution.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "execution {} not found",
                execution.id
            ))),
        }
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        let mut tables = self.tables.write().await;
        if !tables.executions.contains_key(&task.execution_id) {
            return Err(Error::not_found(format!(
                "execution {} not found",
                task.execution_id
            )));
        }
        let id = tables.id();
        let task = Task {
            id,
            execution_id: task.execution_id,
            resource_type: task.resource_type,
            src_resource: task.src_resource,
            dst_resource: task.dst_resource,
            operation: task.operation,
            status: TaskStatus::Pending,
            retries: 0,
            last_error: None,
            digest: task.digest,
            start_time: None,
            end_time: None,
        };
        tables.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.tables
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {id} not found")))
    }

    async fn list_tasks(&self, execution_id: ExecutionId) -> Result<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("task {} not found", task.id))),
        }
    }
}

#[async_trait]
impl HookStore for MemoryStore {
    async fn create_hook_execution(&self, execution: HookExecution) -> Result<HookExecutionId> {
        let mut tables = self.tables.write().await;
        let id = tables.id();
        tables
            .hooks
            .insert(id, HookExecution { id, ..execution });
        Ok(id)
    }

    async fn update_hook_execution(&self, execution: &HookExecution) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.hooks.get_mut(&execution.id) {
            Some(row) => {
                *row = execution.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "hook execution {} not found",
                execution.id
            ))),
        }
    }

    async fn due_hook_executions(&self, now: DateTime<Utc>) -> Result<Vec<HookExecution>> {
        Ok(self
            .tables
            .read()
            .await
            .hooks
            .values()
            .filter(|h| h.status == HookStatus::Pending && h.next_attempt <= now)
            .cloned()
            .collect())
    }

    async fn list_hook_executions(&self, subscriber: Option<&str>) -> Result<Vec<HookExecution>> {
        Ok(self
            .tables
            .read()
            .await
            .hooks
            .values()
            .filter(|h| subscriber.map_or(true, |name| h.subscriber == name))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    async fn project(store: &MemoryStore, limit: Option<u64>) -> Project {
        store
            .create_project(NewProject {
                name: "library".into(),
                owner: "admin".into(),
                metadata: ProjectMetadata::default(),
                storage_limit: limit,
            })
            .await
            .unwrap()
    }

    fn new_artifact(repository: &Repository, bytes: &[u8]) -> NewArtifact {
        NewArtifact {
            project_id: repository.project_id,
            repository_id: repository.id,
            repository_name: repository.name.clone(),
            digest: Digest::sha256(bytes),
            manifest_media_type: crate::media::OCI_MANIFEST.into(),
            media_type: crate::media::OCI_CONFIG.into(),
            artifact_type: ArtifactType::Image,
            size: bytes.len() as u64,
            icon: None,
            annotations: Default::default(),
            extra_attrs: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn project_names_are_unique() {
        let store = MemoryStore::new();
        project(&store, None).await;
        let err = store
            .create_project(NewProject {
                name: "library".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn project_delete_requires_empty() {
        let store = MemoryStore::new();
        let p = project(&store, None).await;
        let repo = store.ensure_repository(p.id, "library/nginx").await.unwrap();
        assert_eq!(
            store.delete_project(p.id).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        store.delete_repository(repo.id).await.unwrap();
        store.delete_project(p.id).await.unwrap();
        assert_eq!(
            store.get_project(p.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn referential_integrity() {
        let store = MemoryStore::new();
        let p = project(&store, None).await;
        let repo = store.ensure_repository(p.id, "library/nginx").await.unwrap();
        let (index, _) = store.upsert_artifact(new_artifact(&repo, b"index")).await.unwrap();
        let (child, _) = store.upsert_artifact(new_artifact(&repo, b"child")).await.unwrap();
        store
            .add_reference(ArtifactReference {
                parent_id: index.id,
                child_id: child.id,
                child_digest: child.digest.clone(),
                platform: None,
            })
            .await
            .unwrap();

        assert_eq!(
            store.delete_artifact(child.id).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        store.delete_artifact(index.id).await.unwrap();
        store.delete_artifact(child.id).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryStore::new();
        let p = project(&store, None).await;
        let repo = store.ensure_repository(p.id, "library/nginx").await.unwrap();
        let (first, created) = store.upsert_artifact(new_artifact(&repo, b"m")).await.unwrap();
        assert!(created);
        let (second, created) = store.upsert_artifact(new_artifact(&repo, b"m")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn retag_keeps_history() {
        let store = MemoryStore::new();
        let p = project(&store, None).await;
        let repo = store.ensure_repository(p.id, "library/nginx").await.unwrap();
        let (a, _) = store.upsert_artifact(new_artifact(&repo, b"a")).await.unwrap();
        let (b, _) = store.upsert_artifact(new_artifact(&repo, b"b")).await.unwrap();

        assert_eq!(store.upsert_tag(repo.id, "latest", a.id).await.unwrap(), None);
        assert_eq!(
            store.upsert_tag(repo.id, "latest", b.id).await.unwrap(),
            Some(a.id)
        );

        let tag = store.get_tag(repo.id, "latest").await.unwrap().unwrap();
        assert_eq!(tag.artifact_id, b.id);
        let history = store.tag_history(repo.id, "latest").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].digest, a.digest);
        assert!(store.tags_of(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_reservations() {
        let store = MemoryStore::new();
        let p = project(&store, Some(100)).await;
        store.set_quota_usage(p.id, 90).await.unwrap();

        let first = store.reserve(p.id, 6, Duration::from_secs(60)).await.unwrap();
        let err = store
            .reserve(p.id, 6, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        store.release_reservation(first).await.unwrap();
        let second = store.reserve(p.id, 6, Duration::from_secs(60)).await.unwrap();
        store.commit_reservation(second).await.unwrap();

        let quota = store.get_quota(p.id).await.unwrap();
        assert_eq!(quota.used, 96);
        assert_eq!(quota.reserved, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_expire() {
        let store = MemoryStore::new();
        let p = project(&store, Some(10)).await;
        store.reserve(p.id, 10, Duration::from_secs(5)).await.unwrap();
        assert!(store.reserve(p.id, 1, Duration::from_secs(5)).await.is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        store.reserve(p.id, 10, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_reservations_are_charged_directly() {
        let store = MemoryStore::new();
        let p = project(&store, Some(100)).await;
        let late = store.reserve(p.id, 60, Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let other = store.reserve(p.id, 30, Duration::from_secs(60)).await.unwrap();
        let err = store.commit_reservation(late).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        store.charge_usage(p.id, 60).await.unwrap();
        let err = store.charge_usage(p.id, 20).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        store.commit_reservation(other).await.unwrap();
        let quota = store.get_quota(p.id).await.unwrap();
        assert_eq!(quota.used, 90);
        assert_eq!(quota.reserved, 0);
    }
}
