//! Artifact controller.
//!
//! Keeps the artifact graph in the store in step with manifests in the blob
//! backend: pushes become artifacts with tags, children, accessories and
//! labels; deletes cascade to accessories and orphaned children and return
//! bytes to the project quota.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{BlobBackend, StorageErrorKind, StoredManifest};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use harbor_core::config::ArtifactConfig;
use harbor_core::event::{Event, EventBus, EventKind, EventPayload, Subscriber};
use harbor_core::identity::Subject;
use harbor_core::lock::DigestLocks;
use harbor_core::manifest::ParsedManifest;
use harbor_core::media::{ICON_LABEL, LABEL_PREFIX};
use harbor_core::model::{
    Accessory, AccessoryKind, Artifact, ArtifactReference, ArtifactType, Label, LabelId,
    LabelScope, NewArtifact, Project, Repository, ScanReportRef, Severity, Tag,
};
use harbor_core::reference::validate_tag;
use harbor_core::store::Store;
use harbor_core::{Digest, Error, ErrorKind, Reference, RepositoryName, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;

use crate::policy::PolicyGates;

mod icon;
mod query;

pub use self::icon::{Icon, IconService, ICON_SIZE};
pub use self::query::ArtifactQuery;

/// Largest config blob inspected for attributes and labels.
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Read a whole blob of at most `limit` bytes.
pub(crate) async fn read_small_blob(
    backend: &dyn BlobBackend,
    repository: &str,
    digest: &Digest,
    limit: u64,
) -> Result<Bytes> {
    let stream = backend.get_blob(repository, digest, None).await?;
    if stream.size > limit {
        return Err(Error::invalid(format!(
            "blob {digest} is {} bytes, more than the {limit} allowed",
            stream.size
        ))
        .with_code("SIZE_INVALID"));
    }
    let mut buffer = Vec::with_capacity(stream.length as usize);
    stream
        .reader
        .take(limit)
        .read_to_end(&mut buffer)
        .await
        .map_err(|err| Error::retryable("blob read failed", None).with_source(err))?;
    Ok(Bytes::from(buffer))
}

/// A manifest write arriving through the registry.
#[derive(Debug, Clone)]
pub struct ManifestPush {
    /// Owning project.
    pub project: Project,
    /// Target repository.
    pub repository: RepositoryName,
    /// Tag or digest the manifest is pushed under.
    pub reference: Reference,
    /// Declared `Content-Type`.
    pub content_type: Option<String>,
    /// Manifest bytes.
    pub bytes: Bytes,
}

/// What a manifest push stored.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Manifest digest.
    pub digest: Digest,
    /// The manifest's `subject`, if it has one.
    pub subject: Option<Digest>,
    /// The artifact row.
    pub artifact: Artifact,
}

/// Worst finding of the latest scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOverview {
    /// Scanner that produced the report.
    pub scanner: String,
    /// Worst severity found.
    pub severity: Severity,
    /// Number of findings.
    pub total: usize,
    /// When the scan finished.
    pub completed: DateTime<Utc>,
}

/// An artifact with everything attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactView {
    /// The artifact row.
    #[serde(flatten)]
    pub artifact: Artifact,
    /// Tags pointing at it.
    pub tags: Vec<Tag>,
    /// Attached labels.
    pub labels: Vec<Label>,
    /// Signatures, SBOMs and other accessories.
    pub accessories: Vec<Accessory>,
    /// Children, for indexes.
    pub references: Vec<ArtifactReference>,
    /// Latest scan summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_overview: Option<ScanOverview>,
}

/// Maintains the artifact graph.
#[derive(Debug, Clone)]
pub struct ArtifactController {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn Store>,
    backend: Arc<dyn BlobBackend>,
    events: EventBus,
    gates: PolicyGates,
    locks: DigestLocks,
    config: ArtifactConfig,
    icons: IconService,
    max_manifest_size: usize,
}

impl ArtifactController {
    /// A controller writing to `store` and `backend`.
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn BlobBackend>,
        events: EventBus,
        gates: PolicyGates,
        config: ArtifactConfig,
        max_manifest_size: usize,
    ) -> Self {
        let icons = IconService::new(store.clone(), backend.clone(), config.max_icon_size);
        ArtifactController {
            inner: Arc::new(Inner {
                store,
                backend,
                events,
                gates,
                locks: DigestLocks::new(),
                config,
                icons,
                max_manifest_size,
            }),
        }
    }

    /// The icon service.
    pub fn icons(&self) -> &IconService {
        &self.inner.icons
    }

    /// The artifact `reference` names in `repository`.
    pub async fn resolve(&self, repository: &RepositoryName, reference: &Reference) -> Result<Artifact> {
        let store = &self.inner.store;
        let unknown = || Error::not_found(format!("manifest {reference} not found in {repository}")).with_code("MANIFEST_UNKNOWN");
        let repo = match store.get_repository(repository.as_str()).await {
            Ok(repo) => repo,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(unknown()),
            Err(err) => return Err(err),
        };
        match reference {
            Reference::Tag(tag) => {
                let tag = store.get_tag(repo.id, tag).await?.ok_or_else(unknown)?;
                store.get_artifact(tag.artifact_id).await
            }
            Reference::Digest(digest) => store.find_artifact(repo.id, digest).await?.ok_or_else(unknown),
        }
    }

    /// Validate, gate and store a manifest, then record its artifact.
    #[tracing::instrument(skip(self, push, operator), fields(repository = %push.repository, reference = %push.reference))]
    pub async fn push_manifest(&self, push: ManifestPush, operator: &Subject) -> Result<PushOutcome> {
        let ManifestPush {
            project,
            repository,
            reference,
            content_type,
            bytes,
        } = push;
        if bytes.len() > self.inner.max_manifest_size {
            return Err(Error::invalid(format!(
                "manifest is larger than {} bytes",
                self.inner.max_manifest_size
            ))
            .with_code("MANIFEST_INVALID"));
        }
        let digest = match &reference {
            Reference::Digest(expected) if !expected.verify(&bytes) => {
                return Err(Error::invalid(format!("manifest does not hash to {expected}"))
                    .with_code("DIGEST_INVALID"));
            }
            Reference::Digest(expected) => expected.clone(),
            Reference::Tag(_) => Digest::sha256(&bytes),
        };
        let parsed = ParsedManifest::parse(&bytes, content_type.as_deref())?;

        let _guard = self.inner.locks.lock(repository.as_str(), &digest).await;

        if let Some(tag) = reference.tag() {
            if let Some(current) = self.tagged(&repository, tag).await? {
                if current.digest != digest {
                    self.inner.gates.check_immutable(&project, &repository, tag).await?;
                }
            }
        }

        let size = bytes.len() as u64;
        let reservation = self.inner.gates.reserve(&project, size, operator).await?;
        let stored = async {
            self.inner
                .backend
                .put_manifest(repository.as_str(), &digest, &parsed.media_type, bytes.clone())
                .await?;
            if let Some(tag) = reference.tag() {
                self.inner.backend.tag(repository.as_str(), tag, &digest).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(err) = stored {
            self.inner.gates.release(reservation).await;
            return Err(err);
        }
        self.inner.gates.settle(&project, &digest, size, reservation).await?;

        let manifest = StoredManifest {
            digest: digest.clone(),
            media_type: parsed.media_type.clone(),
            bytes,
        };
        let artifact = self
            .ingest(&project, &repository, &manifest, &parsed, reference.tag(), operator.name(), true)
            .await?;
        Ok(PushOutcome {
            digest,
            subject: parsed.subject.map(|subject| subject.digest),
            artifact,
        })
    }

    async fn tagged(&self, repository: &RepositoryName, tag: &str) -> Result<Option<Artifact>> {
        let store = &self.inner.store;
        let repo = match store.get_repository(repository.as_str()).await {
            Ok(repo) => repo,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match store.get_tag(repo.id, tag).await? {
            Some(tag) => store.get_artifact(tag.artifact_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Record a stored manifest as an artifact.
    #[allow(clippy::too_many_arguments)]
    async fn ingest(
        &self,
        project: &Project,
        repository: &RepositoryName,
        manifest: &StoredManifest,
        parsed: &ParsedManifest,
        tag: Option<&str>,
        operator: &str,
        notify: bool,
    ) -> Result<Artifact> {
        let store = &self.inner.store;
        let repo = store.ensure_repository(project.id, repository.as_str()).await?;

        let config = self.read_config(repository, parsed).await;
        let labels = config_labels(config.as_ref());
        let artifact_type = ArtifactType::resolve(&parsed.media_type, parsed.effective_type());
        let icon = match labels.get(ICON_LABEL).and_then(|value| value.parse::<Digest>().ok()) {
            Some(digest) if self.has_blob(repository, &digest).await => digest,
            _ => self.inner.icons.builtin_for(artifact_type).clone(),
        };
        let size = manifest.bytes.len() as u64
            + parsed
                .blobs()
                .iter()
                .map(|descriptor| descriptor.size)
                .sum::<u64>();
        let media_type = parsed
            .config
            .as_ref()
            .map(|config| config.media_type.clone())
            .or_else(|| parsed.artifact_type.clone())
            .unwrap_or_else(|| parsed.media_type.clone());

        let (artifact, created) = store
            .upsert_artifact(NewArtifact {
                project_id: project.id,
                repository_id: repo.id,
                repository_name: repo.name.clone(),
                digest: manifest.digest.clone(),
                manifest_media_type: parsed.media_type.clone(),
                media_type,
                artifact_type,
                size,
                icon: Some(icon.to_string()),
                annotations: parsed.annotations.clone(),
                extra_attrs: extra_attrs(artifact_type, config.as_ref()),
            })
            .await?;

        for child in &parsed.manifests {
            let child_artifact = match store.find_artifact(repo.id, &child.digest).await? {
                Some(existing) => existing,
                None => self.ingest_child(project, repository, &child.digest, operator).await?,
            };
            store
                .add_reference(ArtifactReference {
                    parent_id: artifact.id,
                    child_id: child_artifact.id,
                    child_digest: child.digest.clone(),
                    platform: child.platform.clone(),
                })
                .await?;
        }

        if created {
            self.attach_accessory(&repo, &artifact, parsed, tag).await?;
            for (key, _) in labels.iter().filter(|(key, _)| key.starts_with(LABEL_PREFIX)) {
                let name = &key[LABEL_PREFIX.len()..];
                match store.find_label(name, project.id).await? {
                    Some(label) => store.add_artifact_label(artifact.id, label.id).await?,
                    None => tracing::debug!(label = name, "Config names an unknown label"),
                }
            }
        }

        let mut moved = false;
        if let Some(tag) = tag {
            let previous = store.upsert_tag(repo.id, tag, artifact.id).await?;
            moved = previous != Some(artifact.id);
        }

        if notify && created {
            tracing::info!(repository = %repository, digest = %artifact.digest, "Artifact pushed");
            self.publish(
                EventKind::ArtifactPushed,
                operator,
                EventPayload::Artifact {
                    project: project.name.clone(),
                    repository: repository.to_string(),
                    digest: artifact.digest.clone(),
                    tags: tag.into_iter().map(str::to_owned).collect(),
                    media_type: artifact.manifest_media_type.clone(),
                },
            )
            .await;
        } else if let (true, true, Some(tag)) = (notify, moved, tag) {
            self.publish(
                EventKind::TagCreated,
                operator,
                EventPayload::Tag {
                    project: project.name.clone(),
                    repository: repository.to_string(),
                    tag: tag.to_owned(),
                    digest: artifact.digest.clone(),
                },
            )
            .await;
        }
        Ok(artifact)
    }

    fn ingest_child<'a>(
        &'a self,
        project: &'a Project,
        repository: &'a RepositoryName,
        digest: &'a Digest,
        operator: &'a str,
    ) -> BoxFuture<'a, Result<Artifact>> {
        Box::pin(async move {
            let manifest = self
                .inner
                .backend
                .get_manifest(repository.as_str(), digest)
                .await?;
            let parsed = ParsedManifest::parse(&manifest.bytes, Some(&manifest.media_type))?;
            self.ingest(project, repository, &manifest, &parsed, None, operator, false)
                .await
        })
    }

    async fn has_blob(&self, repository: &RepositoryName, digest: &Digest) -> bool {
        match self.inner.backend.stat_blob(repository.as_str(), digest).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(%digest, error = %err, "Icon blob missing, using the built-in icon");
                false
            }
        }
    }

    async fn read_config(&self, repository: &RepositoryName, parsed: &ParsedManifest) -> Option<Value> {
        let config = parsed.config.as_ref()?;
        if config.size > MAX_CONFIG_SIZE || config.size == 0 {
            return None;
        }
        let bytes = read_small_blob(
            self.inner.backend.as_ref(),
            repository.as_str(),
            &config.digest,
            MAX_CONFIG_SIZE,
        )
        .await
        .map_err(|err| tracing::debug!(digest = %config.digest, error = %err, "Config blob unreadable"))
        .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn accessory_kind(&self, parsed: &ParsedManifest) -> Option<AccessoryKind> {
        let table = &self.inner.config.accessory_media_types;
        parsed
            .artifact_type
            .as_ref()
            .and_then(|t| table.get(t))
            .or_else(|| parsed.config.as_ref().and_then(|c| table.get(&c.media_type)))
            .or_else(|| parsed.layers.iter().find_map(|l| table.get(&l.media_type)))
            .copied()
            .or(parsed.subject.as_ref().map(|_| AccessoryKind::Subject))
    }

    async fn attach_accessory(
        &self,
        repo: &Repository,
        artifact: &Artifact,
        parsed: &ParsedManifest,
        tag: Option<&str>,
    ) -> Result<()> {
        let Some(kind) = self.accessory_kind(parsed) else {
            return Ok(());
        };
        let subject_digest = parsed
            .subject
            .as_ref()
            .map(|subject| subject.digest.clone())
            .or_else(|| tag.and_then(cosign_subject));
        let Some(subject_digest) = subject_digest else {
            return Ok(());
        };
        let Some(subject) = self
            .inner
            .store
            .find_artifact(repo.id, &subject_digest)
            .await?
        else {
            tracing::debug!(subject = %subject_digest, "Accessory subject is not in the repository");
            return Ok(());
        };
        tracing::debug!(kind = kind.as_str(), subject = %subject.digest, "Attaching accessory");
        self.inner
            .store
            .add_accessory(Accessory {
                artifact_id: artifact.id,
                digest: artifact.digest.clone(),
                subject_artifact_id: subject.id,
                subject_digest,
                repository_id: repo.id,
                kind,
                size: artifact.size,
                artifact_type: parsed.artifact_type.clone(),
                media_type: parsed.media_type.clone(),
                annotations: parsed.annotations.clone(),
            })
            .await
    }

    /// Delete the artifact `reference` names, with its accessories and any
    /// children no other index holds, then unlink blobs nothing references.
    #[tracing::instrument(skip(self, project, operator), fields(project = %project.name))]
    pub async fn delete(
        &self,
        project: &Project,
        repository: &RepositoryName,
        reference: &Reference,
        operator: &Subject,
    ) -> Result<()> {
        let artifact = self.resolve(repository, reference).await?;
        self.delete_artifact(project, repository, artifact, operator.name(), false)
            .await?;
        self.collect_blobs(project, repository).await
    }

    fn delete_artifact<'a>(
        &'a self,
        project: &'a Project,
        repository: &'a RepositoryName,
        artifact: Artifact,
        operator: &'a str,
        cascade: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let store = &self.inner.store;
            let _guard = self
                .inner
                .locks
                .lock(repository.as_str(), &artifact.digest)
                .await;

            let tags = store.tags_of(artifact.id).await?;
            for tag in &tags {
                self.inner
                    .gates
                    .check_immutable(project, repository, &tag.name)
                    .await?;
            }
            if !cascade && !store.parents_of(artifact.id).await?.is_empty() {
                return Err(Error::conflict(format!(
                    "{} is referenced by an index and cannot be deleted on its own",
                    artifact.digest
                )));
            }

            let accessories = store.accessories_of(artifact.id).await?;
            for accessory in &accessories {
                for tag in store.tags_of(accessory.artifact_id).await? {
                    self.inner
                        .gates
                        .check_immutable(project, repository, &tag.name)
                        .await?;
                }
            }
            for accessory in accessories {
                match store.get_artifact(accessory.artifact_id).await {
                    Ok(row) => {
                        self.delete_artifact(project, repository, row, operator, true)
                            .await?
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }

            let children = store.references_of(artifact.id).await?;
            store.remove_references(artifact.id).await?;
            store.delete_artifact(artifact.id).await?;
            match self
                .inner
                .backend
                .delete_manifest(repository.as_str(), &artifact.digest)
                .await
            {
                Ok(()) => {}
                Err(err) if err.kind() == StorageErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            if !self.in_project(project, &artifact.digest, true).await? {
                self.inner.gates.uncharge(project, &artifact.digest).await?;
            }

            for child in children {
                if !store.parents_of(child.child_id).await?.is_empty()
                    || !store.tags_of(child.child_id).await?.is_empty()
                {
                    continue;
                }
                match store.get_artifact(child.child_id).await {
                    Ok(row) => {
                        self.delete_artifact(project, repository, row, operator, true)
                            .await?
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }

            tracing::info!(repository = %repository, digest = %artifact.digest, "Artifact deleted");
            self.publish(
                EventKind::ArtifactDeleted,
                operator,
                EventPayload::Artifact {
                    project: project.name.clone(),
                    repository: repository.to_string(),
                    digest: artifact.digest.clone(),
                    tags: tags.into_iter().map(|tag| tag.name).collect(),
                    media_type: artifact.manifest_media_type.clone(),
                },
            )
            .await;
            Ok(())
        })
    }

    /// Whether another repository of `project` still holds `digest`, as a
    /// manifest or as a linked blob.
    async fn in_project(&self, project: &Project, digest: &Digest, manifest: bool) -> Result<bool> {
        for repo in self.inner.store.list_repositories(Some(project.id)).await? {
            let present = if manifest {
                self.inner.store.find_artifact(repo.id, digest).await?.is_some()
            } else {
                self.inner.backend.stat_blob(&repo.name, digest).await.is_ok()
            };
            if present {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Unlink a blob from `repository`. Its bytes go back to the quota once
    /// no repository of the project links them.
    pub async fn delete_blob(&self, project: &Project, repository: &RepositoryName, digest: &Digest) -> Result<()> {
        self.inner
            .backend
            .delete_blob(repository.as_str(), digest)
            .await?;
        if !self.in_project(project, digest, false).await? {
            self.inner.gates.uncharge(project, digest).await?;
        }
        tracing::debug!(%repository, %digest, "Blob unlinked");
        Ok(())
    }

    async fn collect_blobs(&self, project: &Project, repository: &RepositoryName) -> Result<()> {
        let pruned = self.inner.backend.prune_blobs(repository.as_str()).await?;
        for (digest, size) in pruned {
            tracing::debug!(%digest, size, "Unlinked unreferenced blob");
            if !self.in_project(project, &digest, false).await? {
                self.inner.gates.uncharge(project, &digest).await?;
            }
        }
        Ok(())
    }

    /// Point a new tag at an artifact. A tag already bound elsewhere is a
    /// conflict.
    pub async fn create_tag(
        &self,
        project: &Project,
        repository: &RepositoryName,
        reference: &Reference,
        tag: &str,
        operator: &Subject,
    ) -> Result<()> {
        validate_tag(tag)?;
        let artifact = self.resolve(repository, reference).await?;
        let store = &self.inner.store;
        if let Some(existing) = store.get_tag(artifact.repository_id, tag).await? {
            if existing.artifact_id == artifact.id {
                return Ok(());
            }
            return Err(Error::conflict(format!("tag {tag} already exists in {repository}")));
        }
        self.inner
            .backend
            .tag(repository.as_str(), tag, &artifact.digest)
            .await?;
        store.upsert_tag(artifact.repository_id, tag, artifact.id).await?;
        self.publish(
            EventKind::TagCreated,
            operator.name(),
            EventPayload::Tag {
                project: project.name.clone(),
                repository: repository.to_string(),
                tag: tag.to_owned(),
                digest: artifact.digest,
            },
        )
        .await;
        Ok(())
    }

    /// Remove a tag unless an immutable rule protects it.
    pub async fn delete_tag(
        &self,
        project: &Project,
        repository: &RepositoryName,
        tag: &str,
        operator: &Subject,
    ) -> Result<()> {
        let store = &self.inner.store;
        let repo = store.get_repository(repository.as_str()).await?;
        let existing = store
            .get_tag(repo.id, tag)
            .await?
            .ok_or_else(|| Error::not_found(format!("tag {tag} not found in {repository}")))?;
        self.inner.gates.check_immutable(project, repository, tag).await?;
        let artifact = store.get_artifact(existing.artifact_id).await?;
        match self.inner.backend.untag(repository.as_str(), tag).await {
            Ok(()) => {}
            Err(err) if err.kind() == StorageErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        store.delete_tag(existing.id).await?;
        self.publish(
            EventKind::TagDeleted,
            operator.name(),
            EventPayload::Tag {
                project: project.name.clone(),
                repository: repository.to_string(),
                tag: tag.to_owned(),
                digest: artifact.digest,
            },
        )
        .await;
        Ok(())
    }

    /// Attach a label. Project labels only attach within their project.
    pub async fn add_label(&self, artifact: &Artifact, label_id: LabelId) -> Result<()> {
        let label = self.inner.store.get_label(label_id).await?;
        if label.scope == LabelScope::Project && label.project_id != Some(artifact.project_id) {
            return Err(Error::invalid(format!(
                "label {} belongs to another project",
                label.name
            )));
        }
        self.inner.store.add_artifact_label(artifact.id, label_id).await
    }

    /// Detach a label.
    pub async fn remove_label(&self, artifact: &Artifact, label_id: LabelId) -> Result<()> {
        self.inner
            .store
            .remove_artifact_label(artifact.id, label_id)
            .await
    }

    /// An artifact with its tags, labels, accessories, children and scan
    /// summary.
    pub async fn view(&self, artifact: Artifact) -> Result<ArtifactView> {
        let store = &self.inner.store;
        let scan_overview = store
            .latest_scan_report(&artifact.digest)
            .await?
            .map(|report| ScanOverview {
                severity: report.worst_severity(|_| false),
                total: report.vulnerabilities.len(),
                scanner: report.scanner,
                completed: report.completed,
            });
        Ok(ArtifactView {
            tags: store.tags_of(artifact.id).await?,
            labels: store.labels_of(artifact.id).await?,
            accessories: store.accessories_of(artifact.id).await?,
            references: store.references_of(artifact.id).await?,
            scan_overview,
            artifact,
        })
    }

    /// One page of a repository's artifacts matching `query`, newest first,
    /// with the total number of matches.
    pub async fn list(
        &self,
        repository: &RepositoryName,
        query: &ArtifactQuery,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ArtifactView>, usize)> {
        let repo = self.inner.store.get_repository(repository.as_str()).await?;
        let mut matched = Vec::new();
        for artifact in self.inner.store.list_artifacts(repo.id).await? {
            let view = self.view(artifact).await?;
            let tags: Vec<String> = view.tags.iter().map(|t| t.name.clone()).collect();
            let labels: Vec<String> = view.labels.iter().map(|l| l.name.clone()).collect();
            if query.matches(&view.artifact, &tags, &labels) {
                matched.push(view);
            }
        }
        let total = matched.len();
        let start = page.saturating_sub(1).saturating_mul(page_size);
        let items = matched.into_iter().skip(start).take(page_size).collect();
        Ok((items, total))
    }

    /// Store a scan report for `artifact` and announce its worst severity.
    pub async fn record_scan(
        &self,
        project: &Project,
        artifact: &Artifact,
        report: ScanReportRef,
        operator: &Subject,
    ) -> Result<()> {
        let severity = report.worst_severity(|_| false);
        self.inner.store.put_scan_report(report).await?;
        self.publish(
            EventKind::ScanCompleted,
            operator.name(),
            EventPayload::Scan {
                project: project.name.clone(),
                repository: artifact.repository_name.clone(),
                digest: artifact.digest.clone(),
                severity,
            },
        )
        .await;
        Ok(())
    }

    async fn publish(&self, kind: EventKind, operator: &str, payload: EventPayload) {
        self.inner
            .events
            .publish(Event::new(kind, operator, payload))
            .await;
    }
}

/// `sha256-<hex>.sig` names the cosign signature of `sha256:<hex>`.
fn cosign_subject(tag: &str) -> Option<Digest> {
    let (algorithm, hex) = tag.strip_suffix(".sig")?.split_once('-')?;
    format!("{algorithm}:{hex}").parse().ok()
}

fn config_labels(config: Option<&Value>) -> BTreeMap<String, String> {
    config
        .and_then(|config| config.pointer("/config/Labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn extra_attrs(artifact_type: ArtifactType, config: Option<&Value>) -> Value {
    let Some(config) = config else {
        return Value::Null;
    };
    match artifact_type {
        ArtifactType::Image => {
            let mut attrs = Map::new();
            for key in ["architecture", "os", "author", "created", "config"] {
                if let Some(value) = config.get(key).filter(|v| !v.is_null()) {
                    attrs.insert(key.to_owned(), value.clone());
                }
            }
            Value::Object(attrs)
        }
        _ => config.clone(),
    }
}

/// Records pulls announced on the bus.
#[derive(Debug, Clone)]
pub struct PullRecorder {
    store: Arc<dyn Store>,
}

impl PullRecorder {
    /// A recorder updating `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        PullRecorder { store }
    }
}

#[async_trait]
impl Subscriber for PullRecorder {
    async fn deliver(&self, event: &Event) -> Result<()> {
        let EventPayload::Artifact {
            repository,
            digest,
            tags,
            ..
        } = &event.payload
        else {
            return Ok(());
        };
        let repo = self.store.get_repository(repository).await?;
        if let Some(artifact) = self.store.find_artifact(repo.id, digest).await? {
            self.store.record_pull(artifact.id, event.occurred_at).await?;
        }
        for tag in tags {
            if let Some(tag) = self.store.get_tag(repo.id, tag).await? {
                self.store.record_tag_pull(tag.id, event.occurred_at).await?;
            }
        }
        Ok(())
    }
}

/// Pull counters are advisory; the bus may drop them.
pub(crate) fn pull_event(project: &Project, artifact: &Artifact, tag: Option<&str>, operator: &Subject) -> Event {
    Event::new(
        EventKind::ArtifactPulled,
        operator.name(),
        EventPayload::Artifact {
            project: project.name.clone(),
            repository: artifact.repository_name.clone(),
            digest: artifact.digest.clone(),
            tags: tag.into_iter().map(str::to_owned).collect(),
            media_type: artifact.manifest_media_type.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob_store::{BlobStore, MemoryDriver};
    use harbor_core::config::FeatureFlags;
    use harbor_core::media;
    use harbor_core::model::{NewProject, ProjectMetadata};
    use harbor_core::store::{ArtifactStore, MemoryStore, ProjectStore, QuotaStore};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<BlobStore>,
        controller: ArtifactController,
        project: Project,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(BlobStore::new(Arc::new(MemoryDriver::new())));
        let project = store
            .create_project(NewProject {
                name: "lib".into(),
                owner: "admin".into(),
                metadata: ProjectMetadata::default(),
                storage_limit: None,
            })
            .await
            .unwrap();
        let events = EventBus::new();
        let gates = PolicyGates::new(store.clone(), backend.clone(), events.clone(), FeatureFlags::default());
        let controller = ArtifactController::new(
            store.clone(),
            backend.clone(),
            events,
            gates,
            ArtifactConfig::default(),
            4 * 1024 * 1024,
        );
        Fixture {
            store,
            backend,
            controller,
            project,
        }
    }

    fn admin() -> Subject {
        Subject::User(harbor_core::identity::Principal {
            username: "admin".into(),
            sysadmin: true,
        })
    }

    async fn put_blob(backend: &BlobStore, repo: &str, bytes: &[u8]) -> Value {
        let digest = Digest::sha256(bytes);
        backend
            .put_blob(repo, &digest, &mut std::io::Cursor::new(bytes.to_vec()))
            .await
            .unwrap();
        json!({"mediaType": "application/octet-stream", "digest": digest, "size": bytes.len()})
    }

    async fn image(f: &Fixture, repo: &str, layer: &[u8], labels: Value) -> Bytes {
        let config_bytes = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Labels": labels},
        }))
        .unwrap();
        let mut config = put_blob(&f.backend, repo, &config_bytes).await;
        config["mediaType"] = json!(media::OCI_CONFIG);
        let layer = put_blob(&f.backend, repo, layer).await;
        Bytes::from(
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "mediaType": media::OCI_MANIFEST,
                "config": config,
                "layers": [layer],
            }))
            .unwrap(),
        )
    }

    async fn push(f: &Fixture, repo: &str, reference: &str, bytes: Bytes) -> Result<PushOutcome> {
        f.controller
            .push_manifest(
                ManifestPush {
                    project: f.project.clone(),
                    repository: RepositoryName::new(repo).unwrap(),
                    reference: reference.parse().unwrap(),
                    content_type: None,
                    bytes,
                },
                &admin(),
            )
            .await
    }

    #[tokio::test]
    async fn push_records_artifact_and_tag() {
        let f = fixture().await;
        let bytes = image(&f, "lib/web", b"layer", json!({"maintainer": "ops"})).await;
        let outcome = push(&f, "lib/web", "v1", bytes.clone()).await.unwrap();

        assert_eq!(outcome.digest, Digest::sha256(&bytes));
        assert_eq!(outcome.artifact.artifact_type, ArtifactType::Image);
        assert_eq!(outcome.artifact.extra_attrs["architecture"], "amd64");
        assert_eq!(
            outcome.artifact.icon.as_deref(),
            Some(f.controller.icons().builtin_for(ArtifactType::Image).to_string().as_str())
        );

        let repository = RepositoryName::new("lib/web").unwrap();
        let resolved = f
            .controller
            .resolve(&repository, &Reference::Tag("v1".into()))
            .await
            .unwrap();
        assert_eq!(resolved.id, outcome.artifact.id);
    }

    #[tokio::test]
    async fn digest_references_must_match() {
        let f = fixture().await;
        let bytes = image(&f, "lib/web", b"layer", json!({})).await;
        let wrong = Digest::sha256(b"something else").to_string();
        let err = push(&f, "lib/web", &wrong, bytes).await.unwrap_err();
        assert_eq!(err.code(), Some("DIGEST_INVALID"));
    }

    #[tokio::test]
    async fn cosign_tag_attaches_signature() {
        let f = fixture().await;
        let subject = push(&f, "lib/web", "v1", image(&f, "lib/web", b"app", json!({})).await)
            .await
            .unwrap();

        let payload = put_blob(&f.backend, "lib/web", b"{}").await;
        let mut layer = payload.clone();
        layer["mediaType"] = json!("application/vnd.dev.cosign.simplesigning.v1+json");
        let mut config = put_blob(&f.backend, "lib/web", b"{\"sig\":1}").await;
        config["mediaType"] = json!(media::OCI_CONFIG);
        let signature = Bytes::from(
            serde_json::to_vec(&json!({
                "schemaVersion": 2,
                "mediaType": media::OCI_MANIFEST,
                "config": config,
                "layers": [layer],
            }))
            .unwrap(),
        );
        let tag = format!("sha256-{}.sig", subject.digest.hex());
        let signed = push(&f, "lib/web", &tag, signature).await.unwrap();

        let accessories = f.store.accessories_of(subject.artifact.id).await.unwrap();
        assert_eq!(accessories.len(), 1);
        assert_eq!(accessories[0].artifact_id, signed.artifact.id);
        assert_eq!(accessories[0].kind, AccessoryKind::CosignSignature);
    }

    #[tokio::test]
    async fn delete_cascades_and_releases_quota() {
        let f = fixture().await;
        let bytes = image(&f, "lib/web", b"only-layer", json!({})).await;
        let outcome = push(&f, "lib/web", "v1", bytes).await.unwrap();
        assert!(f.store.get_quota(f.project.id).await.unwrap().used > 0);

        let repository = RepositoryName::new("lib/web").unwrap();
        f.controller
            .delete(&f.project, &repository, &Reference::Digest(outcome.digest.clone()), &admin())
            .await
            .unwrap();

        assert!(f.store.get_artifact(outcome.artifact.id).await.is_err());
        assert!(f
            .backend
            .stat_blob("lib/web", &Digest::sha256(b"only-layer"))
            .await
            .is_err());
        assert_eq!(f.store.get_quota(f.project.id).await.unwrap().used, 0);
    }

    #[test]
    fn cosign_tags_name_their_subject() {
        let digest = Digest::sha256(b"x");
        let tag = format!("sha256-{}.sig", digest.hex());
        assert_eq!(cosign_subject(&tag), Some(digest));
        assert_eq!(cosign_subject("latest"), None);
    }
}
