//! Copying one artifact between registries.
//!
//! Content is copied bottom up: blobs and index children land before the
//! manifest that references them, and the manifest is pushed last, so a
//! destination never holds a manifest with dangling references.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt as _;
use harbor_core::manifest::{Descriptor, ParsedManifest};
use harbor_core::model::Operation;
use harbor_core::{Digest, Error, Result};
use registry_client::PulledManifest;
use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::plan::PlannedTask;
use crate::throttle::throttle;

/// Destination repositories known to hold a blob, filled as an execution
/// pushes blobs so later tasks can mount instead of upload.
pub type MountCache = DashMap<Digest, String>;

/// What a transfer did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The manifest was pushed.
    Copied(Digest),
    /// The destination already had the content, or overriding is off.
    Skipped,
    /// The destination manifest or tag was deleted.
    Deleted,
    /// Nothing to delete.
    Absent,
}

/// Settings and shared state of the transfers of one execution.
#[derive(Debug)]
pub struct Transfer<'a> {
    /// Source registry.
    pub src: &'a dyn Adapter,
    /// Destination registry.
    pub dst: &'a dyn Adapter,
    /// Cancelled when the execution is stopped.
    pub cancel: &'a CancellationToken,
    /// Transfer rate limit in KiB/s.
    pub speed_limit_kb: Option<u32>,
    /// Upload blobs in chunks of this size.
    pub chunk_size: Option<usize>,
    /// Replace destination manifests with a different digest.
    pub override_existing: bool,
    /// Source and destination are the same registry.
    pub same_registry: bool,
    /// Blob locations at the destination.
    pub mounts: &'a MountCache,
}

impl Transfer<'_> {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Perform `task`.
    #[tracing::instrument(skip_all, fields(src = %task.src_resource(), dst = %task.dst_resource()))]
    pub async fn run(&self, task: &PlannedTask) -> Result<Outcome> {
        self.check_cancelled()?;
        match task.operation {
            Operation::Copy => self.copy(task).await,
            Operation::Delete => self.delete(task).await,
        }
    }

    async fn copy(&self, task: &PlannedTask) -> Result<Outcome> {
        let manifest = self
            .src
            .pull_manifest(&task.src_repo, &task.src_reference)
            .await?;
        if let Some(expected) = &task.digest {
            if task.src_reference.parse::<Digest>().is_err() && &manifest.digest != expected {
                tracing::info!(planned = %expected, found = %manifest.digest, "Source tag moved since planning");
            }
        }

        if let Some(existing) = self
            .dst
            .manifest_exists(&task.dst_repo, &task.dst_reference)
            .await?
        {
            if existing.digest == manifest.digest {
                tracing::debug!("Destination already has the manifest");
                return Ok(Outcome::Skipped);
            }
            if !self.override_existing {
                tracing::debug!(existing = %existing.digest, "Destination differs and override is off");
                return Ok(Outcome::Skipped);
            }
        }

        self.copy_content(&task.src_repo, &task.dst_repo, &manifest)
            .await?;
        self.check_cancelled()?;
        let digest = self
            .dst
            .push_manifest(
                &task.dst_repo,
                &task.dst_reference,
                &manifest.media_type,
                manifest.bytes.clone(),
            )
            .await?;
        tracing::info!(%digest, "Copied artifact");
        Ok(Outcome::Copied(digest))
    }

    /// Copy everything `manifest` references: index children (recursively,
    /// each pushed by digest) or config and layers.
    fn copy_content<'s>(
        &'s self,
        src_repo: &'s str,
        dst_repo: &'s str,
        manifest: &'s PulledManifest,
    ) -> BoxFuture<'s, Result<()>> {
        async move {
            let parsed = ParsedManifest::parse(&manifest.bytes, Some(&manifest.media_type))?;

            for child in &parsed.manifests {
                self.check_cancelled()?;
                let reference = child.digest.to_string();
                if self.dst.manifest_exists(dst_repo, &reference).await?.is_some() {
                    continue;
                }
                let pulled = self.src.pull_manifest(src_repo, &reference).await?;
                self.copy_content(src_repo, dst_repo, &pulled).await?;
                self.dst
                    .push_manifest(dst_repo, &reference, &pulled.media_type, pulled.bytes.clone())
                    .await?;
            }

            for blob in parsed.blobs() {
                self.copy_blob(src_repo, dst_repo, blob).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn copy_blob(&self, src_repo: &str, dst_repo: &str, blob: &Descriptor) -> Result<()> {
        self.check_cancelled()?;
        let digest = &blob.digest;
        if self.dst.blob_exists(dst_repo, digest).await?.is_some() {
            return Ok(());
        }

        let mount_from = self
            .mounts
            .get(digest)
            .map(|entry| entry.value().clone())
            .filter(|repo| repo != dst_repo)
            .or_else(|| (self.same_registry && src_repo != dst_repo).then(|| src_repo.to_owned()));
        if let Some(from) = mount_from {
            match self.dst.mount_blob(dst_repo, digest, &from).await {
                Ok(true) => {
                    tracing::debug!(%digest, %from, "Mounted blob");
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) if err.is_retryable() || err.is_cancelled() => return Err(err),
                Err(err) => tracing::debug!(%digest, error = %err, "Mount failed, uploading"),
            }
        }

        let pulled = self.src.pull_blob(src_repo, digest).await?;
        let body = throttle(pulled.body, self.speed_limit_kb, self.cancel.clone());
        let size = pulled.size.or(Some(blob.size));
        self.dst
            .push_blob(dst_repo, digest, size, body, self.chunk_size)
            .await?;
        self.mounts.insert(digest.clone(), dst_repo.to_owned());
        tracing::debug!(%digest, size = blob.size, "Copied blob");
        Ok(())
    }

    async fn delete(&self, task: &PlannedTask) -> Result<Outcome> {
        let removed = if task.delete_tag {
            self.dst.delete_tag(&task.dst_repo, &task.dst_reference).await?
        } else {
            self.dst
                .delete_manifest(&task.dst_repo, &task.dst_reference)
                .await?
        };
        if removed {
            tracing::info!("Deleted at destination");
            Ok(Outcome::Deleted)
        } else {
            Ok(Outcome::Absent)
        }
    }
}
