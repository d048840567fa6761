//! Turning source resources into tasks.

use futures::{StreamExt as _, TryStreamExt as _};
use harbor_core::model::{Operation, ResourceType};
use harbor_core::{Digest, Result};

use crate::adapter::{Adapter, Resource};
use crate::filter::destination_repository;

/// One copy or delete to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    /// Kind of artifact.
    pub resource_type: ResourceType,
    /// Source repository.
    pub src_repo: String,
    /// Tag or digest at the source.
    pub src_reference: String,
    /// Destination repository.
    pub dst_repo: String,
    /// Tag or digest at the destination.
    pub dst_reference: String,
    /// Copy or delete.
    pub operation: Operation,
    /// Source digest when known at plan time.
    pub digest: Option<Digest>,
    /// Delete only the tag, not the manifest.
    pub delete_tag: bool,
}

impl PlannedTask {
    /// `repo:reference` at the source.
    pub fn src_resource(&self) -> String {
        resource_name(&self.src_repo, &self.src_reference)
    }

    /// `repo:reference` at the destination.
    pub fn dst_resource(&self) -> String {
        resource_name(&self.dst_repo, &self.dst_reference)
    }
}

fn resource_name(repo: &str, reference: &str) -> String {
    if reference.contains(':') {
        format!("{repo}@{reference}")
    } else {
        format!("{repo}:{reference}")
    }
}

/// How the plan maps and compares resources.
#[derive(Debug, Clone)]
pub struct PlanOptions<'a> {
    /// Destination namespace.
    pub dst_namespace: Option<&'a str>,
    /// Leading components replaced by the namespace.
    pub replace_count: i8,
    /// Replace destination artifacts with a different digest.
    pub override_existing: bool,
    /// Destination lookups in flight.
    pub concurrency: usize,
}

/// Plan one task per reference of each resource, skipping references the
/// destination already has.
///
/// A reference is skipped when the destination holds the same digest, or a
/// different digest and overriding is off. Deleted resources become delete
/// tasks without a lookup.
pub async fn plan(
    resources: &[Resource],
    dst: &dyn Adapter,
    options: &PlanOptions<'_>,
) -> Result<Vec<PlannedTask>> {
    let mut candidates = Vec::new();
    for resource in resources {
        let dst_repo = destination_repository(
            &resource.repository,
            options.dst_namespace,
            options.replace_count,
        )?;
        let operation = if resource.deleted {
            Operation::Delete
        } else {
            Operation::Copy
        };
        for reference in resource.references() {
            candidates.push(PlannedTask {
                resource_type: resource.resource_type,
                src_repo: resource.repository.clone(),
                src_reference: reference.clone(),
                dst_repo: dst_repo.clone(),
                dst_reference: reference,
                operation,
                digest: resource.digest.clone(),
                delete_tag: resource.deleted && resource.delete_tag,
            });
        }
    }

    let decisions = futures::stream::iter(candidates)
        .map(|task| async move {
            if task.operation == Operation::Delete {
                return Ok(Some(task));
            }
            let existing = dst.manifest_exists(&task.dst_repo, &task.dst_reference).await?;
            let keep = match (&existing, &task.digest) {
                (None, _) => true,
                (Some(head), Some(digest)) if &head.digest == digest => false,
                // The source digest is resolved at transfer time.
                (Some(_), None) => true,
                (Some(_), Some(_)) => options.override_existing,
            };
            if !keep {
                tracing::debug!(resource = %task.dst_resource(), "Destination is up to date");
            }
            Ok::<_, harbor_core::Error>(keep.then_some(task))
        })
        .buffered(options.concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    Ok(decisions.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;

    fn options(override_existing: bool) -> PlanOptions<'static> {
        PlanOptions {
            dst_namespace: Some("mirror"),
            replace_count: -1,
            override_existing,
            concurrency: 4,
        }
    }

    #[tokio::test]
    async fn skips_what_destination_has() {
        let src = MemoryAdapter::new("src");
        let same = src.put_image("team/app", "v1", &[b"one"]);
        let changed = src.put_image("team/app", "v2", &[b"two"]);

        let dst = MemoryAdapter::new("dst");
        assert_eq!(dst.put_image("mirror/app", "v1", &[b"one"]), same);
        dst.put_image("mirror/app", "v2", &[b"older"]);

        let mut v1 = Resource::image("team/app", ["v1"]);
        v1.digest = Some(same);
        let mut v2 = Resource::image("team/app", ["v2", "v3"]);
        v2.digest = Some(changed);
        let resources = [v1, v2];

        let planned = plan(&resources, &dst, &options(false)).await.unwrap();
        let refs: Vec<_> = planned.iter().map(PlannedTask::dst_resource).collect();
        assert_eq!(refs, vec!["mirror/app:v3"]);

        let planned = plan(&resources, &dst, &options(true)).await.unwrap();
        let refs: Vec<_> = planned.iter().map(PlannedTask::dst_resource).collect();
        assert_eq!(refs, vec!["mirror/app:v2", "mirror/app:v3"]);
    }

    #[tokio::test]
    async fn deletions_plan_without_lookup() {
        let dst = MemoryAdapter::new("dst");
        let mut gone = Resource::image("team/app", ["v1"]);
        gone.deleted = true;
        gone.delete_tag = true;
        let planned = plan(&[gone], &dst, &options(false)).await.unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].operation, Operation::Delete);
        assert!(planned[0].delete_tag);
    }

    #[test]
    fn digest_references_use_at_sign() {
        let digest = Digest::sha256(b"x");
        assert_eq!(resource_name("a/b", &digest.to_string()), format!("a/b@{digest}"));
        assert_eq!(resource_name("a/b", "v1"), "a/b:v1");
    }
}
