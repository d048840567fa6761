//! Event based replication.

use std::sync::Arc;

use async_trait::async_trait;
use harbor_core::event::{DeliveryMode, Event, EventBus, EventFilter, EventKind, EventPayload, Subscriber};
use harbor_core::media;
use harbor_core::model::{ReplicationPolicy, ReplicationTrigger, ResourceType, TriggerSource};
use harbor_core::Result;

use crate::adapter::Resource;
use crate::engine::ReplicationEngine;
use crate::filter::Filters;

/// Name the trigger subscribes under.
pub const SUBSCRIBER: &str = "replication";

/// Starts push based replications from registry events.
///
/// Pushes and tag changes in the local registry start every enabled,
/// event triggered policy whose source is local and whose filters accept
/// the artifact. Deletions are forwarded only to policies that replicate
/// deletion.
#[derive(Debug, Clone)]
pub struct EventTrigger {
    engine: ReplicationEngine,
}

impl EventTrigger {
    /// A trigger starting executions on `engine`.
    pub fn new(engine: ReplicationEngine) -> Self {
        EventTrigger { engine }
    }

    /// Register the trigger as a durable subscriber of `bus`.
    pub fn subscribe(self, bus: &EventBus) {
        bus.subscribe(
            SUBSCRIBER,
            EventFilter::kinds([
                EventKind::ArtifactPushed,
                EventKind::TagCreated,
                EventKind::ArtifactDeleted,
                EventKind::TagDeleted,
            ]),
            DeliveryMode::Durable,
            Arc::new(self),
        );
    }
}

fn resource_type(media_type: &str) -> ResourceType {
    match media_type {
        media::OCI_MANIFEST | media::OCI_INDEX | media::DOCKER_MANIFEST | media::DOCKER_MANIFEST_LIST => {
            ResourceType::Image
        }
        _ => ResourceType::Artifact,
    }
}

/// The resource an event describes, if it describes one.
pub fn resource_of(event: &Event) -> Option<Resource> {
    match (&event.kind, &event.payload) {
        (
            EventKind::ArtifactPushed | EventKind::ArtifactDeleted,
            EventPayload::Artifact {
                repository,
                digest,
                tags,
                media_type,
                ..
            },
        ) => Some(Resource {
            resource_type: resource_type(media_type),
            repository: repository.clone(),
            digest: Some(digest.clone()),
            tags: tags.clone(),
            labels: Vec::new(),
            deleted: event.kind == EventKind::ArtifactDeleted,
            delete_tag: false,
        }),
        (
            EventKind::TagCreated | EventKind::TagDeleted,
            EventPayload::Tag {
                repository,
                tag,
                digest,
                ..
            },
        ) => {
            let deleted = event.kind == EventKind::TagDeleted;
            Some(Resource {
                resource_type: ResourceType::Image,
                repository: repository.clone(),
                digest: Some(digest.clone()),
                tags: vec![tag.clone()],
                labels: Vec::new(),
                deleted,
                delete_tag: deleted,
            })
        }
        _ => None,
    }
}

fn listens(policy: &ReplicationPolicy, resource: &Resource) -> bool {
    policy.enabled
        && policy.trigger == ReplicationTrigger::EventBased
        && policy.src_registry.is_none()
        && (!resource.deleted || policy.replicate_deletion)
}

#[async_trait]
impl Subscriber for EventTrigger {
    async fn deliver(&self, event: &Event) -> Result<()> {
        let Some(resource) = resource_of(event) else {
            return Ok(());
        };

        let mut retry = None;
        for policy in self.engine.store().list_replication_policies().await? {
            if !listens(&policy, &resource) {
                continue;
            }
            let selected = match Filters::new(&policy.filters) {
                Ok(filters) => filters.apply_one(resource.clone()),
                Err(err) => {
                    tracing::warn!(policy = policy.id, error = %err, "Skipping policy with bad filters");
                    continue;
                }
            };
            let Some(selected) = selected else {
                continue;
            };
            match self
                .engine
                .start_with_resources(policy.id, TriggerSource::Event, Some(vec![selected]))
                .await
            {
                Ok(execution) => {
                    tracing::info!(policy = policy.id, execution, kind = %event.kind, "Started event replication")
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(policy = policy.id, error = %err, "Event replication will be retried");
                    retry = Some(err);
                }
                Err(err) => {
                    tracing::warn!(policy = policy.id, error = %err, "Event replication did not start")
                }
            }
        }
        retry.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::Digest;

    fn tag_deleted() -> Event {
        Event::new(
            EventKind::TagDeleted,
            "admin",
            EventPayload::Tag {
                project: "team".into(),
                repository: "team/app".into(),
                tag: "v1".into(),
                digest: Digest::sha256(b"m"),
            },
        )
    }

    #[test]
    fn tag_deletion_deletes_only_the_tag() {
        let resource = resource_of(&tag_deleted()).unwrap();
        assert!(resource.deleted);
        assert!(resource.delete_tag);
        assert_eq!(resource.tags, vec!["v1"]);
    }

    #[test]
    fn pushes_become_images() {
        let event = Event::new(
            EventKind::ArtifactPushed,
            "admin",
            EventPayload::Artifact {
                project: "team".into(),
                repository: "team/app".into(),
                digest: Digest::sha256(b"m"),
                tags: vec!["latest".into()],
                media_type: media::OCI_MANIFEST.into(),
            },
        );
        let resource = resource_of(&event).unwrap();
        assert_eq!(resource.resource_type, ResourceType::Image);
        assert!(!resource.deleted);
    }
}
