//! Policy gates.
//!
//! Checks that run on the write and read paths: tag immutability and quota
//! on pushes, signature and vulnerability gates on pulls. Each check can be
//! switched off through [`FeatureFlags`].

use std::sync::Arc;
use std::time::Duration;

use blob_store::BlobBackend;
use chrono::Utc;
use harbor_core::config::FeatureFlags;
use harbor_core::event::{Event, EventBus, EventKind, EventPayload};
use harbor_core::identity::Subject;
use harbor_core::model::{Artifact, ImmutableRule, Project, ReservationId};
use harbor_core::store::Store;
use harbor_core::{Digest, Error, ErrorKind, RepositoryName, Result};

mod cache;
pub mod retention;
mod signature;
/// Vulnerability gate on pulls.
pub mod vulnerability;

pub use self::cache::PolicyCache;
pub use self::retention::RetentionSweeper;
pub use self::signature::TrustRoot;

/// Shortest lifetime of a quota reservation.
const MIN_RESERVATION: Duration = Duration::from_secs(60);

/// Immutability, quota, signature and vulnerability checks.
#[derive(Debug, Clone)]
pub struct PolicyGates {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn Store>,
    backend: Arc<dyn BlobBackend>,
    events: EventBus,
    cache: PolicyCache,
    features: FeatureFlags,
    trust: TrustRoot,
    throughput: u64,
}

impl PolicyGates {
    /// Gates over `store` and `backend`, reporting refusals on `events`.
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn BlobBackend>,
        events: EventBus,
        features: FeatureFlags,
    ) -> Self {
        let cache = PolicyCache::init(store.clone());
        PolicyGates {
            inner: Arc::new(Inner {
                store,
                backend,
                events,
                cache,
                features,
                trust: TrustRoot::new(),
                throughput: 10 * 1024 * 1024,
            }),
        }
    }

    /// Verify signatures against `trust`.
    pub fn with_trust_root(mut self, trust: TrustRoot) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.trust = trust;
        }
        self
    }

    /// Expected upload rate, in bytes per second.
    pub fn with_throughput(mut self, throughput: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.throughput = throughput.max(1);
        }
        self
    }

    /// Cached policy.
    pub fn cache(&self) -> &PolicyCache {
        &self.inner.cache
    }

    /// Whether an immutable rule of `project` protects `tag` in `repository`.
    pub async fn is_protected(
        &self,
        project: &Project,
        repository: &RepositoryName,
        tag: &str,
    ) -> Result<bool> {
        Ok(self.protecting_rule(project, repository, tag).await?.is_some())
    }

    async fn protecting_rule(
        &self,
        project: &Project,
        repository: &RepositoryName,
        tag: &str,
    ) -> Result<Option<ImmutableRule>> {
        if !self.inner.features.immutability {
            return Ok(None);
        }
        let rules = self.inner.cache.immutable_rules(project.id).await?;
        Ok(rules
            .iter()
            .find(|rule| rule.protects(repository.within_project(), tag))
            .cloned())
    }

    /// Refuse to move or delete an existing tag that an immutable rule
    /// protects.
    pub async fn check_immutable(
        &self,
        project: &Project,
        repository: &RepositoryName,
        tag: &str,
    ) -> Result<()> {
        if let Some(rule) = self.protecting_rule(project, repository, tag).await? {
            return Err(Error::immutable(format!(
                "tag {tag} in {repository} matched immutable rule '{}'",
                rule.tag_selector.pattern
            ))
            .with_code("TAG_IMMUTABLE"));
        }
        Ok(())
    }

    /// Reserve `size` bytes of `project`'s quota. Nothing is reserved when
    /// quotas are off or `size` is zero.
    pub async fn reserve(
        &self,
        project: &Project,
        size: u64,
        operator: &Subject,
    ) -> Result<Option<ReservationId>> {
        if !self.inner.features.quota || size == 0 {
            return Ok(None);
        }
        let ttl = MIN_RESERVATION.max(Duration::from_secs(
            size.saturating_mul(2) / self.inner.throughput,
        ));
        match self.inner.store.reserve(project.id, size, ttl).await {
            Ok(id) => Ok(Some(id)),
            Err(err) if err.kind() == ErrorKind::QuotaExceeded => {
                let quota = self.inner.store.get_quota(project.id).await?;
                tracing::info!(project = %project.name, size, used = quota.used, "Quota exceeded");
                self.inner
                    .events
                    .publish(Event::new(
                        EventKind::QuotaExceeded,
                        operator.name(),
                        EventPayload::Quota {
                            project: project.name.clone(),
                            requested: size,
                            used: quota.used,
                            hard: quota.hard,
                        },
                    ))
                    .await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Record `digest` against `project`, committing the reservation if the
    /// project did not hold the bytes yet and releasing it otherwise.
    ///
    /// A reservation that expired during the upload is charged directly,
    /// subject to the hard limit. If the bytes cannot be charged the blob is
    /// not recorded.
    pub async fn settle(
        &self,
        project: &Project,
        digest: &Digest,
        size: u64,
        reservation: Option<ReservationId>,
    ) -> Result<()> {
        let store = &self.inner.store;
        let fresh = store.add_project_blob(project.id, digest, size).await?;
        let Some(id) = reservation else {
            return Ok(());
        };
        if !fresh {
            return store.release_reservation(id).await;
        }

        let charged = match store.commit_reservation(id).await {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(project = %project.name, %digest, size, "Quota reservation expired, charging directly");
                store.charge_usage(project.id, size).await
            }
            other => other,
        };
        if let Err(err) = charged {
            store.remove_project_blob(project.id, digest).await?;
            return Err(err);
        }
        Ok(())
    }

    /// Drop a reservation that will not be used.
    pub async fn release(&self, reservation: Option<ReservationId>) {
        if let Some(id) = reservation {
            if let Err(err) = self.inner.store.release_reservation(id).await {
                tracing::warn!(error = %err, "Could not release quota reservation");
            }
        }
    }

    /// Forget `digest` in `project`, returning its bytes to the quota.
    pub async fn uncharge(&self, project: &Project, digest: &Digest) -> Result<()> {
        if let Some(size) = self
            .inner
            .store
            .remove_project_blob(project.id, digest)
            .await?
        {
            self.inner.store.release_usage(project.id, size).await?;
        }
        Ok(())
    }

    /// Signature then vulnerability gate for pulling `artifact`.
    ///
    /// The signature gate only applies to pulls by tag; accessories are never
    /// gated.
    pub async fn check_pull(
        &self,
        project: &Project,
        artifact: &Artifact,
        by_tag: bool,
    ) -> Result<()> {
        let features = &self.inner.features;
        let is_accessory = self.inner.store.accessory_for(artifact.id).await?.is_some();
        if is_accessory {
            return Ok(());
        }

        if features.signature_gate && by_tag && project.metadata.require_signature {
            let signed = signature::is_signed(
                &self.inner.store,
                &self.inner.backend,
                &self.inner.trust,
                artifact,
            )
            .await?;
            if !signed {
                return Err(Error::forbidden(format!(
                    "project {} requires signed artifacts; {} is not signed",
                    project.name, artifact.digest
                ))
                .with_code("DENIED"));
            }
        }

        if features.vulnerability_gate && project.metadata.prevent_vulnerable {
            let report = self
                .inner
                .store
                .latest_scan_report(&artifact.digest)
                .await?;
            let system = self.inner.cache.system_allowlist().await?;
            vulnerability::evaluate(project, report.as_ref(), &system, Utc::now())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob_store::{BlobStore, MemoryDriver};
    use harbor_core::event::{DeliveryMode, EventFilter, FnSubscriber};
    use harbor_core::identity::Principal;
    use harbor_core::model::{ImmutableRule, NewProject, Selector};
    use harbor_core::pattern::Pattern;
    use harbor_core::store::{MemoryStore, PolicyStore, ProjectStore, QuotaStore};
    use tokio::sync::mpsc;

    async fn setup(limit: Option<u64>) -> (Arc<MemoryStore>, PolicyGates, Project) {
        let store = Arc::new(MemoryStore::new());
        let project = store
            .create_project(NewProject {
                name: "lib".into(),
                owner: "admin".into(),
                storage_limit: limit,
                ..NewProject::default()
            })
            .await
            .unwrap();
        let backend = Arc::new(BlobStore::new(Arc::new(MemoryDriver::new())));
        let gates = PolicyGates::new(store.clone(), backend, EventBus::new(), FeatureFlags::default());
        (store, gates, project)
    }

    fn dev() -> Subject {
        Subject::User(Principal {
            username: "dev".into(),
            sysadmin: false,
        })
    }

    #[tokio::test]
    async fn immutable_tags_are_refused() {
        let (store, gates, project) = setup(None).await;
        store
            .create_immutable_rule(ImmutableRule {
                id: 0,
                project_id: project.id,
                disabled: false,
                tag_selector: Selector::matching(Pattern::new("release-*").unwrap()),
                repository_selector: Selector::default(),
            })
            .await
            .unwrap();
        let repo = RepositoryName::new("lib/web").unwrap();

        let err = gates
            .check_immutable(&project, &repo, "release-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Immutable);
        assert_eq!(err.code(), Some("TAG_IMMUTABLE"));
        assert!(err.message().contains("immutable rule 'release-*'"));
        assert!(gates.check_immutable(&project, &repo, "dev").await.is_ok());
    }

    #[tokio::test]
    async fn quota_refusal_is_published() {
        let (store, gates, project) = setup(Some(100)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        gates.inner.events.subscribe(
            "test",
            EventFilter::kinds([EventKind::QuotaExceeded]),
            DeliveryMode::BestEffort,
            Arc::new(FnSubscriber::new(move |event: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            })),
        );

        let reservation = gates.reserve(&project, 60, &dev()).await.unwrap();
        gates
            .settle(&project, &Digest::sha256(b"a"), 60, reservation)
            .await
            .unwrap();
        assert_eq!(store.get_quota(project.id).await.unwrap().used, 60);

        let err = gates.reserve(&project, 50, &dev()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Quota {
                project: "lib".into(),
                requested: 50,
                used: 60,
                hard: Some(100),
            }
        );

        gates.uncharge(&project, &Digest::sha256(b"a")).await.unwrap();
        assert_eq!(store.get_quota(project.id).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn shared_bytes_are_charged_once() {
        let (store, gates, project) = setup(Some(100)).await;
        let digest = Digest::sha256(b"layer");
        for _ in 0..2 {
            let reservation = gates.reserve(&project, 40, &dev()).await.unwrap();
            gates.settle(&project, &digest, 40, reservation).await.unwrap();
        }
        let quota = store.get_quota(project.id).await.unwrap();
        assert_eq!((quota.used, quota.reserved), (40, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_uploads_are_still_charged() {
        let (store, gates, project) = setup(Some(100)).await;
        let digest = Digest::sha256(b"slow");
        let reservation = gates.reserve(&project, 60, &dev()).await.unwrap();
        tokio::time::advance(MIN_RESERVATION + Duration::from_secs(1)).await;

        gates.settle(&project, &digest, 60, reservation).await.unwrap();
        assert_eq!(store.get_quota(project.id).await.unwrap().used, 60);

        let again = gates.reserve(&project, 30, &dev()).await.unwrap();
        gates.settle(&project, &digest, 60, again).await.unwrap();
        let quota = store.get_quota(project.id).await.unwrap();
        assert_eq!((quota.used, quota.reserved), (60, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_uploads_over_the_limit_are_not_recorded() {
        let (store, gates, project) = setup(Some(100)).await;
        let slow = Digest::sha256(b"slow");
        let reservation = gates.reserve(&project, 60, &dev()).await.unwrap();
        tokio::time::advance(MIN_RESERVATION + Duration::from_secs(1)).await;

        let other = gates.reserve(&project, 50, &dev()).await.unwrap();
        gates
            .settle(&project, &Digest::sha256(b"fast"), 50, other)
            .await
            .unwrap();

        let err = gates.settle(&project, &slow, 60, reservation).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(store.get_quota(project.id).await.unwrap().used, 50);
        assert_eq!(store.remove_project_blob(project.id, &slow).await.unwrap(), None);
    }
}
