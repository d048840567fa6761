//! Cached project policy.
//!
//! Immutable rules and the system CVE allow-list are read on every push and
//! pull but change rarely, so they are kept in memory until a handler
//! invalidates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use harbor_core::model::{CveAllowlist, ImmutableRule, ProjectId};
use harbor_core::store::Store;
use harbor_core::Result;

type Rules = Arc<Vec<ImmutableRule>>;

/// Read-mostly snapshot of project policy.
///
/// Entries are loaded on first use and dropped by [`PolicyCache::invalidate`]
/// whenever a handler changes the policy behind them. A load that races an
/// invalidation is returned to its caller but not kept. After
/// [`PolicyCache::close`] every read goes to the store.
#[derive(Debug, Clone)]
pub struct PolicyCache {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn Store>,
    immutable_rules: DashMap<ProjectId, Slot>,
    system_allowlist: ArcSwap<Option<Arc<CveAllowlist>>>,
    closed: AtomicBool,
}

/// Cached rules of one project. `generation` counts invalidations.
#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    rules: Option<Rules>,
}

impl PolicyCache {
    /// An empty cache over `store`.
    pub fn init(store: Arc<dyn Store>) -> Self {
        PolicyCache {
            inner: Arc::new(Inner {
                store,
                immutable_rules: DashMap::new(),
                system_allowlist: ArcSwap::from_pointee(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Immutable rules of a project.
    pub async fn immutable_rules(&self, project_id: ProjectId) -> Result<Rules> {
        let generation = match self.cached_rules(project_id) {
            Ok(rules) => return Ok(rules),
            Err(generation) => generation,
        };
        let rules = Arc::new(self.inner.store.list_immutable_rules(project_id).await?);
        self.fill_rules(project_id, generation, rules.clone());
        Ok(rules)
    }

    /// The cached rules, or the generation a load has to match to fill them.
    fn cached_rules(&self, project_id: ProjectId) -> std::result::Result<Rules, u64> {
        match self.inner.immutable_rules.get(&project_id) {
            Some(slot) => slot.rules.clone().ok_or(slot.generation),
            None => Err(0),
        }
    }

    fn fill_rules(&self, project_id: ProjectId, generation: u64, rules: Rules) {
        if self.is_closed() {
            return;
        }
        let mut slot = self.inner.immutable_rules.entry(project_id).or_default();
        if slot.generation == generation {
            slot.rules = Some(rules);
        } else {
            tracing::debug!(project_id, "Immutable rules changed while loading");
        }
    }

    /// The system CVE allow-list.
    pub async fn system_allowlist(&self) -> Result<Arc<CveAllowlist>> {
        let current = self.inner.system_allowlist.load_full();
        if let Some(allowlist) = &*current {
            return Ok(allowlist.clone());
        }
        let allowlist = Arc::new(self.inner.store.system_allowlist().await?);
        self.fill_system(&current, allowlist.clone());
        Ok(allowlist)
    }

    /// Keep `allowlist` only if nothing replaced `seen` in the meantime.
    fn fill_system(&self, seen: &Arc<Option<Arc<CveAllowlist>>>, allowlist: Arc<CveAllowlist>) {
        if self.is_closed() {
            return;
        }
        self.inner
            .system_allowlist
            .compare_and_swap(seen, Arc::new(Some(allowlist)));
    }

    /// Forget the cached policy of a project.
    pub fn invalidate(&self, project_id: ProjectId) {
        let mut slot = self.inner.immutable_rules.entry(project_id).or_default();
        slot.generation += 1;
        slot.rules = None;
    }

    /// Forget the cached system allow-list.
    pub fn invalidate_system(&self) {
        self.inner.system_allowlist.store(Arc::new(None));
    }

    /// Drop every entry and stop caching.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.immutable_rules.clear();
        self.inner.system_allowlist.store(Arc::new(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::{NewProject, Project, Selector};
    use harbor_core::pattern::Pattern;
    use harbor_core::store::{MemoryStore, PolicyStore, ProjectStore};

    fn rule(project_id: ProjectId, pattern: &str) -> ImmutableRule {
        ImmutableRule {
            id: 0,
            project_id,
            disabled: false,
            tag_selector: Selector::matching(Pattern::new(pattern).unwrap()),
            repository_selector: Selector::default(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, PolicyCache, Project) {
        let store = Arc::new(MemoryStore::new());
        let project = store
            .create_project(NewProject {
                name: "lib".into(),
                owner: "admin".into(),
                ..NewProject::default()
            })
            .await
            .unwrap();
        let cache = PolicyCache::init(store.clone());
        (store, cache, project)
    }

    #[tokio::test]
    async fn invalidation_reloads_rules() {
        let (store, cache, project) = setup().await;
        assert!(cache.immutable_rules(project.id).await.unwrap().is_empty());

        store.create_immutable_rule(rule(project.id, "release-*")).await.unwrap();
        assert!(cache.immutable_rules(project.id).await.unwrap().is_empty());

        cache.invalidate(project.id);
        assert_eq!(cache.immutable_rules(project.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_cache_reads_through() {
        let (store, cache, project) = setup().await;
        cache.close();
        store.create_immutable_rule(rule(project.id, "v*")).await.unwrap();
        assert_eq!(cache.immutable_rules(project.id).await.unwrap().len(), 1);
        store.create_immutable_rule(rule(project.id, "latest")).await.unwrap();
        assert_eq!(cache.immutable_rules(project.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn loads_racing_an_invalidation_are_not_kept() {
        let (store, cache, project) = setup().await;
        let generation = cache.cached_rules(project.id).unwrap_err();
        let stale = Arc::new(store.list_immutable_rules(project.id).await.unwrap());

        store.create_immutable_rule(rule(project.id, "release-*")).await.unwrap();
        cache.invalidate(project.id);
        cache.fill_rules(project.id, generation, stale);

        assert_eq!(cache.immutable_rules(project.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn system_allowlist_loads_racing_an_invalidation_are_not_kept() {
        let (store, cache, _) = setup().await;
        let seen = cache.inner.system_allowlist.load_full();
        let stale = Arc::new(store.system_allowlist().await.unwrap());

        store
            .set_system_allowlist(CveAllowlist {
                items: vec!["CVE-2024-0001".into()],
                expires_at: None,
            })
            .await
            .unwrap();
        cache.invalidate_system();
        cache.fill_system(&seen, stale);

        let allowlist = cache.system_allowlist().await.unwrap();
        assert_eq!(allowlist.items, ["CVE-2024-0001"]);
        assert_eq!(cache.system_allowlist().await.unwrap(), allowlist);
    }
}
