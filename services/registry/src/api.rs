//! Service assembly and router.
//!
//! [`RegistryBuilder`] wires the store, blob backend, token service, policy
//! gates, artifact controller, replication engine and event bus together.
//! The resulting [`Registry`] hands out the axum router and owns the
//! background work (cron schedules, the retention sweep, hook retries).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use blob_store::BlobBackend;
use harbor_core::event::{DeliveryMode, EventBus, EventFilter, EventKind};
use harbor_core::identity::{IdentityProvider, StaticIdentityProvider};
use harbor_core::model::{RegistryCredential, RegistryEndpoint};
use harbor_core::store::{MemoryStore, Store};
use harbor_core::Result;
use harbor_replication::adapter::HarborAdapter;
use harbor_replication::{Adapter, AdapterRegistry, EventTrigger, ReplicationEngine, Scheduler};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::access::AccessResolver;
use crate::artifact::{ArtifactController, PullRecorder};
use crate::config::Config;
use crate::error::reference_internal_errors;
use crate::middleware::{deadline, sanitize_query};
use crate::policy::{PolicyGates, RetentionSweeper, TrustRoot};
use crate::token::TokenService;

/// How often due hook deliveries are retried.
const HOOK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Name of the subscriber counting pulls.
const PULL_RECORDER: &str = "pull-recorder";

/// Everything a request handler can reach.
pub struct Services {
    pub(crate) config: Config,
    pub(crate) tokens: TokenService,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) access: AccessResolver,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) backend: Arc<dyn BlobBackend>,
    pub(crate) events: EventBus,
    pub(crate) gates: PolicyGates,
    pub(crate) artifacts: ArtifactController,
    pub(crate) replication: ReplicationEngine,
    pub(crate) scheduler: Scheduler,
    pub(crate) retention: RetentionSweeper,
    cancel: CancellationToken,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("service", &self.config.token.service)
            .field("external_url", &self.config.registry.external_url)
            .field("subscribers", &self.events.subscribers())
            .finish_non_exhaustive()
    }
}

pub(crate) type AppState = Arc<Services>;

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    backend: Option<Arc<dyn BlobBackend>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    tokens: Option<TokenService>,
    adapters: Option<AdapterRegistry>,
    local: Option<Arc<dyn Adapter>>,
}

impl RegistryBuilder {
    /// Start from `config`. Anything not set explicitly is built from it.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            backend: None,
            identity: None,
            tokens: None,
            adapters: None,
            local: None,
        }
    }

    /// Persist metadata in `store`. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep content in `backend`. Defaults to `registry.backend`.
    pub fn backend(mut self, backend: Arc<dyn BlobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Authenticate against `identity`. Defaults to the configured users.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sign tokens with `tokens`. Defaults to the configured key.
    pub fn token_service(mut self, tokens: TokenService) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Adapter types available to registry endpoints.
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Adapter replication uses for this registry. Defaults to a Harbor
    /// adapter pointed at `registry.external_url`.
    pub fn local_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.local = Some(adapter);
        self
    }

    fn local_endpoint(config: &Config) -> RegistryEndpoint {
        let credential = config
            .registry
            .replication_user
            .as_ref()
            .map(|user| RegistryCredential {
                access_key: user.clone(),
                access_secret: config
                    .registry
                    .replication_password
                    .clone()
                    .unwrap_or_else(|| harbor_core::Secret::new("")),
            });
        RegistryEndpoint {
            id: 0,
            name: "local".into(),
            registry_type: "harbor".into(),
            url: config.registry.external_url.clone(),
            credential,
            insecure: false,
        }
    }

    /// Build the registry service.
    ///
    /// Must be called from within a tokio runtime, since event subscribers
    /// start their consumer tasks here.
    pub fn build(self) -> Result<Registry> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(config.registry.backend.store()) as Arc<dyn BlobBackend>);
        let identity = match self.identity {
            Some(identity) => identity,
            None => {
                let users = config.users.iter().fold(StaticIdentityProvider::new(), |users, user| {
                    users.user(&user.username, user.password.revealed(), user.sysadmin)
                });
                Arc::new(users) as Arc<dyn IdentityProvider>
            }
        };
        let tokens = match self.tokens {
            Some(tokens) => tokens,
            None => TokenService::load(config.token.clone())?,
        };

        let events = EventBus::with_store(store.clone(), config.replication.backoff.clone());
        let gates = PolicyGates::new(
            store.clone(),
            backend.clone(),
            events.clone(),
            config.features.clone(),
        )
        .with_trust_root(TrustRoot::load(&config.registry.trust_root)?)
        .with_throughput(config.registry.upload_throughput);
        let artifacts = ArtifactController::new(
            store.clone(),
            backend.clone(),
            events.clone(),
            gates.clone(),
            config.artifact.clone(),
            config.registry.max_manifest_size,
        );
        events.subscribe(
            PULL_RECORDER,
            EventFilter::kinds([EventKind::ArtifactPulled]),
            DeliveryMode::BestEffort,
            Arc::new(PullRecorder::new(store.clone())),
        );

        let local = match self.local {
            Some(local) => local,
            None => Arc::new(HarborAdapter::new(&Self::local_endpoint(&config))?) as Arc<dyn Adapter>,
        };
        let adapters = self
            .adapters
            .unwrap_or_else(|| AdapterRegistry::builtin(&config.replication.enabled_adapters));
        let replication = ReplicationEngine::builder(store.clone())
            .adapters(adapters)
            .events(events.clone())
            .config(config.replication.clone())
            .local(local)
            .build();
        EventTrigger::new(replication.clone()).subscribe(&events);
        let scheduler = Scheduler::new(replication.clone());

        let retention = RetentionSweeper::new(
            store.clone(),
            artifacts.clone(),
            gates.clone(),
            config.retention.delete_untagged,
        );

        tracing::debug!(
            service = %config.token.service,
            adapters = ?replication.adapter_types(),
            "Registry assembled"
        );

        Ok(Registry {
            state: Arc::new(Services {
                access: AccessResolver::new(store.clone()),
                config,
                tokens,
                identity,
                store,
                backend,
                events,
                gates,
                artifacts,
                replication,
                scheduler,
                retention,
                cancel: CancellationToken::new(),
            }),
        })
    }
}

/// A running registry service.
#[derive(Debug, Clone)]
pub struct Registry {
    state: AppState,
}

impl Registry {
    /// Start configuring a registry.
    pub fn builder(config: Config) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    /// The configuration the registry was built with.
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// The metadata store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.state.store
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.state.events
    }

    /// The artifact controller.
    pub fn artifacts(&self) -> &ArtifactController {
        &self.state.artifacts
    }

    /// The replication engine.
    pub fn replication(&self) -> &ReplicationEngine {
        &self.state.replication
    }

    /// The token service.
    pub fn tokens(&self) -> &TokenService {
        &self.state.tokens
    }

    /// The token endpoint, the `/v2` registry and the `/api/v2.0`
    /// management routes.
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static("docker-distribution-api-version"),
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(from_fn(reference_internal_errors))
            .layer(from_fn_with_state(state.clone(), deadline))
            .layer(from_fn(sanitize_query));

        Router::new()
            .merge(crate::token::handler::router(&state.config.token.path))
            .merge(crate::proxy::router(state.clone()))
            .nest("/api/v2.0", crate::management::router())
            .layer(middleware)
            .with_state(state)
    }

    /// Start background work: cron triggered replication policies, the
    /// retention sweep and hook retries.
    pub async fn start(&self) -> Result<()> {
        let state = &self.state;
        state.scheduler.sync().await?;
        state
            .retention
            .clone()
            .spawn(&state.config.retention.sweep_cron, state.cancel.child_token())?;
        state
            .events
            .spawn_retry_worker(HOOK_RETRY_INTERVAL, state.cancel.child_token());
        tracing::info!(
            scheduled = state.scheduler.scheduled().len(),
            "Background work started"
        );
        Ok(())
    }

    /// Stop background work and running replication executions.
    pub async fn shutdown(&self) {
        let state = &self.state;
        state.cancel.cancel();
        state.scheduler.shutdown();
        state.replication.stop_all().await;
        state.events.shutdown();
        state.gates.cache().close();
        tracing::info!("Registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::config::TokenConfig;

    #[tokio::test]
    async fn test_builder() {
        let tokens =
            TokenService::from_pem(TokenConfig::default(), crate::token::tests::KEY).unwrap();
        let registry = RegistryBuilder::new(Config::default())
            .token_service(tokens)
            .build()
            .unwrap();
        assert!(registry
            .events()
            .subscribers()
            .iter()
            .any(|name| name == PULL_RECORDER));
        let _router = registry.router();
    }

    #[test]
    fn local_endpoint_uses_replication_account() {
        let mut config = Config::default();
        config.registry.external_url = "https://harbor.example.com".into();
        config.registry.replication_user = Some("robot".into());
        let endpoint = RegistryBuilder::local_endpoint(&config);
        assert_eq!(endpoint.url, "https://harbor.example.com");
        assert_eq!(endpoint.registry_type, "harbor");
        assert_eq!(endpoint.credential.unwrap().access_key, "robot");
    }
}
