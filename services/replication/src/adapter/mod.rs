//! Registry adapters.
//!
//! An [`Adapter`] exposes one registry, local or remote, through the
//! operations replication needs. Adapters are created from stored
//! [`RegistryEndpoint`]s by an [`AdapterRegistry`], keyed by the endpoint's
//! `type`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use harbor_core::model::{FilterKind, RegistryEndpoint, ResourceType};
use harbor_core::model::ReplicationFilter;
use harbor_core::{Digest, Error, Result, Secret};
use registry_client::{Body, ManifestHead, PulledBlob, PulledManifest};
use serde::{Deserialize, Serialize};

mod dockerhub;
mod harbor;
pub mod memory;
mod native;

pub use self::dockerhub::DockerHubAdapter;
pub use self::harbor::HarborAdapter;
pub use self::memory::MemoryAdapter;
pub use self::native::NativeAdapter;

/// One artifact of a repository, as listed by a source adapter or carried
/// by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Kind of artifact.
    pub resource_type: ResourceType,
    /// Full repository path.
    pub repository: String,
    /// Manifest digest, when known without a lookup.
    #[serde(default)]
    pub digest: Option<Digest>,
    /// Tags of the artifact.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Harbor labels of the artifact.
    #[serde(default)]
    pub labels: Vec<String>,
    /// The artifact was deleted at the source.
    #[serde(default)]
    pub deleted: bool,
    /// Only the listed tags were deleted, not the artifact.
    #[serde(default)]
    pub delete_tag: bool,
}

impl Resource {
    /// An image with some tags.
    pub fn image(repository: impl Into<String>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Resource {
            resource_type: ResourceType::Image,
            repository: repository.into(),
            digest: None,
            tags: tags.into_iter().map(Into::into).collect(),
            labels: Vec::new(),
            deleted: false,
            delete_tag: false,
        }
    }

    /// References to replicate: every tag, or the digest of an untagged
    /// artifact.
    pub fn references(&self) -> Vec<String> {
        if !self.tags.is_empty() {
            return self.tags.clone();
        }
        self.digest.iter().map(Digest::to_string).collect()
    }

    /// Project component of the repository path.
    pub fn namespace(&self) -> &str {
        self.repository
            .split_once('/')
            .map_or(self.repository.as_str(), |(namespace, _)| namespace)
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Reachable and accepting our credentials.
    Healthy,
    /// Unreachable or refusing us.
    Unhealthy,
}

/// Static description of an adapter type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    /// Registry type the adapter serves.
    pub registry_type: String,
    /// Filters `list_resources` honours.
    pub filters: Vec<FilterKind>,
}

/// Operations replication performs against a registry.
#[async_trait]
pub trait Adapter: fmt::Debug + Send + Sync {
    /// What the adapter supports.
    fn info(&self) -> AdapterInfo;

    /// The endpoint the adapter talks to.
    fn endpoint(&self) -> &RegistryEndpoint;

    /// Whether the registry is reachable with the configured credentials.
    async fn health_check(&self) -> Result<Health>;

    /// Create whatever must exist before `resources` can be pushed, such as
    /// destination projects.
    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()>;

    /// Resources of the registry, narrowed by `filters` as far as the
    /// registry allows. Callers still apply the filters afterwards.
    async fn list_resources(&self, filters: &[ReplicationFilter]) -> Result<Vec<Resource>>;

    /// Digest and media type of a manifest, if it exists.
    async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<Option<ManifestHead>>;

    /// Download a manifest.
    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<PulledManifest>;

    /// Upload a manifest.
    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<Digest>;

    /// Size of a blob, if it exists.
    async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<Option<u64>>;

    /// Start downloading a blob.
    async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<PulledBlob>;

    /// Upload a blob, in chunks of `chunk_size` when given.
    async fn push_blob(
        &self,
        repo: &str,
        digest: &Digest,
        size: Option<u64>,
        body: Body,
        chunk_size: Option<usize>,
    ) -> Result<()>;

    /// Link a blob of `from` into `repo`. False when the registry declined.
    async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<bool>;

    /// Delete a manifest by tag or digest. False when it did not exist.
    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<bool>;

    /// Delete one tag. False when it did not exist.
    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool>;

    /// Tags of a repository.
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;
}

/// Builds an adapter for an endpoint.
pub type AdapterFactory =
    Arc<dyn Fn(&RegistryEndpoint) -> Result<Arc<dyn Adapter>> + Send + Sync>;

/// Registry types served by the plain Distribution adapter.
pub const NATIVE_TYPES: &[&str] = &[
    "docker-registry",
    "google-gcr",
    "aws-ecr",
    "azure-acr",
    "ali-acr",
    "huawei-SWR",
    "tencent-tcr",
    "gitlab",
    "github-ghcr",
    "jfrog-artifactory",
];

/// Adapter constructors keyed by registry type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

pub(crate) fn credential(endpoint: &RegistryEndpoint) -> Option<(String, Secret)> {
    endpoint
        .credential
        .as_ref()
        .filter(|credential| !credential.access_key.is_empty())
        .map(|credential| {
            (
                credential.access_key.clone(),
                credential.access_secret.clone(),
            )
        })
}

pub(crate) fn parse_url(endpoint: &RegistryEndpoint) -> Result<url::Url> {
    url::Url::parse(&endpoint.url).map_err(|err| {
        Error::invalid(format!(
            "registry {} has an invalid url {:?}: {err}",
            endpoint.name, endpoint.url
        ))
    })
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in adapter type whose name is in `enabled`, or all of
    /// them when `enabled` is empty.
    pub fn builtin(enabled: &[String]) -> Self {
        let allowed = |name: &str| enabled.is_empty() || enabled.iter().any(|e| e == name);
        let mut registry = Self::new();

        if allowed("harbor") {
            registry.register("harbor", |endpoint| {
                Ok(Arc::new(HarborAdapter::new(endpoint)?) as Arc<dyn Adapter>)
            });
        }
        if allowed("docker-hub") {
            registry.register("docker-hub", |endpoint| {
                Ok(Arc::new(DockerHubAdapter::new(endpoint)?) as Arc<dyn Adapter>)
            });
        }
        if allowed("quay") {
            registry.register("quay", |endpoint| {
                Ok(Arc::new(NativeAdapter::quay(endpoint)?) as Arc<dyn Adapter>)
            });
        }
        for name in NATIVE_TYPES.iter().copied().filter(|name| allowed(name)) {
            registry.register(name, |endpoint| {
                Ok(Arc::new(NativeAdapter::new(endpoint)?) as Arc<dyn Adapter>)
            });
        }
        registry
    }

    /// Register (or replace) the constructor of `registry_type`.
    pub fn register<F>(&mut self, registry_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&RegistryEndpoint) -> Result<Arc<dyn Adapter>> + Send + Sync + 'static,
    {
        self.factories.insert(registry_type.into(), Arc::new(factory));
        self
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the adapter for `endpoint`.
    pub fn create(&self, endpoint: &RegistryEndpoint) -> Result<Arc<dyn Adapter>> {
        let factory = self.factories.get(&endpoint.registry_type).ok_or_else(|| {
            Error::invalid(format!(
                "adapter type {:?} is not enabled",
                endpoint.registry_type
            ))
            .with_code("UNSUPPORTED")
        })?;
        factory(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(registry_type: &str) -> RegistryEndpoint {
        RegistryEndpoint {
            id: 1,
            name: "remote".into(),
            registry_type: registry_type.into(),
            url: "https://registry.example.com".into(),
            credential: None,
            insecure: false,
        }
    }

    #[test]
    fn builtin_respects_enabled_list() {
        let all = AdapterRegistry::builtin(&[]);
        assert!(all.types().contains(&"harbor"));
        assert!(all.types().contains(&"quay"));
        assert!(all.types().contains(&"docker-registry"));

        let some = AdapterRegistry::builtin(&["harbor".to_owned()]);
        assert_eq!(some.types(), vec!["harbor"]);
        let err = some.create(&endpoint("quay")).unwrap_err();
        assert_eq!(err.kind(), harbor_core::ErrorKind::Invalid);
    }

    #[test]
    fn creates_adapters_by_type() {
        let registry = AdapterRegistry::builtin(&[]);
        let adapter = registry.create(&endpoint("google-gcr")).unwrap();
        assert_eq!(adapter.info().registry_type, "google-gcr");
        assert_eq!(adapter.endpoint().name, "remote");
    }

    #[test]
    fn references_fall_back_to_digest() {
        let mut resource = Resource::image("library/nginx", Vec::<String>::new());
        assert!(resource.references().is_empty());
        let digest = Digest::sha256(b"m");
        resource.digest = Some(digest.clone());
        assert_eq!(resource.references(), vec![digest.to_string()]);
        assert_eq!(resource.namespace(), "library");
    }
}
