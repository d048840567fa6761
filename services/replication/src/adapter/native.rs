//! Adapter for any registry speaking the Distribution API.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt as _, TryStreamExt as _};
use harbor_core::model::{FilterKind, RegistryEndpoint, ReplicationFilter};
use harbor_core::{Digest, Result};
use registry_client::{collect, Authenticator, Body, ManifestHead, PulledBlob, PulledManifest};
use registry_client::{RegistryClient, ReqwestTransport};
use std::sync::Arc;
use std::time::Duration;

use super::{credential, parse_url, Adapter, AdapterInfo, Health, Resource};
use crate::filter::Filters;

const LIST_CONCURRENCY: usize = 8;

/// Distribution API adapter. Serves the `docker-registry` type and the
/// cloud registries which need nothing beyond the standard API.
#[derive(Debug, Clone)]
pub struct NativeAdapter {
    endpoint: RegistryEndpoint,
    client: RegistryClient,
}

impl NativeAdapter {
    /// Connect to `endpoint` over HTTP.
    pub fn new(endpoint: &RegistryEndpoint) -> Result<Self> {
        Self::with_auth(endpoint, Authenticator::new(credential(endpoint)))
    }

    /// Quay rejects catalog scopes in token requests.
    pub fn quay(endpoint: &RegistryEndpoint) -> Result<Self> {
        Self::with_auth(
            endpoint,
            Authenticator::new(credential(endpoint)).strip_catalog_scope(true),
        )
    }

    pub(crate) fn with_auth(endpoint: &RegistryEndpoint, auth: Authenticator) -> Result<Self> {
        let transport = ReqwestTransport::new(endpoint.insecure, Duration::from_secs(30))?;
        let client = RegistryClient::new(parse_url(endpoint)?, Arc::new(transport), auth);
        Ok(Self::from_client(endpoint, client))
    }

    /// Wrap an existing client.
    pub fn from_client(endpoint: &RegistryEndpoint, client: RegistryClient) -> Self {
        NativeAdapter {
            endpoint: endpoint.clone(),
            client,
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    /// Catalog entries passing the name filter, each with its passing tags.
    pub(crate) async fn list_from_catalog(
        &self,
        filters: &[ReplicationFilter],
    ) -> Result<Vec<Resource>> {
        let compiled = Filters::new(filters)?;
        let repositories: Vec<String> = self
            .client
            .catalog()
            .await?
            .into_iter()
            .filter(|repo| compiled.repository(repo))
            .collect();

        let resources = futures::stream::iter(repositories)
            .map(|repo| async move {
                let tags = self.client.list_tags(&repo).await?;
                Ok::<_, harbor_core::Error>(Resource::image(repo, tags))
            })
            .buffered(LIST_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(compiled.apply(resources))
    }
}

#[async_trait]
impl Adapter for NativeAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            registry_type: self.endpoint.registry_type.clone(),
            filters: vec![FilterKind::Name, FilterKind::Tag],
        }
    }

    fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    async fn health_check(&self) -> Result<Health> {
        match self.client.ping().await {
            Ok(()) => Ok(Health::Healthy),
            Err(err) => {
                tracing::warn!(registry = %self.endpoint.name, error = %err, "Registry is unhealthy");
                Ok(Health::Unhealthy)
            }
        }
    }

    async fn prepare_for_push(&self, _resources: &[Resource]) -> Result<()> {
        Ok(())
    }

    async fn list_resources(&self, filters: &[ReplicationFilter]) -> Result<Vec<Resource>> {
        self.list_from_catalog(filters).await
    }

    async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<Option<ManifestHead>> {
        Ok(self.client.manifest_exists(repo, reference).await?)
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<PulledManifest> {
        Ok(self.client.pull_manifest(repo, reference).await?)
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<Digest> {
        Ok(self
            .client
            .push_manifest(repo, reference, media_type, bytes)
            .await?)
    }

    async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<Option<u64>> {
        Ok(self.client.blob_exists(repo, digest).await?)
    }

    async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<PulledBlob> {
        Ok(self.client.pull_blob(repo, digest).await?)
    }

    async fn push_blob(
        &self,
        repo: &str,
        digest: &Digest,
        size: Option<u64>,
        body: Body,
        chunk_size: Option<usize>,
    ) -> Result<()> {
        match (chunk_size, size) {
            (Some(chunk_size), _) => {
                self.client
                    .push_blob_chunked(repo, digest, body, chunk_size)
                    .await?
            }
            (None, Some(size)) => self.client.push_blob(repo, digest, size, body).await?,
            (None, None) => {
                let bytes = collect(body).await?;
                let size = bytes.len() as u64;
                self.client
                    .push_blob(repo, digest, size, registry_client::full(bytes))
                    .await?
            }
        }
        Ok(())
    }

    async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<bool> {
        Ok(self.client.mount_blob(repo, digest, from).await?)
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<bool> {
        Ok(self.client.delete_manifest(repo, reference).await?)
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool> {
        Ok(self.client.delete_tag(repo, tag).await?)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        Ok(self.client.list_tags(repo).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::model::Decoration;
    use http::Method;
    use registry_client::mock::{MockResponse, MockTransport};
    use serde_json::json;

    fn adapter(transport: Arc<MockTransport>) -> NativeAdapter {
        let endpoint = RegistryEndpoint {
            id: 3,
            name: "dist".into(),
            registry_type: "docker-registry".into(),
            url: "https://dist.example.com".into(),
            credential: None,
            insecure: false,
        };
        let client = RegistryClient::new(
            url::Url::parse(&endpoint.url).unwrap(),
            transport,
            Authenticator::new(None),
        );
        NativeAdapter::from_client(&endpoint, client)
    }

    #[tokio::test]
    async fn lists_filtered_resources() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::GET,
            "/v2/_catalog",
            MockResponse::ok().json(&json!({"repositories": ["library/nginx", "team/app"]})),
        );
        transport.respond(
            Method::GET,
            "/v2/library/nginx/tags/list",
            MockResponse::ok().json(&json!({"name": "library/nginx", "tags": ["1.25", "latest"]})),
        );

        let adapter = adapter(transport.clone());
        let filters = [
            ReplicationFilter {
                kind: FilterKind::Name,
                value: "library/*".into(),
                decoration: Decoration::Matches,
            },
            ReplicationFilter {
                kind: FilterKind::Tag,
                value: "1.*".into(),
                decoration: Decoration::Matches,
            },
        ];
        let resources = adapter.list_resources(&filters).await.unwrap();
        assert_eq!(resources, vec![Resource::image("library/nginx", ["1.25"])]);
        assert!(transport
            .requests_to(&Method::GET, "/v2/team/app/tags/list")
            .is_empty());
    }

    #[tokio::test]
    async fn unreachable_registry_is_unhealthy() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::GET,
            "/v2/",
            MockResponse::new(http::StatusCode::SERVICE_UNAVAILABLE),
        );
        let adapter = adapter(transport);
        assert_eq!(adapter.health_check().await.unwrap(), Health::Unhealthy);
    }
}
