//! Adapter for Docker Hub.
//!
//! Images move through `registry-1.docker.io`. Docker Hub has no catalog,
//! so repositories and tags are listed through the Hub API, and tags can
//! only be deleted there.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use harbor_core::model::{Decoration, FilterKind, RegistryEndpoint, ReplicationFilter};
use harbor_core::{Digest, Error, Result, Secret};
use http::{Method, StatusCode};
use registry_client::{Authenticator, Body, ManifestHead, PulledBlob, PulledManifest, RegistryClient};
use registry_client::ReqwestTransport;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use url::Url;

use super::{credential, Adapter, AdapterInfo, Health, NativeAdapter, Resource};
use crate::filter::Filters;

const HUB_API: &str = "https://hub.docker.com";
const HUB_REGISTRY: &str = "https://registry-1.docker.io";
const PAGE_SIZE: &str = "100";
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRow {
    name: String,
    namespace: String,
}

#[derive(Debug, Deserialize)]
struct TagRow {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Namespaces {
    #[serde(default)]
    namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Login {
    token: String,
}

/// Docker Hub adapter.
#[derive(Debug)]
pub struct DockerHubAdapter {
    native: NativeAdapter,
    hub: RegistryClient,
    credential: Option<(String, Secret)>,
    session: OnceCell<()>,
}

/// Literal leading component of a name pattern, if any.
fn literal_namespace(pattern: &str) -> Option<&str> {
    let first = pattern.split('/').next()?;
    let special = |c: char| matches!(c, '*' | '?' | '[' | '{');
    (!first.is_empty() && !first.contains(special) && pattern.contains('/')).then_some(first)
}

impl DockerHubAdapter {
    /// Connect to Docker Hub. The endpoint URL selects the registry host,
    /// defaulting to `registry-1.docker.io`.
    pub fn new(endpoint: &RegistryEndpoint) -> Result<Self> {
        let mut endpoint = endpoint.clone();
        if endpoint.url.is_empty() {
            endpoint.url = HUB_REGISTRY.to_owned();
        }
        let native = NativeAdapter::with_auth(&endpoint, Authenticator::new(credential(&endpoint)))?;
        let transport = ReqwestTransport::new(endpoint.insecure, Duration::from_secs(30))?;
        let hub_url = Url::parse(HUB_API).map_err(|err| Error::internal(err.to_string()))?;
        let hub = RegistryClient::new(hub_url, Arc::new(transport), Authenticator::new(None));
        Ok(Self::from_parts(native, hub, credential(&endpoint)))
    }

    pub(crate) fn from_parts(
        native: NativeAdapter,
        hub: RegistryClient,
        credential: Option<(String, Secret)>,
    ) -> Self {
        DockerHubAdapter {
            native,
            hub,
            credential,
            session: OnceCell::new(),
        }
    }

    /// Log in to the Hub API once; later calls reuse the cached token.
    async fn login(&self) -> Result<()> {
        let Some((username, password)) = &self.credential else {
            return Ok(());
        };
        self.session
            .get_or_try_init(|| async {
                let login: Login = self
                    .hub
                    .post_json(
                        "/v2/users/login",
                        &json!({"username": username, "password": password.revealed()}),
                    )
                    .await?;
                self.hub
                    .authenticator()
                    .insert_token("", Secret::new(login.token), SESSION_TTL);
                Ok::<_, Error>(())
            })
            .await?;
        Ok(())
    }

    async fn paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        self.login().await?;
        let mut url = self.hub.endpoint(path);
        url.query_pairs_mut().append_pair("page_size", PAGE_SIZE);
        let mut rows = Vec::new();
        loop {
            let page: Page<T> = self.hub.get_json_url(url).await?;
            rows.extend(page.results);
            match page.next.filter(|next| !next.is_empty()) {
                Some(next) => {
                    url = Url::parse(&next).map_err(|err| {
                        Error::dependency(format!("Docker Hub returned a bad next link: {err}"))
                    })?;
                }
                None => break,
            }
        }
        Ok(rows)
    }

    /// Namespaces to list: the literal first component of a matching name
    /// filter, else every namespace the account can see.
    async fn namespaces(&self, filters: &[ReplicationFilter]) -> Result<Vec<String>> {
        let literal = filters
            .iter()
            .find(|f| f.kind == FilterKind::Name && f.decoration == Decoration::Matches)
            .and_then(|f| literal_namespace(&f.value));
        if let Some(namespace) = literal {
            return Ok(vec![namespace.to_owned()]);
        }
        self.login().await?;
        let namespaces: Namespaces = self.hub.get_json("/v2/repositories/namespaces").await?;
        Ok(namespaces.namespaces)
    }

    fn split(repo: &str) -> Result<(&str, &str)> {
        repo.split_once('/')
            .filter(|(_, name)| !name.contains('/'))
            .ok_or_else(|| {
                Error::invalid(format!("Docker Hub repository {repo:?} must be namespace/name"))
            })
    }
}

#[async_trait]
impl Adapter for DockerHubAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            registry_type: "docker-hub".into(),
            filters: vec![FilterKind::Name, FilterKind::Tag],
        }
    }

    fn endpoint(&self) -> &RegistryEndpoint {
        self.native.endpoint()
    }

    async fn health_check(&self) -> Result<Health> {
        match self.login().await {
            Ok(()) => self.native.health_check().await,
            Err(err) => {
                tracing::warn!(error = %err, "Docker Hub login failed");
                Ok(Health::Unhealthy)
            }
        }
    }

    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        for resource in resources {
            Self::split(&resource.repository)?;
        }
        Ok(())
    }

    async fn list_resources(&self, filters: &[ReplicationFilter]) -> Result<Vec<Resource>> {
        let compiled = Filters::new(filters)?;
        let mut resources = Vec::new();
        for namespace in self.namespaces(filters).await? {
            let repositories: Vec<RepositoryRow> =
                self.paged(&format!("/v2/repositories/{namespace}/")).await?;
            for row in repositories {
                let repository = format!("{}/{}", row.namespace, row.name);
                if !compiled.repository(&repository) {
                    continue;
                }
                let tags: Vec<TagRow> = self
                    .paged(&format!("/v2/repositories/{}/{}/tags/", row.namespace, row.name))
                    .await?;
                resources.push(Resource::image(repository, tags.into_iter().map(|t| t.name)));
            }
        }
        Ok(compiled.apply(resources))
    }

    async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<Option<ManifestHead>> {
        self.native.manifest_exists(repo, reference).await
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<PulledManifest> {
        self.native.pull_manifest(repo, reference).await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<Digest> {
        self.native.push_manifest(repo, reference, media_type, bytes).await
    }

    async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<Option<u64>> {
        self.native.blob_exists(repo, digest).await
    }

    async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<PulledBlob> {
        self.native.pull_blob(repo, digest).await
    }

    async fn push_blob(
        &self,
        repo: &str,
        digest: &Digest,
        size: Option<u64>,
        body: Body,
        chunk_size: Option<usize>,
    ) -> Result<()> {
        self.native.push_blob(repo, digest, size, body, chunk_size).await
    }

    async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<bool> {
        self.native.mount_blob(repo, digest, from).await
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<bool> {
        if reference.parse::<Digest>().is_ok() {
            return Err(Error::invalid("Docker Hub can only delete by tag").with_code("UNSUPPORTED"));
        }
        self.delete_tag(repo, reference).await
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool> {
        let (namespace, name) = Self::split(repo)?;
        self.login().await?;
        let status = self
            .hub
            .send_json(
                Method::DELETE,
                &format!("/v2/repositories/{namespace}/{name}/tags/{tag}/"),
                None,
                &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
            )
            .await?;
        Ok(status != StatusCode::NOT_FOUND)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let (namespace, name) = Self::split(repo)?;
        let tags: Vec<TagRow> = self
            .paged(&format!("/v2/repositories/{namespace}/{name}/tags/"))
            .await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_client::mock::{MockResponse, MockTransport};

    fn adapter(hub: Arc<MockTransport>, registry: Arc<MockTransport>) -> DockerHubAdapter {
        let endpoint = RegistryEndpoint {
            id: 4,
            name: "hub".into(),
            registry_type: "docker-hub".into(),
            url: HUB_REGISTRY.into(),
            credential: None,
            insecure: false,
        };
        let credential = Some(("robot".to_owned(), Secret::new("s3cret")));
        let native = NativeAdapter::from_client(
            &endpoint,
            RegistryClient::new(Url::parse(HUB_REGISTRY).unwrap(), registry, Authenticator::new(None)),
        );
        let hub = RegistryClient::new(Url::parse(HUB_API).unwrap(), hub, Authenticator::new(None));
        DockerHubAdapter::from_parts(native, hub, credential)
    }

    #[test]
    fn literal_namespaces() {
        assert_eq!(literal_namespace("library/*"), Some("library"));
        assert_eq!(literal_namespace("lib*/nginx"), None);
        assert_eq!(literal_namespace("nginx"), None);
    }

    #[test]
    fn pages_without_results_are_empty() {
        let page: Page<RepositoryRow> = serde_json::from_value(json!({"next": null})).unwrap();
        assert!(page.results.is_empty());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn lists_namespace_from_filter() {
        let hub = Arc::new(MockTransport::new());
        hub.respond(
            Method::POST,
            "/v2/users/login",
            MockResponse::ok().json(&json!({"token": "jwt"})),
        );
        hub.respond(
            Method::GET,
            "/v2/repositories/acme/",
            MockResponse::ok().json(&json!({
                "next": null,
                "results": [{"name": "api", "namespace": "acme"}, {"name": "web", "namespace": "acme"}],
            })),
        );
        hub.respond(
            Method::GET,
            "/v2/repositories/acme/api/tags/",
            MockResponse::ok().json(&json!({"next": null, "results": [{"name": "1.0"}]})),
        );
        let adapter = adapter(hub.clone(), Arc::new(MockTransport::new()));

        let filters = [ReplicationFilter {
            kind: FilterKind::Name,
            value: "acme/api".into(),
            decoration: Decoration::Matches,
        }];
        let resources = adapter.list_resources(&filters).await.unwrap();
        assert_eq!(resources, vec![Resource::image("acme/api", ["1.0"])]);

        assert_eq!(hub.requests_to(&Method::POST, "/v2/users/login").len(), 1);
        let listing = &hub.requests_to(&Method::GET, "/v2/repositories/acme/")[0];
        assert_eq!(listing.header(http::header::AUTHORIZATION), Some("Bearer jwt"));
        assert!(hub
            .requests_to(&Method::GET, "/v2/repositories/namespaces")
            .is_empty());
    }

    #[tokio::test]
    async fn deletes_by_tag_only() {
        let hub = Arc::new(MockTransport::new());
        hub.respond(
            Method::POST,
            "/v2/users/login",
            MockResponse::ok().json(&json!({"token": "jwt"})),
        );
        hub.respond(
            Method::DELETE,
            "/v2/repositories/acme/api/tags/1.0/",
            MockResponse::new(StatusCode::NO_CONTENT),
        );
        let adapter = adapter(hub, Arc::new(MockTransport::new()));

        assert!(adapter.delete_manifest("acme/api", "1.0").await.unwrap());
        let digest = Digest::sha256(b"x").to_string();
        assert!(adapter.delete_manifest("acme/api", &digest).await.is_err());
        assert!(adapter.delete_tag("acme/team/api", "1.0").await.is_err());
    }
}
