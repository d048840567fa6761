//! Adapter for Harbor registries, the local one included.
//!
//! Distribution calls go through [`NativeAdapter`]. Project creation,
//! artifact listing with labels, and tag deletion use the management API
//! under `/api/v2.0`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt as _, TryStreamExt as _};
use harbor_core::model::{FilterKind, RegistryEndpoint, ReplicationFilter, ResourceType};
use harbor_core::{Digest, Error, Result};
use http::{Method, StatusCode};
use registry_client::{Authenticator, Body, ManifestHead, PulledBlob, PulledManifest, RegistryClient};
use serde::Deserialize;
use serde_json::json;

use super::{credential, Adapter, AdapterInfo, Health, NativeAdapter, Resource};
use crate::filter::Filters;

const API: &str = "/api/v2.0";
const PAGE_SIZE: usize = 100;
const LIST_CONCURRENCY: usize = 8;

/// Repository names in management API paths are encoded twice.
pub(crate) fn encode_repository(repository: &str) -> String {
    repository.replace('/', "%252F")
}

#[derive(Debug, Deserialize)]
struct HealthStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactRow {
    digest: Digest,
    #[serde(default, rename = "type")]
    artifact_type: String,
    #[serde(default)]
    tags: Option<Vec<Named>>,
    #[serde(default)]
    labels: Option<Vec<Named>>,
}

impl ArtifactRow {
    fn into_resource(self, repository: &str) -> Resource {
        let resource_type = match self.artifact_type.as_str() {
            "IMAGE" => ResourceType::Image,
            "CHART" => ResourceType::Chart,
            _ => ResourceType::Artifact,
        };
        Resource {
            resource_type,
            repository: repository.to_owned(),
            digest: Some(self.digest),
            tags: self.tags.unwrap_or_default().into_iter().map(|t| t.name).collect(),
            labels: self.labels.unwrap_or_default().into_iter().map(|l| l.name).collect(),
            deleted: false,
            delete_tag: false,
        }
    }
}

/// Harbor adapter.
#[derive(Debug, Clone)]
pub struct HarborAdapter {
    native: NativeAdapter,
}

impl HarborAdapter {
    /// Connect to `endpoint`, sending basic credentials up front since the
    /// management API does not issue challenges.
    pub fn new(endpoint: &RegistryEndpoint) -> Result<Self> {
        let auth = Authenticator::new(credential(endpoint)).preemptive_basic(true);
        Ok(HarborAdapter {
            native: NativeAdapter::with_auth(endpoint, auth)?,
        })
    }

    /// Wrap an existing client.
    pub fn from_client(endpoint: &RegistryEndpoint, client: RegistryClient) -> Self {
        HarborAdapter {
            native: NativeAdapter::from_client(endpoint, client),
        }
    }

    fn client(&self) -> &RegistryClient {
        self.native.client()
    }

    async fn artifacts(&self, repository: &str) -> Result<Vec<Resource>> {
        let (project, name) = repository.split_once('/').ok_or_else(|| {
            Error::invalid(format!("repository {repository:?} has no project"))
        })?;
        let name = encode_repository(name);

        let mut resources = Vec::new();
        for page in 1.. {
            let mut url = self.client().endpoint(&format!(
                "{API}/projects/{project}/repositories/{name}/artifacts"
            ));
            url.query_pairs_mut()
                .append_pair("with_tag", "true")
                .append_pair("with_label", "true")
                .append_pair("page", &page.to_string())
                .append_pair("page_size", &PAGE_SIZE.to_string());

            let rows: Vec<ArtifactRow> = self.client().get_json_url(url).await?;
            let count = rows.len();
            resources.extend(rows.into_iter().map(|row| row.into_resource(repository)));
            if count < PAGE_SIZE {
                break;
            }
        }
        Ok(resources)
    }
}

#[async_trait]
impl Adapter for HarborAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            registry_type: "harbor".into(),
            filters: vec![
                FilterKind::Name,
                FilterKind::Tag,
                FilterKind::Label,
                FilterKind::Resource,
            ],
        }
    }

    fn endpoint(&self) -> &RegistryEndpoint {
        self.native.endpoint()
    }

    async fn health_check(&self) -> Result<Health> {
        match self.client().get_json::<HealthStatus>(&format!("{API}/health")).await {
            Ok(health) if health.status == "healthy" => Ok(Health::Healthy),
            Ok(health) => {
                tracing::warn!(registry = %self.endpoint().name, status = %health.status, "Harbor reports unhealthy");
                Ok(Health::Unhealthy)
            }
            Err(err) => {
                tracing::warn!(registry = %self.endpoint().name, error = %err, "Harbor is unreachable");
                Ok(Health::Unhealthy)
            }
        }
    }

    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        let projects: BTreeSet<&str> = resources.iter().map(Resource::namespace).collect();
        for project in projects {
            let status = self
                .client()
                .send_json(
                    Method::POST,
                    &format!("{API}/projects"),
                    Some(&json!({"project_name": project, "metadata": {"public": "false"}})),
                    &[StatusCode::CREATED, StatusCode::CONFLICT],
                )
                .await?;
            if status == StatusCode::CREATED {
                tracing::info!(registry = %self.endpoint().name, project, "Created project");
            }
        }
        Ok(())
    }

    async fn list_resources(&self, filters: &[ReplicationFilter]) -> Result<Vec<Resource>> {
        let compiled = Filters::new(filters)?;
        let repositories: Vec<String> = self
            .client()
            .catalog()
            .await?
            .into_iter()
            .filter(|repo| compiled.repository(repo))
            .collect();

        let pages = futures::stream::iter(repositories)
            .map(|repo| async move { self.artifacts(&repo).await })
            .buffered(LIST_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(compiled.apply(pages.into_iter().flatten().collect()))
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
        self.native.delete_manifest(repo, reference).await
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool> {
        let (project, name) = repo
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("repository {repo:?} has no project")))?;
        let name = encode_repository(name);
        let status = self
            .client()
            .send_json(
                Method::DELETE,
                &format!("{API}/projects/{project}/repositories/{name}/artifacts/{tag}/tags/{tag}"),
                None,
                &[StatusCode::OK, StatusCode::NOT_FOUND],
            )
            .await?;
        Ok(status == StatusCode::OK)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        self.native.list_tags(repo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_client::mock::{MockResponse, MockTransport};
    use std::sync::Arc;

    fn adapter(transport: Arc<MockTransport>) -> HarborAdapter {
        let endpoint = RegistryEndpoint {
            id: 7,
            name: "dr-site".into(),
            registry_type: "harbor".into(),
            url: "https://harbor.example.com".into(),
            credential: None,
            insecure: false,
        };
        let client = RegistryClient::new(
            url::Url::parse(&endpoint.url).unwrap(),
            transport,
            Authenticator::new(None),
        );
        HarborAdapter::from_client(&endpoint, client)
    }

    #[tokio::test]
    async fn creates_missing_projects_once() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::POST, "/api/v2.0/projects", MockResponse::new(StatusCode::CREATED));
        let adapter = adapter(transport.clone());

        let resources = [
            Resource::image("team/app", ["1"]),
            Resource::image("team/db", ["1"]),
            Resource::image("other/app", ["1"]),
        ];
        adapter.prepare_for_push(&resources).await.unwrap();
        let posts = transport.requests_to(&Method::POST, "/api/v2.0/projects");
        assert_eq!(posts.len(), 2);
        let body: serde_json::Value = serde_json::from_slice(&posts[0].body).unwrap();
        assert_eq!(body["project_name"], "other");
    }

    #[tokio::test]
    async fn existing_project_is_fine() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::POST, "/api/v2.0/projects", MockResponse::new(StatusCode::CONFLICT));
        let adapter = adapter(transport);
        adapter
            .prepare_for_push(&[Resource::image("team/app", ["1"])])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lists_artifacts_with_labels() {
        let digest = Digest::sha256(b"manifest");
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::GET,
            "/v2/_catalog",
            MockResponse::ok().json(&json!({"repositories": ["team/web/app"]})),
        );
        transport.respond(
            Method::GET,
            "/api/v2.0/projects/team/repositories/web%252Fapp/artifacts",
            MockResponse::ok().json(&json!([{
                "digest": digest.to_string(),
                "type": "IMAGE",
                "tags": [{"name": "v1"}],
                "labels": [{"name": "prod"}],
            }])),
        );
        let adapter = adapter(transport);
        let filters = [ReplicationFilter {
            kind: FilterKind::Label,
            value: "prod".into(),
            decoration: harbor_core::model::Decoration::Matches,
        }];
        let resources = adapter.list_resources(&filters).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].digest, Some(digest));
        assert_eq!(resources[0].tags, vec!["v1"]);
    }

    #[tokio::test]
    async fn health_reads_status() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::GET,
            "/api/v2.0/health",
            MockResponse::ok().json(&json!({"status": "healthy"})),
        );
        assert_eq!(adapter(transport).health_check().await.unwrap(), Health::Healthy);
    }
}
