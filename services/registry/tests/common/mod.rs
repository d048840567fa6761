//! Shared setup for the registry integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use harbor_core::media::{OCI_CONFIG, OCI_MANIFEST};
use harbor_core::model::{NewProject, Project, ProjectMetadata};
use harbor_core::store::{ProjectStore, Store};
use harbor_core::{Digest, Secret};
use harbor_registry::config::UserConfig;
use harbor_registry::token::TokenService;
use harbor_registry::{Config, Registry, RegistryBuilder};
use serde_json::{json, Value};
use tower::ServiceExt;

pub const KEY: &str = include_str!("../fixtures/token-key.pk8");
pub const REALM: &str = "https://h/service/token";
pub const ADMIN: (&str, &str) = ("admin", "Harbor12345");
pub const DEV: (&str, &str) = ("dev", "dev-password");
pub const GUEST: (&str, &str) = ("guest", "guest-password");

pub fn config() -> Config {
    let mut config = Config::default();
    config.token.realm = REALM.into();
    config.registry.external_url = "https://h".into();
    config.users = [(ADMIN, true), (DEV, false), (GUEST, false)]
        .into_iter()
        .map(|((username, password), sysadmin)| UserConfig {
            username: username.into(),
            password: Secret::new(password),
            sysadmin,
        })
        .collect();
    config
}

pub struct Harness {
    pub registry: Registry,
    pub router: Router,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(config(), |builder| builder).await
    }

    pub async fn with(config: Config, customize: impl FnOnce(RegistryBuilder) -> RegistryBuilder) -> Self {
        let tokens = TokenService::from_pem(config.token.clone(), KEY).unwrap();
        let registry = customize(RegistryBuilder::new(config).token_service(tokens))
            .build()
            .unwrap();
        let router = registry.router();
        Harness { registry, router }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.registry.store()
    }

    pub async fn project(&self, name: &str, public: bool) -> Project {
        self.store()
            .create_project(NewProject {
                name: name.into(),
                owner: ADMIN.0.into(),
                metadata: ProjectMetadata {
                    public,
                    ..ProjectMetadata::default()
                },
                storage_limit: None,
            })
            .await
            .unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Upload `bytes` to `repository` in one request.
    pub async fn push_blob(&self, repository: &str, bytes: &[u8]) -> Digest {
        let digest = Digest::sha256(bytes);
        let response = self
            .send(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v2/{repository}/blobs/uploads/?digest={digest}"))
                    .header(header::AUTHORIZATION, basic(ADMIN))
                    .header(header::CONTENT_LENGTH, bytes.len())
                    .body(Body::from(bytes.to_vec()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED, "pushing blob {digest}");
        digest
    }

    pub async fn put_manifest(&self, repository: &str, reference: &str, manifest: &[u8]) -> Response<Body> {
        self.send(
            Request::builder()
                .method(Method::PUT)
                .uri(format!("/v2/{repository}/manifests/{reference}"))
                .header(header::AUTHORIZATION, basic(ADMIN))
                .header(header::CONTENT_TYPE, OCI_MANIFEST)
                .body(Body::from(manifest.to_vec()))
                .unwrap(),
        )
        .await
    }

    /// Push a small image with one layer per entry of `layers`, returning
    /// the manifest bytes.
    pub async fn push_image(&self, repository: &str, tag: &str, layers: &[&[u8]]) -> Bytes {
        let manifest = self.image_manifest(repository, &json!({"architecture": "amd64", "os": "linux"}), layers).await;
        let response = self.put_manifest(repository, tag, &manifest).await;
        assert_eq!(response.status(), StatusCode::CREATED, "pushing {repository}:{tag}");
        manifest
    }

    /// Upload a config and layers, returning manifest bytes referencing
    /// them.
    pub async fn image_manifest(&self, repository: &str, config: &Value, layers: &[&[u8]]) -> Bytes {
        let config = serde_json::to_vec(config).unwrap();
        let config_digest = self.push_blob(repository, &config).await;
        let mut descriptors = Vec::new();
        for layer in layers {
            let digest = self.push_blob(repository, layer).await;
            descriptors.push(json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest.to_string(),
                "size": layer.len(),
            }));
        }
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": OCI_CONFIG,
                "digest": config_digest.to_string(),
                "size": config.len(),
            },
            "layers": descriptors,
        });
        Bytes::from(serde_json::to_vec(&manifest).unwrap())
    }

    pub async fn api(&self, method: Method, path: &str, user: Option<(&str, &str)>, body: Option<Value>) -> Response<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(format!("/api/v2.0{path}"));
        if let Some(user) = user {
            request = request.header(header::AUTHORIZATION, basic(user));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => request.body(Body::empty()),
        };
        self.send(request.unwrap()).await
    }
}

pub fn basic((username, password): (&str, &str)) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

pub async fn body(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    serde_json::from_slice(&body(response).await).unwrap()
}

/// The trailing id of a `Location` header.
pub fn location_id(response: &Response<Body>) -> i64 {
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .rsplit('/')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}
