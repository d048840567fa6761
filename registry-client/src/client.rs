//! Distribution API calls against one remote registry.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use harbor_core::digest::Hasher;
use harbor_core::{media, Digest, Secret};
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use http_body_util::BodyExt as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::auth::{Authenticator, Challenge};
use crate::error::{BoxError, ClientError, StatusError};
use crate::paginate::next_link;
use crate::transport::{collect, empty, full, stream, Body, ReqwestTransport, Transport};

const PAGE_SIZE: &str = "1000";
const DIGEST_HEADER: &str = "docker-content-digest";

/// Scope of the catalog endpoint.
pub const CATALOG_SCOPE: &str = "registry:catalog:*";

fn pull_scope(repo: &str) -> String {
    format!("repository:{repo}:pull")
}

fn push_scope(repo: &str) -> String {
    format!("repository:{repo}:pull,push")
}

fn delete_scope(repo: &str) -> String {
    format!("repository:{repo}:delete")
}

fn invalid(err: http::Error) -> ClientError {
    ClientError::InvalidRequest(err.to_string())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok())
}

fn digest_header(headers: &HeaderMap) -> Option<Digest> {
    header_str(headers, DIGEST_HEADER).and_then(|v| v.trim().parse().ok())
}

/// Result of a manifest `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// Media type reported by the registry.
    pub media_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// A downloaded manifest, verified against its digest.
#[derive(Debug, Clone)]
pub struct PulledManifest {
    /// Digest of `bytes`.
    pub digest: Digest,
    /// Media type from `Content-Type`.
    pub media_type: String,
    /// Exact bytes.
    pub bytes: Bytes,
}

/// A blob download in progress.
///
/// The body fails with [`ClientError::DigestMismatch`] at its end if the
/// content does not hash to the requested digest.
#[derive(Debug)]
pub struct PulledBlob {
    /// Size announced by the registry.
    pub size: Option<u64>,
    /// Verified content.
    pub body: Body,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Client for one registry endpoint.
///
/// Cheap to clone. Tokens are shared between clones.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base: Url,
    transport: Arc<dyn Transport>,
    auth: Arc<Authenticator>,
}

impl RegistryClient {
    /// A client using `transport` for every request.
    pub fn new(base: Url, transport: Arc<dyn Transport>, auth: Authenticator) -> Self {
        RegistryClient {
            base,
            transport,
            auth: Arc::new(auth),
        }
    }

    /// A client talking HTTP to `base`.
    pub fn connect(
        base: Url,
        credential: Option<(String, Secret)>,
        insecure: bool,
    ) -> Result<Self, ClientError> {
        let transport = ReqwestTransport::new(insecure, Duration::from_secs(30))?;
        Ok(Self::new(
            base,
            Arc::new(transport),
            Authenticator::new(credential),
        ))
    }

    /// Base URL of the registry.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Credentials and token cache shared by clones of this client.
    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Absolute URL of `path`, relative to the base URL's path.
    pub fn endpoint(&self, path: &str) -> Url {
        let prefix = self.base.path().trim_end_matches('/');
        let mut url = self.base.clone();
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    /// Send a request built by `build`, answering one authentication
    /// challenge by rebuilding it.
    async fn send<F>(&self, scope: &str, build: F) -> Result<http::Response<Body>, ClientError>
    where
        F: Fn() -> Result<http::Request<Body>, ClientError> + Send,
    {
        let mut challenged = false;
        loop {
            let mut request = build()?;
            if let Some(authorization) = self.auth.authorization(scope) {
                request
                    .headers_mut()
                    .insert(header::AUTHORIZATION, authorization);
            }
            let response = self.transport.send(request).await?;
            if response.status() != StatusCode::UNAUTHORIZED || challenged {
                return Ok(response);
            }
            challenged = true;

            let Some(challenge) = challenge_of(response.headers()) else {
                return Ok(response);
            };
            self.auth.invalidate(scope);
            if !self
                .auth
                .respond(self.transport.as_ref(), &challenge, scope)
                .await?
            {
                return Ok(response);
            }
        }
    }

    /// Send a request whose body cannot be replayed. A challenge refreshes
    /// the token and fails with [`ClientError::Reauthenticated`].
    async fn send_once(
        &self,
        scope: &str,
        mut request: http::Request<Body>,
    ) -> Result<http::Response<Body>, ClientError> {
        if let Some(authorization) = self.auth.authorization(scope) {
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, authorization);
        }
        let response = self.transport.send(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if let Some(challenge) = challenge_of(response.headers()) {
            self.auth.invalidate(scope);
            if self
                .auth
                .respond(self.transport.as_ref(), &challenge, scope)
                .await?
            {
                return Err(ClientError::Reauthenticated);
            }
        }
        Ok(response)
    }

    /// Check that the registry is reachable and accepts our credentials.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn ping(&self) -> Result<(), ClientError> {
        let url = self.endpoint("/v2/");
        let response = self.send("", || get(&url)).await?;
        check(Method::GET, &url, response, &[StatusCode::OK]).await?;
        Ok(())
    }

    /// Every repository of the catalog, following pagination.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn catalog(&self) -> Result<Vec<String>, ClientError> {
        let mut url = self.endpoint("/v2/_catalog");
        url.query_pairs_mut().append_pair("n", PAGE_SIZE);

        let mut repositories = Vec::new();
        loop {
            let response = self.send(CATALOG_SCOPE, || get(&url)).await?;
            let response = check(Method::GET, &url, response, &[StatusCode::OK]).await?;
            let next = next_link(response.headers(), &url);
            let page: CatalogPage = json(response).await?;
            repositories.extend(page.repositories);
            match next {
                Some(next) => url = next,
                None => break,
            }
        }
        tracing::debug!(count = repositories.len(), "Listed catalog");
        Ok(repositories)
    }

    /// Every tag of `repo`, following pagination. A missing repository has
    /// no tags.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>, ClientError> {
        let scope = pull_scope(repo);
        let mut url = self.endpoint(&format!("/v2/{repo}/tags/list"));
        url.query_pairs_mut().append_pair("n", PAGE_SIZE);

        let mut tags = Vec::new();
        loop {
            let response = self.send(&scope, || get(&url)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(tags);
            }
            let response = check(Method::GET, &url, response, &[StatusCode::OK]).await?;
            let next = next_link(response.headers(), &url);
            let page: TagsPage = json(response).await?;
            tags.extend(page.tags.unwrap_or_default());
            match next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(tags)
    }

    /// Whether a manifest exists, and its digest.
    pub async fn manifest_exists(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Option<ManifestHead>, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/manifests/{reference}"));
        let response = self
            .send(&pull_scope(repo), || {
                request(Method::HEAD, &url)
                    .header(header::ACCEPT, media::MANIFEST_TYPES.join(", "))
                    .body(empty())
                    .map_err(invalid)
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(Method::HEAD, &url, response, &[StatusCode::OK]).await?;

        let headers = response.headers();
        let media_type = header_str(headers, header::CONTENT_TYPE.as_str())
            .map(|value| media::essence(value).to_owned())
            .unwrap_or_default();
        match (digest_header(headers), content_length(headers)) {
            (Some(digest), Some(size)) => Ok(Some(ManifestHead {
                digest,
                media_type,
                size,
            })),
            _ => {
                // Some registries omit the digest on HEAD.
                let pulled = self.pull_manifest(repo, reference).await?;
                Ok(Some(ManifestHead {
                    digest: pulled.digest,
                    media_type: pulled.media_type,
                    size: pulled.bytes.len() as u64,
                }))
            }
        }
    }

    /// Download a manifest by tag or digest.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn pull_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<PulledManifest, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/manifests/{reference}"));
        let response = self
            .send(&pull_scope(repo), || {
                request(Method::GET, &url)
                    .header(header::ACCEPT, media::MANIFEST_TYPES.join(", "))
                    .body(empty())
                    .map_err(invalid)
            })
            .await?;
        let response = check(Method::GET, &url, response, &[StatusCode::OK]).await?;
        let (parts, body) = response.into_parts();
        let media_type = header_str(&parts.headers, header::CONTENT_TYPE.as_str())
            .map(|value| media::essence(value).to_owned())
            .unwrap_or_default();
        let bytes = collect(body).await?;

        let expected = reference
            .parse::<Digest>()
            .ok()
            .or_else(|| digest_header(&parts.headers));
        let digest = match expected {
            Some(expected) => {
                let mut hasher = Hasher::new(expected.algorithm());
                hasher.update(&bytes);
                let actual = hasher.finalize();
                if actual != expected {
                    return Err(ClientError::DigestMismatch {
                        expected,
                        actual,
                        partial: false,
                    });
                }
                actual
            }
            None => Digest::sha256(&bytes),
        };

        Ok(PulledManifest {
            digest,
            media_type,
            bytes,
        })
    }

    /// Upload a manifest under `reference` and return its digest.
    #[tracing::instrument(skip(self, bytes), fields(registry = %self.base))]
    pub async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<Digest, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/manifests/{reference}"));
        let response = self
            .send(&push_scope(repo), || {
                request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, media_type)
                    .body(full(bytes.clone()))
                    .map_err(invalid)
            })
            .await?;
        let response = check(
            Method::PUT,
            &url,
            response,
            &[StatusCode::CREATED, StatusCode::OK, StatusCode::ACCEPTED],
        )
        .await?;
        Ok(digest_header(response.headers()).unwrap_or_else(|| Digest::sha256(&bytes)))
    }

    /// Delete a manifest. A tag is resolved to its digest first, so every
    /// tag of that manifest goes with it. Returns false if nothing matched.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<bool, ClientError> {
        let digest = match reference.parse::<Digest>() {
            Ok(digest) => digest,
            Err(_) => match self.manifest_exists(repo, reference).await? {
                Some(head) => head.digest,
                None => return Ok(false),
            },
        };
        self.delete(&delete_scope(repo), &format!("/v2/{repo}/manifests/{digest}"))
            .await
    }

    /// Delete one tag, leaving the manifest in place. Needs a registry
    /// supporting tag deletion on the manifests endpoint.
    pub async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool, ClientError> {
        self.delete(&delete_scope(repo), &format!("/v2/{repo}/manifests/{tag}"))
            .await
    }

    async fn delete(&self, scope: &str, path: &str) -> Result<bool, ClientError> {
        let url = self.endpoint(path);
        let response = self
            .send(scope, || request(Method::DELETE, &url).body(empty()).map_err(invalid))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(
            Method::DELETE,
            &url,
            response,
            &[StatusCode::ACCEPTED, StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(true)
    }

    /// Size of a blob, if it exists.
    pub async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<Option<u64>, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/blobs/{digest}"));
        let response = self
            .send(&pull_scope(repo), || {
                request(Method::HEAD, &url).body(empty()).map_err(invalid)
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(Method::HEAD, &url, response, &[StatusCode::OK]).await?;
        Ok(Some(content_length(response.headers()).unwrap_or_default()))
    }

    /// Start downloading a blob.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<PulledBlob, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/blobs/{digest}"));
        let response = self
            .send(&pull_scope(repo), || get(&url))
            .await?;
        let response = check(Method::GET, &url, response, &[StatusCode::OK]).await?;
        let size = content_length(response.headers());
        let body = verified(response.into_body(), digest.clone(), size);
        Ok(PulledBlob { size, body })
    }

    /// Ask the registry to link a blob of `from` into `repo` without
    /// uploading it. Returns false when the registry declined.
    #[tracing::instrument(skip(self), fields(registry = %self.base))]
    pub async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<bool, ClientError> {
        let scope = format!("{} {}", push_scope(repo), pull_scope(from));
        let mut url = self.endpoint(&format!("/v2/{repo}/blobs/uploads/"));
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from);

        let response = self
            .send(&scope, || request(Method::POST, &url).body(empty()).map_err(invalid))
            .await?;
        let response = check(
            Method::POST,
            &url,
            response,
            &[StatusCode::CREATED, StatusCode::ACCEPTED],
        )
        .await?;
        if response.status() == StatusCode::CREATED {
            return Ok(true);
        }

        // The registry opened a regular upload instead.
        let location = location(&url, response.headers())?;
        let cancel = self
            .send(&push_scope(repo), || {
                request(Method::DELETE, &location).body(empty()).map_err(invalid)
            })
            .await;
        if let Err(err) = cancel {
            tracing::debug!(error = %err, "Failed to cancel declined mount upload");
        }
        Ok(false)
    }

    /// Open an upload session and return its location.
    pub async fn start_upload(&self, repo: &str) -> Result<Url, ClientError> {
        let url = self.endpoint(&format!("/v2/{repo}/blobs/uploads/"));
        let response = self
            .send(&push_scope(repo), || {
                request(Method::POST, &url).body(empty()).map_err(invalid)
            })
            .await?;
        let response = check(Method::POST, &url, response, &[StatusCode::ACCEPTED]).await?;
        location(&url, response.headers())
    }

    /// Upload a blob in one request.
    #[tracing::instrument(skip(self, body), fields(registry = %self.base))]
    pub async fn push_blob(
        &self,
        repo: &str,
        digest: &Digest,
        size: u64,
        body: Body,
    ) -> Result<(), ClientError> {
        let mut url = self.start_upload(repo).await?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());
        let put = request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, size)
            .body(body)
            .map_err(invalid)?;
        let response = self.send_once(&push_scope(repo), put).await?;
        check(Method::PUT, &url, response, &[StatusCode::CREATED]).await?;
        Ok(())
    }

    /// Upload a blob as a series of `PATCH` requests of at most
    /// `chunk_size` bytes each.
    #[tracing::instrument(skip(self, body), fields(registry = %self.base))]
    pub async fn push_blob_chunked(
        &self,
        repo: &str,
        digest: &Digest,
        body: Body,
        chunk_size: usize,
    ) -> Result<(), ClientError> {
        let scope = push_scope(repo);
        let chunk_size = chunk_size.max(1);
        let mut url = self.start_upload(repo).await?;
        let mut offset = 0u64;
        let mut buffer = BytesMut::new();
        let mut data = body.into_data_stream();

        loop {
            let next = data.next().await.transpose().map_err(ClientError::Transport)?;
            let finished = next.is_none();
            if let Some(bytes) = next {
                buffer.extend_from_slice(&bytes);
            }
            while buffer.len() >= chunk_size || (finished && !buffer.is_empty()) {
                let take = buffer.len().min(chunk_size);
                let chunk = buffer.split_to(take).freeze();
                url = self.patch(&scope, &url, offset, chunk).await?;
                offset += take as u64;
            }
            if finished {
                break;
            }
        }

        let mut put = url.clone();
        put.query_pairs_mut().append_pair("digest", &digest.to_string());
        let response = self
            .send(&scope, || {
                request(Method::PUT, &put)
                    .header(header::CONTENT_LENGTH, 0)
                    .body(empty())
                    .map_err(invalid)
            })
            .await?;
        check(Method::PUT, &put, response, &[StatusCode::CREATED]).await?;
        tracing::debug!(%digest, bytes = offset, "Uploaded blob in chunks");
        Ok(())
    }

    async fn patch(&self, scope: &str, url: &Url, offset: u64, chunk: Bytes) -> Result<Url, ClientError> {
        let end = offset + chunk.len() as u64 - 1;
        let response = self
            .send(scope, || {
                request(Method::PATCH, url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_RANGE, format!("{offset}-{end}"))
                    .header(header::CONTENT_LENGTH, chunk.len())
                    .body(full(chunk.clone()))
                    .map_err(invalid)
            })
            .await?;
        let response = check(Method::PATCH, url, response, &[StatusCode::ACCEPTED]).await?;
        location(url, response.headers())
    }

    /// `GET` a JSON document outside the Distribution API, such as a
    /// registry's management API.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.get_json_url(self.endpoint(path)).await
    }

    /// `GET` a JSON document at an absolute URL, such as the `next` link of
    /// a paginated API.
    pub async fn get_json_url<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let response = self.send("", || get(&url)).await?;
        let response = check(Method::GET, &url, response, &[StatusCode::OK]).await?;
        json(response).await
    }

    /// `POST` a JSON document and decode the JSON answer.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<T, ClientError> {
        let url = self.endpoint(path);
        let payload = Bytes::from(payload.to_string());
        let response = self
            .send("", || {
                request(Method::POST, &url)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(full(payload.clone()))
                    .map_err(invalid)
            })
            .await?;
        let response = check(
            Method::POST,
            &url,
            response,
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await?;
        json(response).await
    }

    /// Send a JSON request outside the Distribution API. Returns the status
    /// when it is one of `accept`.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
        accept: &[StatusCode],
    ) -> Result<StatusCode, ClientError> {
        let url = self.endpoint(path);
        let payload = payload.map(|value| Bytes::from(value.to_string()));
        let response = self
            .send("", || {
                let builder = request(method.clone(), &url);
                match &payload {
                    Some(bytes) => builder
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(full(bytes.clone())),
                    None => builder.body(empty()),
                }
                .map_err(invalid)
            })
            .await?;
        let response = check(method, &url, response, accept).await?;
        Ok(response.status())
    }
}

fn challenge_of(headers: &HeaderMap) -> Option<Challenge> {
    headers
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(Challenge::parse)
}

fn request(method: Method, url: &Url) -> http::request::Builder {
    http::Request::builder().method(method).uri(url.as_str())
}

fn get(url: &Url) -> Result<http::Request<Body>, ClientError> {
    request(Method::GET, url).body(empty()).map_err(invalid)
}

fn location(base: &Url, headers: &HeaderMap) -> Result<Url, ClientError> {
    let value = header_str(headers, header::LOCATION.as_str())
        .ok_or_else(|| ClientError::InvalidResponse("missing Location header".into()))?;
    base.join(value)
        .map_err(|err| ClientError::InvalidResponse(format!("invalid Location {value:?}: {err}")))
}

async fn check(
    method: Method,
    url: &Url,
    response: http::Response<Body>,
    ok: &[StatusCode],
) -> Result<http::Response<Body>, ClientError> {
    if ok.contains(&response.status()) {
        return Ok(response);
    }
    let (parts, body) = response.into_parts();
    // An unreadable error body still leaves the status to report.
    let body = collect(body).await.unwrap_or_default();
    Err(ClientError::Status(StatusError::new(
        method,
        url.as_str(),
        parts.status,
        &parts.headers,
        &body,
    )))
}

async fn json<T: DeserializeOwned>(response: http::Response<Body>) -> Result<T, ClientError> {
    let bytes = collect(response.into_body()).await?;
    serde_json::from_slice(&bytes).map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

struct Verify {
    inner: http_body_util::BodyDataStream<Body>,
    hasher: Option<Hasher>,
    expected: Digest,
    size: Option<u64>,
    seen: u64,
}

/// Wrap `body` so that it fails at its end unless it hashes to `expected`.
fn verified(body: Body, expected: Digest, size: Option<u64>) -> Body {
    let state = Verify {
        inner: body.into_data_stream(),
        hasher: Some(Hasher::new(expected.algorithm())),
        expected,
        size,
        seen: 0,
    };
    stream(futures::stream::unfold(state, |mut state| async move {
        state.hasher.as_ref()?;
        match state.inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(hasher) = state.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                state.seen += chunk.len() as u64;
                Some((Ok(chunk), state))
            }
            Some(Err(err)) => {
                state.hasher = None;
                Some((Err(err), state))
            }
            None => {
                let actual = state.hasher.take()?.finalize();
                if actual == state.expected {
                    return None;
                }
                let partial = state.size.is_some_and(|size| state.seen < size);
                let err: BoxError = Box::new(ClientError::DigestMismatch {
                    expected: state.expected.clone(),
                    actual,
                    partial,
                });
                Some((Err(err), state))
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mock::{MockResponse, MockTransport};

    fn client(mock: &MockTransport, credential: Option<(String, Secret)>) -> RegistryClient {
        RegistryClient::new(
            Url::parse("https://registry.test").unwrap(),
            Arc::new(mock.clone()),
            Authenticator::new(credential),
        )
    }

    fn challenge() -> MockResponse {
        MockResponse::new(StatusCode::UNAUTHORIZED).header(
            "www-authenticate",
            r#"Bearer realm="https://registry.test/service/token",service="harbor-registry""#,
        )
    }

    #[tokio::test]
    async fn catalog_follows_challenge_and_pages() {
        let mock = MockTransport::new();
        let tokens = Arc::new(AtomicUsize::new(0));
        let issued = tokens.clone();
        mock.on(Method::GET, "/service/token", move |request| {
            assert_eq!(request.query("scope").as_deref(), Some(CATALOG_SCOPE));
            issued.fetch_add(1, Ordering::SeqCst);
            MockResponse::ok().json(&serde_json::json!({"token": "t0k", "expires_in": 600}))
        });
        mock.on(Method::GET, "/v2/_catalog", |request| {
            if request.header("authorization") != Some("Bearer t0k") {
                return challenge();
            }
            match request.query("last").as_deref() {
                None => MockResponse::ok()
                    .header("link", r#"</v2/_catalog?last=library%2Fb&n=1000>; rel="next""#)
                    .json(&serde_json::json!({"repositories": ["library/a", "library/b"]})),
                Some("library/b") => {
                    MockResponse::ok().json(&serde_json::json!({"repositories": ["library/c"]}))
                }
                Some(other) => panic!("unexpected page {other}"),
            }
        });

        let client = client(&mock, Some(("admin".into(), Secret::new("pw"))));
        let repositories = client.catalog().await.unwrap();
        assert_eq!(repositories, vec!["library/a", "library/b", "library/c"]);
        assert_eq!(tokens.load(Ordering::SeqCst), 1);
        assert_eq!(mock.requests_to(&Method::GET, "/v2/_catalog").len(), 3);
    }

    #[tokio::test]
    async fn null_tags_are_empty() {
        let mock = MockTransport::new();
        mock.respond(
            Method::GET,
            "/v2/library/empty/tags/list",
            MockResponse::ok().json(&serde_json::json!({"name": "library/empty", "tags": null})),
        );
        let tags = client(&mock, None).list_tags("library/empty").await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn pulled_manifest_must_match_digest() {
        let mock = MockTransport::new();
        let expected = Digest::sha256(b"{\"schemaVersion\":2}");
        mock.respond(
            Method::GET,
            &format!("/v2/a/b/manifests/{expected}"),
            MockResponse::ok()
                .header("content-type", media::OCI_MANIFEST)
                .body("{\"schemaVersion\":3}"),
        );
        let err = client(&mock, None)
            .pull_manifest("a/b", &expected.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DigestMismatch { partial: false, .. }));
    }

    #[tokio::test]
    async fn pulled_blob_is_verified_at_the_end() {
        let mock = MockTransport::new();
        let digest = Digest::sha256(b"layer");
        mock.respond(
            Method::GET,
            &format!("/v2/a/b/blobs/{digest}"),
            MockResponse::ok().body("tampered"),
        );
        let blob = client(&mock, None).pull_blob("a/b", &digest).await.unwrap();
        assert!(collect(blob.body).await.is_err());

        let mock = MockTransport::new();
        mock.respond(
            Method::GET,
            &format!("/v2/a/b/blobs/{digest}"),
            MockResponse::ok().body("layer"),
        );
        let blob = client(&mock, None).pull_blob("a/b", &digest).await.unwrap();
        assert_eq!(collect(blob.body).await.unwrap(), Bytes::from_static(b"layer"));
    }

    #[tokio::test]
    async fn declined_mount_cancels_the_upload() {
        let mock = MockTransport::new();
        mock.respond(
            Method::POST,
            "/v2/dst/app/blobs/uploads/",
            MockResponse::new(StatusCode::ACCEPTED)
                .header("location", "/v2/dst/app/blobs/uploads/u-1"),
        );
        mock.respond(
            Method::DELETE,
            "/v2/dst/app/blobs/uploads/u-1",
            MockResponse::new(StatusCode::NO_CONTENT),
        );

        let digest = Digest::sha256(b"shared");
        let mounted = client(&mock, None)
            .mount_blob("dst/app", &digest, "src/app")
            .await
            .unwrap();
        assert!(!mounted);

        let post = &mock.requests_to(&Method::POST, "/v2/dst/app/blobs/uploads/")[0];
        assert_eq!(post.query("from").as_deref(), Some("src/app"));
        assert_eq!(post.query("mount"), Some(digest.to_string()));
        assert_eq!(
            mock.requests_to(&Method::DELETE, "/v2/dst/app/blobs/uploads/u-1").len(),
            1
        );
    }

    #[tokio::test]
    async fn chunked_push_sends_ranges() {
        let mock = MockTransport::new();
        mock.respond(
            Method::POST,
            "/v2/a/b/blobs/uploads/",
            MockResponse::new(StatusCode::ACCEPTED).header("location", "/v2/a/b/blobs/uploads/s1"),
        );
        mock.respond(
            Method::PATCH,
            "/v2/a/b/blobs/uploads/s1",
            MockResponse::new(StatusCode::ACCEPTED).header("location", "/v2/a/b/blobs/uploads/s1"),
        );
        mock.respond(
            Method::PUT,
            "/v2/a/b/blobs/uploads/s1",
            MockResponse::new(StatusCode::CREATED),
        );

        let content = b"0123456789";
        let digest = Digest::sha256(content);
        client(&mock, None)
            .push_blob_chunked("a/b", &digest, full(Bytes::from_static(content)), 4)
            .await
            .unwrap();

        let patches = mock.requests_to(&Method::PATCH, "/v2/a/b/blobs/uploads/s1");
        let ranges: Vec<_> = patches
            .iter()
            .map(|request| request.header("content-range").unwrap().to_owned())
            .collect();
        assert_eq!(ranges, vec!["0-3", "4-7", "8-9"]);
        let body: Vec<u8> = patches.iter().flat_map(|r| r.body.to_vec()).collect();
        assert_eq!(body, content);

        let put = &mock.requests_to(&Method::PUT, "/v2/a/b/blobs/uploads/s1")[0];
        assert_eq!(put.query("digest"), Some(digest.to_string()));
    }

    #[tokio::test]
    async fn manifest_head_reports_digest() {
        let mock = MockTransport::new();
        let digest = Digest::sha256(b"m");
        mock.respond(
            Method::HEAD,
            "/v2/a/b/manifests/latest",
            MockResponse::ok()
                .header("content-type", media::DOCKER_MANIFEST)
                .header("docker-content-digest", digest.to_string())
                .header("content-length", "1"),
        );
        let client = client(&mock, None);
        let head = client.manifest_exists("a/b", "latest").await.unwrap().unwrap();
        assert_eq!(head.digest, digest);
        assert_eq!(head.media_type, media::DOCKER_MANIFEST);
        assert!(client.manifest_exists("a/b", "missing").await.unwrap().is_none());
    }
}
