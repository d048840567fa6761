use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use harbor_core::digest::{Algorithm, Hasher};
use harbor_core::manifest::ParsedManifest;
use harbor_core::{media, Digest};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::driver::{BoxReader, Driver, Reader};
use crate::error::{StorageError, StorageErrorKind};
use crate::hash::HashingReader;
use crate::upload::{Committed, Sessions, UploadSession, UploadState};

type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Inclusive byte range of a blob read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, or the end of the blob.
    pub end: Option<u64>,
}

/// A blob opened for streaming.
pub struct BlobStream {
    /// Total blob size.
    pub size: u64,
    /// First byte returned.
    pub offset: u64,
    /// Number of bytes returned.
    pub length: u64,
    /// Contents.
    pub reader: BoxReader,
}

impl fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStream")
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A stored manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    /// Digest of `bytes`.
    pub digest: Digest,
    /// Media type it was pushed with.
    pub media_type: String,
    /// Exact bytes.
    pub bytes: Bytes,
}

/// One page of a tag listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagPage {
    /// Tags, lexically sorted.
    pub tags: Vec<String>,
    /// Last tag of this page when more remain.
    pub next: Option<String>,
}

/// Content-addressed storage of blobs, manifests and tags per repository.
///
/// Blob bytes are shared between repositories; a repository sees a blob only
/// once it has been linked there by an upload, a direct put or a mount.
#[async_trait::async_trait]
pub trait BlobBackend: fmt::Debug + Send + Sync {
    /// Store a blob after checking its bytes hash to `digest`. Writing bytes
    /// that are already stored succeeds.
    async fn put_blob(&self, repo: &str, digest: &Digest, reader: &mut Reader<'_>) -> Result<u64>;

    /// Open a blob linked in `repo`.
    async fn get_blob(
        &self,
        repo: &str,
        digest: &Digest,
        range: Option<ByteRange>,
    ) -> Result<BlobStream>;

    /// Size of a blob linked in `repo`.
    async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<u64>;

    /// Unlink a blob from `repo`. Fails with `InUse` while a manifest in the
    /// repository references it. Bytes are dropped once no repository links
    /// them.
    async fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()>;

    /// Link a blob present in `from` into `to`, returning its size.
    async fn mount_blob(&self, from: &str, to: &str, digest: &Digest) -> Result<u64>;

    /// Store a manifest. The media type must be a known manifest type and
    /// every referenced blob or child manifest must already be in `repo`.
    async fn put_manifest(
        &self,
        repo: &str,
        digest: &Digest,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<()>;

    /// Fetch a manifest.
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<StoredManifest>;

    /// Remove a manifest and every tag pointing at it.
    async fn delete_manifest(&self, repo: &str, digest: &Digest) -> Result<()>;

    /// Digests of every manifest in `repo`.
    async fn list_manifests(&self, repo: &str) -> Result<Vec<Digest>>;

    /// Point `tag` at a stored manifest.
    async fn tag(&self, repo: &str, tag: &str, digest: &Digest) -> Result<()>;

    /// Manifest digest a tag points at.
    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Digest>;

    /// Remove a tag.
    async fn untag(&self, repo: &str, tag: &str) -> Result<()>;

    /// Sorted tags after `last`, at most `n` of them.
    async fn list_tags(&self, repo: &str, last: Option<&str>, n: Option<usize>)
        -> Result<TagPage>;

    /// Unlink every blob of `repo` no manifest references, returning the
    /// unlinked digests with their sizes.
    async fn prune_blobs(&self, repo: &str) -> Result<Vec<(Digest, u64)>>;

    /// Open an upload session.
    async fn start_upload(&self, repo: &str) -> Result<UploadSession>;

    /// Current state of an upload session.
    async fn upload_status(&self, repo: &str, id: Uuid) -> Result<UploadSession>;

    /// Append a chunk. `start`, when given, must equal the current offset.
    async fn append_upload(
        &self,
        repo: &str,
        id: Uuid,
        start: Option<u64>,
        reader: &mut Reader<'_>,
    ) -> Result<UploadSession>;

    /// Append an optional final chunk, verify the digest and commit.
    /// Repeating a successful completion with the same digest succeeds.
    async fn complete_upload(
        &self,
        repo: &str,
        id: Uuid,
        digest: &Digest,
        tail: Option<&mut Reader<'_>>,
    ) -> Result<Committed>;

    /// Abort an upload session and discard its bytes.
    async fn cancel_upload(&self, repo: &str, id: Uuid) -> Result<()>;
}

fn fanout(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(digest.algorithm().to_string()).join(digest.hex())
}

fn blob_data(digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    Utf8PathBuf::from("blobs")
        .join(digest.algorithm().to_string())
        .join(&hex[..2])
        .join(hex)
        .join("data")
}

fn repository(repo: &str) -> Utf8PathBuf {
    Utf8PathBuf::from("repositories").join(repo)
}

fn layers(repo: &str) -> Utf8PathBuf {
    repository(repo).join("_layers")
}

fn layer_link(repo: &str, digest: &Digest) -> Utf8PathBuf {
    layers(repo).join(fanout(digest)).join("link")
}

fn revisions(repo: &str) -> Utf8PathBuf {
    repository(repo).join("_manifests").join("revisions")
}

fn revision_link(repo: &str, digest: &Digest) -> Utf8PathBuf {
    revisions(repo).join(fanout(digest)).join("link")
}

fn tags(repo: &str) -> Utf8PathBuf {
    repository(repo).join("_manifests").join("tags")
}

fn tag_link(repo: &str, tag: &str) -> Utf8PathBuf {
    tags(repo).join(tag).join("current").join("link")
}

fn upload_data(repo: &str, id: Uuid) -> Utf8PathBuf {
    repository(repo)
        .join("_uploads")
        .join(id.to_string())
        .join("data")
}

fn staging(id: Uuid) -> Utf8PathBuf {
    Utf8PathBuf::from("_staging").join(id.to_string())
}

/// Digests named by `<alg>/<hex>/link` entries under `prefix`.
fn linked_digests(prefix: &Utf8Path, listed: Vec<String>) -> Vec<Digest> {
    listed
        .iter()
        .filter_map(|path| {
            let rest = Utf8Path::new(path).strip_prefix(prefix).ok()?;
            let parts: Vec<&str> = rest.iter().collect();
            match parts.as_slice() {
                [alg, hex, "link"] => format!("{alg}:{hex}").parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// [`BlobBackend`] over any storage [`Driver`].
#[derive(Debug, Clone)]
pub struct BlobStore {
    driver: Arc<dyn Driver>,
    sessions: Arc<Sessions>,
}

impl BlobStore {
    /// A store writing through `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        BlobStore {
            driver,
            sessions: Arc::new(Sessions::default()),
        }
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn error(
        &self,
        kind: StorageErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> StorageError {
        StorageError::builder(self.driver.name(), kind, message.into())
            .code(code)
            .build()
    }

    fn blob_unknown(&self, digest: &Digest) -> StorageError {
        self.error(
            StorageErrorKind::NotFound,
            "BLOB_UNKNOWN",
            format!("blob {digest} unknown to registry"),
        )
    }

    fn manifest_unknown(&self, reference: impl fmt::Display) -> StorageError {
        self.error(
            StorageErrorKind::NotFound,
            "MANIFEST_UNKNOWN",
            format!("manifest {reference} unknown"),
        )
    }

    fn upload_unknown(&self, id: Uuid) -> StorageError {
        self.error(
            StorageErrorKind::NotFound,
            "BLOB_UPLOAD_UNKNOWN",
            format!("blob upload {id} unknown"),
        )
    }

    async fn link(&self, path: &Utf8Path, digest: &Digest) -> Result<()> {
        self.driver.write(path, digest.to_string().as_bytes()).await
    }

    async fn read_link(&self, path: &Utf8Path) -> Result<Option<String>> {
        match self.driver.read(path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim().to_owned())),
            Err(err) if err.kind() == StorageErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Move staged bytes into the shared blob area. Losing a race with
    /// another writer of the same digest is success.
    async fn commit_staged(&self, staged: &Utf8Path, digest: &Digest) -> Result<()> {
        match self.driver.rename(staged, &blob_data(digest)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == StorageErrorKind::AlreadyExists => {
                tracing::trace!(%digest, "Blob already stored");
                self.driver.delete(staged).await
            }
            Err(err) => Err(err),
        }
    }

    async fn discard(&self, path: &Utf8Path) {
        if let Err(err) = self.driver.delete(path).await {
            if err.kind() != StorageErrorKind::NotFound {
                tracing::warn!(%path, "Failed to discard object: {err}");
            }
        }
    }

    /// Drop blob bytes once no repository links them as a layer or manifest.
    async fn collect(&self, digest: &Digest) -> Result<()> {
        let layer = Utf8PathBuf::from("_layers").join(fanout(digest)).join("link");
        let revision = Utf8PathBuf::from("_manifests")
            .join("revisions")
            .join(fanout(digest))
            .join("link");
        let listed = self.driver.list(Utf8Path::new("repositories")).await?;
        let linked = listed
            .iter()
            .any(|path| path.ends_with(layer.as_str()) || path.ends_with(revision.as_str()));
        if !linked {
            tracing::debug!(%digest, "Dropping unreferenced blob");
            self.discard(&blob_data(digest)).await;
        }
        Ok(())
    }

    async fn referenced_blobs(&self, repo: &str) -> Result<BTreeSet<Digest>> {
        let mut referenced = BTreeSet::new();
        for digest in self.list_manifests(repo).await? {
            let manifest = self.get_manifest(repo, &digest).await?;
            match ParsedManifest::parse(&manifest.bytes, Some(&manifest.media_type)) {
                Ok(parsed) => {
                    referenced.extend(parsed.blobs().into_iter().map(|d| d.digest.clone()))
                }
                Err(err) => tracing::warn!(%digest, "Unreadable stored manifest: {err}"),
            }
        }
        Ok(referenced)
    }

    async fn repository_exists(&self, repo: &str) -> Result<bool> {
        Ok(!self.driver.list(&repository(repo)).await?.is_empty())
    }
}

#[async_trait::async_trait]
impl BlobBackend for BlobStore {
    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name()))]
    async fn put_blob(&self, repo: &str, digest: &Digest, reader: &mut Reader<'_>) -> Result<u64> {
        let staged = staging(Uuid::new_v4());
        let mut hashing = HashingReader::new(reader, digest.algorithm());
        if let Err(err) = self.driver.put(&staged, &mut hashing).await {
            self.discard(&staged).await;
            return Err(err);
        }

        let (actual, size) = hashing.finish();
        if &actual != digest {
            self.discard(&staged).await;
            return Err(self.error(
                StorageErrorKind::DigestMismatch,
                "DIGEST_INVALID",
                format!("content hashes to {actual}, not {digest}"),
            ));
        }

        self.commit_staged(&staged, digest).await?;
        self.link(&layer_link(repo, digest), digest).await?;
        Ok(size)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn get_blob(
        &self,
        repo: &str,
        digest: &Digest,
        range: Option<ByteRange>,
    ) -> Result<BlobStream> {
        let size = self.stat_blob(repo, digest).await?;
        let (offset, length) = match range {
            None => (0, size),
            Some(ByteRange { start, end }) => {
                let last = end.unwrap_or(size.saturating_sub(1));
                if start > last || last >= size {
                    return Err(self.error(
                        StorageErrorKind::InvalidRequest,
                        "BLOB_RANGE_INVALID",
                        format!("range {start}-{last} not satisfiable for {size} bytes"),
                    ));
                }
                (start, last - start + 1)
            }
        };
        let reader = self
            .driver
            .open(&blob_data(digest), offset, Some(length))
            .await?;
        Ok(BlobStream {
            size,
            offset,
            length,
            reader,
        })
    }

    async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<u64> {
        if !self.driver.exists(&layer_link(repo, digest)).await? {
            return Err(self.blob_unknown(digest));
        }
        match self.driver.metadata(&blob_data(digest)).await {
            Ok(meta) => Ok(meta.size),
            Err(err) if err.kind() == StorageErrorKind::NotFound => Err(self.blob_unknown(digest)),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()> {
        let link = layer_link(repo, digest);
        if !self.driver.exists(&link).await? {
            return Err(self.blob_unknown(digest));
        }
        if self.referenced_blobs(repo).await?.contains(digest) {
            return Err(self.error(
                StorageErrorKind::InUse,
                "BLOB_IN_USE",
                format!("blob {digest} is referenced by a manifest in {repo}"),
            ));
        }
        self.driver.delete(&link).await?;
        self.collect(digest).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn mount_blob(&self, from: &str, to: &str, digest: &Digest) -> Result<u64> {
        let size = self.stat_blob(from, digest).await?;
        self.link(&layer_link(to, digest), digest).await?;
        Ok(size)
    }

    #[tracing::instrument(skip(self, bytes), fields(driver = self.driver.name(), size = bytes.len()))]
    async fn put_manifest(
        &self,
        repo: &str,
        digest: &Digest,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<()> {
        let media_type = media::essence(media_type);
        if !media::is_manifest_type(media_type) {
            return Err(self.error(
                StorageErrorKind::InvalidRequest,
                "MANIFEST_INVALID",
                format!("unsupported manifest media type {media_type}"),
            ));
        }
        if !digest.verify(&bytes) {
            return Err(self.error(
                StorageErrorKind::DigestMismatch,
                "DIGEST_INVALID",
                format!("manifest does not hash to {digest}"),
            ));
        }

        let parsed = ParsedManifest::parse(&bytes, Some(media_type)).map_err(|err| {
            StorageError::builder(self.driver.name(), StorageErrorKind::InvalidRequest, err)
                .code("MANIFEST_INVALID")
                .build()
        })?;

        for blob in parsed.blobs() {
            if !self.driver.exists(&layer_link(repo, &blob.digest)).await? {
                return Err(self.error(
                    StorageErrorKind::InvalidRequest,
                    "MANIFEST_BLOB_UNKNOWN",
                    format!("blob {} unknown to {repo}", blob.digest),
                ));
            }
        }
        for child in &parsed.manifests {
            if !self.driver.exists(&revision_link(repo, &child.digest)).await? {
                return Err(self.error(
                    StorageErrorKind::InvalidRequest,
                    "MANIFEST_BLOB_UNKNOWN",
                    format!("manifest {} unknown to {repo}", child.digest),
                ));
            }
        }

        let staged = staging(Uuid::new_v4());
        self.driver.write(&staged, &bytes).await?;
        self.commit_staged(&staged, digest).await?;
        self.driver
            .write(&revision_link(repo, digest), media_type.as_bytes())
            .await
    }

    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<StoredManifest> {
        let media_type = self
            .read_link(&revision_link(repo, digest))
            .await?
            .ok_or_else(|| self.manifest_unknown(digest))?;
        let bytes = match self.driver.read(&blob_data(digest)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == StorageErrorKind::NotFound => {
                return Err(self.manifest_unknown(digest))
            }
            Err(err) => return Err(err),
        };
        Ok(StoredManifest {
            digest: digest.clone(),
            media_type,
            bytes: bytes.into(),
        })
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn delete_manifest(&self, repo: &str, digest: &Digest) -> Result<()> {
        let link = revision_link(repo, digest);
        if !self.driver.exists(&link).await? {
            return Err(self.manifest_unknown(digest));
        }

        let expected = digest.to_string();
        for tag in self.list_tags(repo, None, None).await?.tags {
            if self.read_link(&tag_link(repo, &tag)).await?.as_deref() == Some(expected.as_str()) {
                self.discard(&tag_link(repo, &tag)).await;
            }
        }

        self.driver.delete(&link).await?;
        self.collect(digest).await
    }

    async fn list_manifests(&self, repo: &str) -> Result<Vec<Digest>> {
        let prefix = revisions(repo);
        let listed = self.driver.list(&prefix).await?;
        Ok(linked_digests(&prefix, listed))
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn tag(&self, repo: &str, tag: &str, digest: &Digest) -> Result<()> {
        if !self.driver.exists(&revision_link(repo, digest)).await? {
            return Err(self.manifest_unknown(digest));
        }
        self.link(&tag_link(repo, tag), digest).await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Digest> {
        let link = self
            .read_link(&tag_link(repo, tag))
            .await?
            .ok_or_else(|| self.manifest_unknown(format!("{repo}:{tag}")))?;
        link.parse().map_err(|err| {
            StorageError::builder(self.driver.name(), StorageErrorKind::Other, err)
                .path(tag_link(repo, tag).as_str())
                .context("corrupt tag link")
                .build()
        })
    }

    async fn untag(&self, repo: &str, tag: &str) -> Result<()> {
        match self.driver.delete(&tag_link(repo, tag)).await {
            Err(err) if err.kind() == StorageErrorKind::NotFound => {
                Err(self.manifest_unknown(format!("{repo}:{tag}")))
            }
            other => other,
        }
    }

    async fn list_tags(
        &self,
        repo: &str,
        last: Option<&str>,
        n: Option<usize>,
    ) -> Result<TagPage> {
        let prefix = tags(repo);
        let listed = self.driver.list(&prefix).await?;
        let mut names: Vec<String> = listed
            .iter()
            .filter_map(|path| {
                let rest = Utf8Path::new(path).strip_prefix(&prefix).ok()?;
                let parts: Vec<&str> = rest.iter().collect();
                match parts.as_slice() {
                    [tag, "current", "link"] => Some((*tag).to_owned()),
                    _ => None,
                }
            })
            .collect();

        if names.is_empty() && !self.repository_exists(repo).await? {
            return Err(self.error(
                StorageErrorKind::NotFound,
                "NAME_UNKNOWN",
                format!("repository {repo} not known to registry"),
            ));
        }

        names.sort();
        names.dedup();
        if let Some(last) = last {
            names.retain(|name| name.as_str() > last);
        }

        let mut next = None;
        if let Some(n) = n {
            if names.len() > n {
                names.truncate(n);
                next = names.last().cloned();
            }
        }
        Ok(TagPage { tags: names, next })
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn prune_blobs(&self, repo: &str) -> Result<Vec<(Digest, u64)>> {
        let referenced = self.referenced_blobs(repo).await?;
        let prefix = layers(repo);
        let listed = self.driver.list(&prefix).await?;

        let mut pruned = Vec::new();
        for digest in linked_digests(&prefix, listed) {
            if referenced.contains(&digest) {
                continue;
            }
            let size = self
                .driver
                .metadata(&blob_data(&digest))
                .await
                .map(|m| m.size)
                .unwrap_or_default();
            self.driver.delete(&layer_link(repo, &digest)).await?;
            self.collect(&digest).await?;
            pruned.push((digest, size));
        }
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "Unlinked unreferenced blobs");
        }
        Ok(pruned)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    async fn start_upload(&self, repo: &str) -> Result<UploadSession> {
        let entry = self.sessions.open(repo);
        let mut guard = entry.lock().await;
        let path = upload_data(repo, guard.session.id);
        if let Err(err) = self.driver.write(&path, b"").await {
            guard.session.state = UploadState::Aborted;
            return Err(err);
        }
        guard.session.state = UploadState::Open;
        Ok(guard.session.clone())
    }

    async fn upload_status(&self, repo: &str, id: Uuid) -> Result<UploadSession> {
        let entry = self.sessions.get(&id).ok_or_else(|| self.upload_unknown(id))?;
        let guard = entry.lock().await;
        if guard.session.repository != repo || guard.session.state == UploadState::Aborted {
            return Err(self.upload_unknown(id));
        }
        Ok(guard.session.clone())
    }

    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name()))]
    async fn append_upload(
        &self,
        repo: &str,
        id: Uuid,
        start: Option<u64>,
        reader: &mut Reader<'_>,
    ) -> Result<UploadSession> {
        let entry = self.sessions.get(&id).ok_or_else(|| self.upload_unknown(id))?;
        let mut guard = entry.lock().await;
        if guard.session.repository != repo || guard.session.state != UploadState::Open {
            return Err(self.upload_unknown(id));
        }
        if let Some(start) = start {
            if start != guard.session.offset {
                return Err(self.error(
                    StorageErrorKind::InvalidRequest,
                    "BLOB_UPLOAD_INVALID",
                    format!(
                        "chunk starts at {start} but upload is at {}",
                        guard.session.offset
                    ),
                ));
            }
        }

        let path = upload_data(repo, id);
        let mut hashing =
            HashingReader::resume(reader, guard.hasher.clone(), guard.session.offset);
        if let Err(err) = self.driver.append(&path, &mut hashing).await {
            tracing::warn!(upload = %id, "Chunk append failed, aborting upload: {err}");
            guard.session.state = UploadState::Aborted;
            self.discard(&path).await;
            return Err(err);
        }
        let (hasher, offset) = hashing.into_state();
        guard.hasher = hasher;
        guard.session.offset = offset;
        Ok(guard.session.clone())
    }

    #[tracing::instrument(skip(self, tail), fields(driver = self.driver.name()))]
    async fn complete_upload(
        &self,
        repo: &str,
        id: Uuid,
        digest: &Digest,
        tail: Option<&mut Reader<'_>>,
    ) -> Result<Committed> {
        let entry = self.sessions.get(&id).ok_or_else(|| self.upload_unknown(id))?;
        let mut guard = entry.lock().await;
        if guard.session.repository != repo {
            return Err(self.upload_unknown(id));
        }
        match guard.session.state {
            UploadState::Committed if guard.session.digest.as_ref() == Some(digest) => {
                return Ok(Committed {
                    digest: digest.clone(),
                    size: guard.session.offset,
                    fresh: false,
                });
            }
            UploadState::Open => {}
            _ => return Err(self.upload_unknown(id)),
        }

        guard.session.state = UploadState::Closing;
        let path = upload_data(repo, id);

        if let Some(tail) = tail {
            let mut hashing =
                HashingReader::resume(tail, guard.hasher.clone(), guard.session.offset);
            if let Err(err) = self.driver.append(&path, &mut hashing).await {
                guard.session.state = UploadState::Aborted;
                self.discard(&path).await;
                return Err(err);
            }
            let (hasher, offset) = hashing.into_state();
            guard.hasher = hasher;
            guard.session.offset = offset;
        }

        let actual = match digest.algorithm() {
            Algorithm::Sha256 => guard.hasher.clone().finalize(),
            algorithm => {
                let mut reader = self.driver.open(&path, 0, None).await?;
                let mut hasher = Hasher::new(algorithm);
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = reader
                        .read(&mut buf)
                        .await
                        .map_err(|err| StorageError::io(self.driver.name(), path.as_str(), err))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hasher.finalize()
            }
        };

        if &actual != digest {
            guard.session.state = UploadState::Aborted;
            self.discard(&path).await;
            return Err(self.error(
                StorageErrorKind::DigestMismatch,
                "DIGEST_INVALID",
                format!("upload hashes to {actual}, not {digest}"),
            ));
        }

        if let Err(err) = self.commit_staged(&path, digest).await {
            guard.session.state = UploadState::Aborted;
            return Err(err);
        }
        self.link(&layer_link(repo, digest), digest).await?;

        guard.session.state = UploadState::Committed;
        guard.session.digest = Some(digest.clone());
        tracing::debug!(upload = %id, %digest, size = guard.session.offset, "Upload committed");
        Ok(Committed {
            digest: digest.clone(),
            size: guard.session.offset,
            fresh: true,
        })
    }

    async fn cancel_upload(&self, repo: &str, id: Uuid) -> Result<()> {
        let entry = self.sessions.get(&id).ok_or_else(|| self.upload_unknown(id))?;
        let mut guard = entry.lock().await;
        if guard.session.repository != repo || guard.session.state != UploadState::Open {
            return Err(self.upload_unknown(id));
        }
        guard.session.state = UploadState::Aborted;
        self.discard(&upload_data(repo, id)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::MemoryDriver;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(MemoryDriver::new()))
    }

    async fn push_blob(store: &BlobStore, repo: &str, bytes: &[u8]) -> Digest {
        let digest = Digest::sha256(bytes);
        let mut reader = bytes;
        store.put_blob(repo, &digest, &mut reader).await.unwrap();
        digest
    }

    fn image_manifest(config: &Digest, layer: &Digest) -> Bytes {
        let doc = json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_MANIFEST,
            "config": {"mediaType": media::OCI_CONFIG, "digest": config.to_string(), "size": 2},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": layer.to_string(), "size": 5}
            ]
        });
        Bytes::from(serde_json::to_vec(&doc).unwrap())
    }

    async fn push_image(store: &BlobStore, repo: &str, tag: &str) -> (Digest, Digest) {
        let config = push_blob(store, repo, b"{}").await;
        let layer = push_blob(store, repo, b"layer").await;
        let bytes = image_manifest(&config, &layer);
        let digest = Digest::sha256(&bytes);
        store
            .put_manifest(repo, &digest, media::OCI_MANIFEST, bytes)
            .await
            .unwrap();
        store.tag(repo, tag, &digest).await.unwrap();
        (digest, layer)
    }

    #[tokio::test]
    async fn put_blob_is_idempotent() {
        let store = store();
        let digest = push_blob(&store, "library/web", b"hello").await;
        push_blob(&store, "library/web", b"hello").await;
        assert_eq!(store.stat_blob("library/web", &digest).await.unwrap(), 5);

        let err = store.stat_blob("library/other", &digest).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
        assert_eq!(err.code(), Some("BLOB_UNKNOWN"));
    }

    #[tokio::test]
    async fn put_blob_verifies_digest() {
        let store = store();
        let claimed = Digest::sha256(b"something else");
        let mut reader: &[u8] = b"hello";
        let err = store
            .put_blob("library/web", &claimed, &mut reader)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::DigestMismatch);
        assert!(store.stat_blob("library/web", &claimed).await.is_err());
    }

    #[tokio::test]
    async fn ranged_reads() {
        let store = store();
        let digest = push_blob(&store, "library/web", b"0123456789").await;
        let mut stream = store
            .get_blob(
                "library/web",
                &digest,
                Some(ByteRange {
                    start: 3,
                    end: Some(5),
                }),
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"345");
        assert_eq!(stream.size, 10);

        let err = store
            .get_blob(
                "library/web",
                &digest,
                Some(ByteRange {
                    start: 10,
                    end: None,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("BLOB_RANGE_INVALID"));
    }

    #[tokio::test]
    async fn chunked_upload_lifecycle() {
        let store = store();
        let session = store.start_upload("library/web").await.unwrap();
        assert_eq!(session.state, UploadState::Open);

        let mut first: &[u8] = b"hello ";
        store
            .append_upload("library/web", session.id, Some(0), &mut first)
            .await
            .unwrap();

        let mut stale: &[u8] = b"x";
        let err = store
            .append_upload("library/web", session.id, Some(0), &mut stale)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("BLOB_UPLOAD_INVALID"));

        let digest = Digest::sha256(b"hello world");
        let mut tail: &[u8] = b"world";
        let committed = store
            .complete_upload("library/web", session.id, &digest, Some(&mut tail))
            .await
            .unwrap();
        assert!(committed.fresh);
        assert_eq!(committed.size, 11);

        let again = store
            .complete_upload("library/web", session.id, &digest, None)
            .await
            .unwrap();
        assert!(!again.fresh);
        assert_eq!(store.stat_blob("library/web", &digest).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn upload_digest_mismatch_aborts() {
        let store = store();
        let session = store.start_upload("library/web").await.unwrap();
        let mut body: &[u8] = b"hello";
        let wrong = Digest::sha256(b"nope");
        let err = store
            .complete_upload("library/web", session.id, &wrong, Some(&mut body))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::DigestMismatch);

        let err = store
            .upload_status("library/web", session.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("BLOB_UPLOAD_UNKNOWN"));
    }

    #[tokio::test]
    async fn cancelled_upload_is_gone() {
        let store = store();
        let session = store.start_upload("library/web").await.unwrap();
        store.cancel_upload("library/web", session.id).await.unwrap();
        assert!(store.cancel_upload("library/web", session.id).await.is_err());
        assert_eq!(store.sessions.len(), 1);
    }

    #[tokio::test]
    async fn manifests_require_their_blobs() {
        let store = store();
        let config = Digest::sha256(b"{}");
        let layer = Digest::sha256(b"layer");
        let bytes = image_manifest(&config, &layer);
        let digest = Digest::sha256(&bytes);
        let err = store
            .put_manifest("library/web", &digest, media::OCI_MANIFEST, bytes)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("MANIFEST_BLOB_UNKNOWN"));
    }

    #[tokio::test]
    async fn manifests_reject_unknown_media_types() {
        let store = store();
        let bytes = Bytes::from_static(b"{}");
        let digest = Digest::sha256(&bytes);
        let err = store
            .put_manifest("library/web", &digest, "text/plain", bytes)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("MANIFEST_INVALID"));
    }

    #[tokio::test]
    async fn blobs_in_use_cannot_be_deleted() {
        let store = store();
        let (digest, layer) = push_image(&store, "library/web", "v1").await;

        let err = store.delete_blob("library/web", &layer).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InUse);

        store.delete_manifest("library/web", &digest).await.unwrap();
        assert!(store.resolve_tag("library/web", "v1").await.is_err());

        let pruned = store.prune_blobs("library/web").await.unwrap();
        assert_eq!(pruned.len(), 2);
        assert!(store.stat_blob("library/web", &layer).await.is_err());
    }

    #[tokio::test]
    async fn shared_bytes_survive_other_repositories() {
        let store = store();
        let layer = push_blob(&store, "library/a", b"shared").await;
        store.mount_blob("library/a", "library/b", &layer).await.unwrap();

        store.delete_blob("library/a", &layer).await.unwrap();
        assert_eq!(store.stat_blob("library/b", &layer).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn tag_listing_paginates() {
        let store = store();
        for tag in ["c", "a", "b"] {
            push_image(&store, "library/web", tag).await;
        }

        let page = store.list_tags("library/web", None, Some(2)).await.unwrap();
        assert_eq!(page.tags, vec!["a", "b"]);
        assert_eq!(page.next.as_deref(), Some("b"));

        let page = store
            .list_tags("library/web", Some("b"), Some(2))
            .await
            .unwrap();
        assert_eq!(page.tags, vec!["c"]);
        assert_eq!(page.next, None);

        let err = store.list_tags("library/none", None, None).await.unwrap_err();
        assert_eq!(err.code(), Some("NAME_UNKNOWN"));
    }
}
