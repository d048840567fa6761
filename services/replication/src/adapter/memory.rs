//! An in-process registry, for tests and local development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use harbor_core::manifest::ParsedManifest;
use harbor_core::model::{FilterKind, RegistryEndpoint, ReplicationFilter, ResourceType};
use harbor_core::{media, Digest, Error, Result};
use parking_lot::Mutex;
use registry_client::{collect, full, Body, ManifestHead, PulledBlob, PulledManifest};
use serde_json::json;

use super::{Adapter, AdapterInfo, Health, Resource};
use crate::filter::Filters;

#[derive(Debug, Clone)]
struct StoredManifest {
    media_type: String,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct Repository {
    manifests: HashMap<Digest, StoredManifest>,
    tags: BTreeMap<String, Digest>,
    blobs: HashSet<Digest>,
}

#[derive(Debug, Default)]
struct State {
    repositories: BTreeMap<String, Repository>,
    blobs: HashMap<Digest, Bytes>,
    log: Vec<String>,
}

/// A registry held in memory.
///
/// Blob pushes can be made to fail and every call can be slowed down, so
/// tests can exercise retries and cancellation. Each mutating call is
/// recorded in [`MemoryAdapter::operations`].
#[derive(Debug)]
pub struct MemoryAdapter {
    endpoint: RegistryEndpoint,
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
    failing_blob_pushes: AtomicU32,
    mounts: bool,
}

impl MemoryAdapter {
    /// An empty registry named `name`.
    pub fn new(name: &str) -> Self {
        MemoryAdapter {
            endpoint: RegistryEndpoint {
                id: 0,
                name: name.to_owned(),
                registry_type: "memory".into(),
                url: format!("memory://{name}"),
                credential: None,
                insecure: false,
            },
            state: Mutex::new(State::default()),
            latency: Mutex::new(None),
            failing_blob_pushes: AtomicU32::new(0),
            mounts: true,
        }
    }

    /// Use `endpoint` as this registry's identity.
    pub fn with_endpoint(mut self, endpoint: RegistryEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Decline every mount request.
    pub fn without_mounts(mut self) -> Self {
        self.mounts = false;
        self
    }

    /// Sleep this long in every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next `count` blob pushes with a retryable error.
    pub fn fail_blob_pushes(&self, count: u32) {
        self.failing_blob_pushes.store(count, Ordering::SeqCst);
    }

    /// Store a blob in `repo`.
    pub fn put_blob(&self, repo: &str, bytes: impl Into<Bytes>) -> Digest {
        let bytes = bytes.into();
        let digest = Digest::sha256(&bytes);
        let mut state = self.state.lock();
        state.blobs.insert(digest.clone(), bytes);
        state
            .repositories
            .entry(repo.to_owned())
            .or_default()
            .blobs
            .insert(digest.clone());
        digest
    }

    /// Store a manifest without checking its references, tagging it when
    /// `tag` is given.
    pub fn put_manifest(&self, repo: &str, tag: Option<&str>, media_type: &str, bytes: impl Into<Bytes>) -> Digest {
        let bytes = bytes.into();
        let digest = Digest::sha256(&bytes);
        let mut state = self.state.lock();
        let repository = state.repositories.entry(repo.to_owned()).or_default();
        repository.manifests.insert(
            digest.clone(),
            StoredManifest {
                media_type: media_type.to_owned(),
                bytes,
            },
        );
        if let Some(tag) = tag {
            repository.tags.insert(tag.to_owned(), digest.clone());
        }
        digest
    }

    /// Store an OCI image made of `layers`, tagged `tag`. The same layers
    /// always give the same manifest digest.
    pub fn put_image(&self, repo: &str, tag: &str, layers: &[&[u8]]) -> Digest {
        let diff_ids: Vec<String> = layers.iter().map(|l| Digest::sha256(l).to_string()).collect();
        let config = json!({"rootfs": {"type": "layers", "diff_ids": diff_ids}}).to_string();
        let config_digest = self.put_blob(repo, config.clone().into_bytes());
        let layers: Vec<_> = layers
            .iter()
            .map(|layer| {
                let digest = self.put_blob(repo, layer.to_vec());
                json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest.to_string(),
                    "size": layer.len(),
                })
            })
            .collect();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_MANIFEST,
            "config": {
                "mediaType": media::OCI_CONFIG,
                "digest": config_digest.to_string(),
                "size": config.len(),
            },
            "layers": layers,
        });
        self.put_manifest(repo, Some(tag), media::OCI_MANIFEST, manifest.to_string())
    }

    /// Tags of `repo` with their digests.
    pub fn tags(&self, repo: &str) -> BTreeMap<String, Digest> {
        self.state
            .lock()
            .repositories
            .get(repo)
            .map(|r| r.tags.clone())
            .unwrap_or_default()
    }

    /// Whether `repo` holds a manifest with `digest`.
    pub fn has_manifest(&self, repo: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .repositories
            .get(repo)
            .is_some_and(|r| r.manifests.contains_key(digest))
    }

    /// Whether `repo` links the blob `digest`.
    pub fn has_blob(&self, repo: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .repositories
            .get(repo)
            .is_some_and(|r| r.blobs.contains(digest))
    }

    /// Every mutating call so far, as `operation repo reference`.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn resolve(repository: &Repository, reference: &str) -> Option<Digest> {
        match reference.parse::<Digest>() {
            Ok(digest) => repository.manifests.contains_key(&digest).then_some(digest),
            Err(_) => repository.tags.get(reference).cloned(),
        }
    }
}

fn manifest_unknown(repo: &str, reference: &str) -> Error {
    Error::not_found(format!("manifest {repo}:{reference} not found")).with_code("MANIFEST_UNKNOWN")
}

#[async_trait]
impl Adapter for MemoryAdapter {
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
        Ok(Health::Healthy)
    }

    async fn prepare_for_push(&self, _resources: &[Resource]) -> Result<()> {
        Ok(())
    }

    async fn list_resources(&self, filters: &[ReplicationFilter]) -> Result<Vec<Resource>> {
        let compiled = Filters::new(filters)?;
        self.delay().await;
        let state = self.state.lock();
        let mut resources = Vec::new();
        for (name, repository) in &state.repositories {
            let mut by_digest: BTreeMap<&Digest, Vec<String>> = BTreeMap::new();
            for (tag, digest) in &repository.tags {
                by_digest.entry(digest).or_default().push(tag.clone());
            }
            for (digest, tags) in by_digest {
                resources.push(Resource {
                    resource_type: ResourceType::Image,
                    repository: name.clone(),
                    digest: Some(digest.clone()),
                    tags,
                    labels: Vec::new(),
                    deleted: false,
                    delete_tag: false,
                });
            }
        }
        Ok(compiled.apply(resources))
    }

    async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<Option<ManifestHead>> {
        self.delay().await;
        let state = self.state.lock();
        let Some(repository) = state.repositories.get(repo) else {
            return Ok(None);
        };
        Ok(Self::resolve(repository, reference).map(|digest| {
            let stored = &repository.manifests[&digest];
            ManifestHead {
                media_type: stored.media_type.clone(),
                size: stored.bytes.len() as u64,
                digest,
            }
        }))
    }

    async fn pull_manifest(&self, repo: &str, reference: &str) -> Result<PulledManifest> {
        self.delay().await;
        let state = self.state.lock();
        let repository = state
            .repositories
            .get(repo)
            .ok_or_else(|| manifest_unknown(repo, reference))?;
        let digest = Self::resolve(repository, reference).ok_or_else(|| manifest_unknown(repo, reference))?;
        let stored = repository.manifests[&digest].clone();
        Ok(PulledManifest {
            digest,
            media_type: stored.media_type,
            bytes: stored.bytes,
        })
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Bytes,
    ) -> Result<Digest> {
        self.delay().await;
        let parsed = ParsedManifest::parse(&bytes, Some(media_type))?;
        let digest = Digest::sha256(&bytes);
        let mut state = self.state.lock();
        let repository = state.repositories.entry(repo.to_owned()).or_default();

        if let Some(missing) = parsed.blobs().into_iter().find(|d| !repository.blobs.contains(&d.digest)) {
            return Err(Error::invalid(format!("blob {} unknown to {repo}", missing.digest))
                .with_code("MANIFEST_BLOB_UNKNOWN"));
        }
        if let Some(missing) = parsed
            .manifests
            .iter()
            .find(|d| !repository.manifests.contains_key(&d.digest))
        {
            return Err(Error::invalid(format!("manifest {} unknown to {repo}", missing.digest))
                .with_code("MANIFEST_UNKNOWN"));
        }

        repository.manifests.insert(
            digest.clone(),
            StoredManifest {
                media_type: media_type.to_owned(),
                bytes,
            },
        );
        if reference.parse::<Digest>().is_err() {
            repository.tags.insert(reference.to_owned(), digest.clone());
        }
        state.log.push(format!("push_manifest {repo} {reference}"));
        Ok(digest)
    }

    async fn blob_exists(&self, repo: &str, digest: &Digest) -> Result<Option<u64>> {
        self.delay().await;
        let state = self.state.lock();
        let linked = state
            .repositories
            .get(repo)
            .is_some_and(|r| r.blobs.contains(digest));
        Ok(linked
            .then(|| state.blobs.get(digest).map(|b| b.len() as u64))
            .flatten())
    }

    async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<PulledBlob> {
        self.delay().await;
        let state = self.state.lock();
        let bytes = state
            .repositories
            .get(repo)
            .filter(|r| r.blobs.contains(digest))
            .and_then(|_| state.blobs.get(digest).cloned())
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")).with_code("BLOB_UNKNOWN"))?;
        Ok(PulledBlob {
            size: Some(bytes.len() as u64),
            body: full(bytes),
        })
    }

    async fn push_blob(
        &self,
        repo: &str,
        digest: &Digest,
        _size: Option<u64>,
        body: Body,
        _chunk_size: Option<usize>,
    ) -> Result<()> {
        self.delay().await;
        let bytes = collect(body).await?;
        let failing = self
            .failing_blob_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::retryable("injected blob upload failure", None));
        }
        if !digest.verify(&bytes) {
            return Err(Error::invalid(format!("blob content does not match {digest}"))
                .with_code("DIGEST_INVALID"));
        }
        let mut state = self.state.lock();
        state.blobs.insert(digest.clone(), bytes);
        state
            .repositories
            .entry(repo.to_owned())
            .or_default()
            .blobs
            .insert(digest.clone());
        state.log.push(format!("push_blob {repo} {digest}"));
        Ok(())
    }

    async fn mount_blob(&self, repo: &str, digest: &Digest, from: &str) -> Result<bool> {
        self.delay().await;
        let mut state = self.state.lock();
        let available = self.mounts
            && state
                .repositories
                .get(from)
                .is_some_and(|r| r.blobs.contains(digest));
        if !available {
            return Ok(false);
        }
        state
            .repositories
            .entry(repo.to_owned())
            .or_default()
            .blobs
            .insert(digest.clone());
        state.log.push(format!("mount_blob {repo} {digest} {from}"));
        Ok(true)
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<bool> {
        self.delay().await;
        let mut state = self.state.lock();
        let Some(repository) = state.repositories.get_mut(repo) else {
            return Ok(false);
        };
        let Some(digest) = Self::resolve(repository, reference) else {
            return Ok(false);
        };
        repository.manifests.remove(&digest);
        repository.tags.retain(|_, d| *d != digest);
        state.log.push(format!("delete_manifest {repo} {reference}"));
        Ok(true)
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<bool> {
        self.delay().await;
        let mut state = self.state.lock();
        let removed = state
            .repositories
            .get_mut(repo)
            .and_then(|r| r.tags.remove(tag))
            .is_some();
        if removed {
            state.log.push(format!("delete_tag {repo} {tag}"));
        }
        Ok(removed)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        self.delay().await;
        Ok(self.tags(repo).into_keys().collect())
    }
}
