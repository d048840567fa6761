//! Artifact icons.
//!
//! Every artifact carries the digest of an icon: the one named by its
//! `io.goharbor.artifact.icon` config label, or the built-in icon of its
//! type. Icons are served as 50x50 PNGs; each digest is thumbnailed once
//! and concurrent requests for it share the work.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use blob_store::BlobBackend;
use bytes::Bytes;
use dashmap::DashMap;
use harbor_core::model::ArtifactType;
use harbor_core::store::Store;
use harbor_core::{Digest, Error, ErrorKind, Result};
use image::imageops::FilterType;
use image::ImageFormat;
use tokio::sync::OnceCell;

use super::read_small_blob;

/// Icon edge length, in pixels.
pub const ICON_SIZE: u32 = 50;

const IMAGE: &[u8] = include_bytes!("icons/image.png");
const CHART: &[u8] = include_bytes!("icons/chart.png");
const CNAB: &[u8] = include_bytes!("icons/cnab.png");
const WASM: &[u8] = include_bytes!("icons/wasm.png");
const DEFAULT: &[u8] = include_bytes!("icons/default.png");

/// A rendered icon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icon {
    /// Always `image/png`.
    pub content_type: &'static str,
    /// Encoded thumbnail.
    pub content: Bytes,
}

/// Resolves and thumbnails icons.
#[derive(Debug)]
pub struct IconService {
    store: Arc<dyn Store>,
    backend: Arc<dyn BlobBackend>,
    max_size: u64,
    builtin: HashMap<Digest, &'static [u8]>,
    by_type: HashMap<ArtifactType, Digest>,
    fallback: Digest,
    thumbnails: DashMap<Digest, Arc<OnceCell<Icon>>>,
    #[cfg(test)]
    renders: std::sync::atomic::AtomicUsize,
}

impl IconService {
    /// Icons read from `backend`; custom icons larger than `max_size` bytes
    /// are refused.
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn BlobBackend>, max_size: usize) -> Self {
        let mut builtin = HashMap::new();
        let mut by_type = HashMap::new();
        for (artifact_type, bytes) in [
            (ArtifactType::Image, IMAGE),
            (ArtifactType::Chart, CHART),
            (ArtifactType::Cnab, CNAB),
            (ArtifactType::Wasm, WASM),
            (ArtifactType::Unknown, DEFAULT),
        ] {
            let digest = Digest::sha256(bytes);
            builtin.insert(digest.clone(), bytes);
            by_type.insert(artifact_type, digest);
        }
        IconService {
            store,
            backend,
            max_size: max_size as u64,
            builtin,
            fallback: Digest::sha256(DEFAULT),
            by_type,
            thumbnails: DashMap::new(),
            #[cfg(test)]
            renders: Default::default(),
        }
    }

    /// Digest of the built-in icon for `artifact_type`.
    pub fn builtin_for(&self, artifact_type: ArtifactType) -> &Digest {
        self.by_type.get(&artifact_type).unwrap_or(&self.fallback)
    }

    /// The 50x50 PNG for `digest`.
    pub async fn get(&self, digest: &Digest) -> Result<Icon> {
        let cell = self
            .thumbnails
            .entry(digest.clone())
            .or_default()
            .clone();
        match cell.get_or_try_init(|| self.render(digest)).await {
            Ok(icon) => Ok(icon.clone()),
            Err(err) => {
                self.thumbnails
                    .remove_if(digest, |_, cell| !cell.initialized());
                Err(err)
            }
        }
    }

    async fn render(&self, digest: &Digest) -> Result<Icon> {
        #[cfg(test)]
        self.renders.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let raw = match self.builtin.get(digest) {
            Some(bytes) => Bytes::from_static(bytes),
            None => {
                let artifact = self
                    .store
                    .find_artifact_by_icon(digest)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("icon {digest} not found")))?;
                read_small_blob(
                    self.backend.as_ref(),
                    &artifact.repository_name,
                    digest,
                    self.max_size,
                )
                .await?
            }
        };
        tracing::debug!(%digest, size = raw.len(), "Rendering icon");
        let content = tokio::task::spawn_blocking(move || thumbnail(&raw))
            .await
            .map_err(Error::with(ErrorKind::Invalid, "icon could not be decoded"))??;
        Ok(Icon {
            content_type: "image/png",
            content,
        })
    }
}

fn thumbnail(raw: &[u8]) -> Result<Bytes> {
    let decoded = image::load_from_memory(raw)
        .map_err(Error::with(ErrorKind::Invalid, "icon is not a decodable image"))?;
    let resized = decoded.resize_exact(ICON_SIZE, ICON_SIZE, FilterType::Nearest);
    let mut out = Cursor::new(Vec::new());
    resized
        .write_to(&mut out, ImageFormat::Png)
        .map_err(Error::with(ErrorKind::Internal, "icon could not be encoded"))?;
    Ok(Bytes::from(out.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob_store::{BlobStore, MemoryDriver};
    use harbor_core::store::MemoryStore;

    fn service() -> IconService {
        IconService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BlobStore::new(Arc::new(MemoryDriver::new()))),
            1024 * 1024,
        )
    }

    #[tokio::test]
    async fn builtin_icons_are_thumbnailed() {
        let icons = service();
        let digest = icons.builtin_for(ArtifactType::Chart).clone();
        let icon = icons.get(&digest).await.unwrap();
        assert_eq!(icon.content_type, "image/png");

        let decoded = image::load_from_memory(&icon.content).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (ICON_SIZE, ICON_SIZE));
        assert_eq!(icons.get(&digest).await.unwrap(), icon);
    }

    #[tokio::test]
    async fn unknown_icons_are_not_found() {
        let icons = service();
        for n in 0..3u8 {
            let err = icons.get(&Digest::sha256(&[n])).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert!(icons.thumbnails.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_share_one_render() {
        let icons = Arc::new(service());
        let digest = icons.builtin_for(ArtifactType::Wasm).clone();
        let requests: Vec<_> = (0..8)
            .map(|_| {
                let icons = icons.clone();
                let digest = digest.clone();
                tokio::spawn(async move { icons.get(&digest).await })
            })
            .collect();

        let mut rendered = Vec::new();
        for request in requests {
            rendered.push(request.await.unwrap().unwrap());
        }
        assert!(rendered.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(icons.renders.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(icons.thumbnails.len(), 1);
    }

    #[test]
    fn types_have_distinct_icons() {
        let icons = service();
        assert_ne!(
            icons.builtin_for(ArtifactType::Image),
            icons.builtin_for(ArtifactType::Chart)
        );
    }
}
