//! Decoding manifests into the references the artifact graph cares about.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::media;
use crate::model::Platform;

/// A content descriptor as found in manifests and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size of the referenced content in bytes.
    pub size: u64,
    /// Platform of an index child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Artifact type, for referrers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Alternate download locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    /// Foreign and non-distributable layers are not stored by registries.
    pub fn is_foreign(&self) -> bool {
        self.media_type == media::DOCKER_FOREIGN_LAYER
            || self.media_type == media::OCI_NONDISTRIBUTABLE_LAYER
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u32>,
    media_type: Option<String>,
    artifact_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    subject: Option<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// The parts of a manifest or index that form artifact graph edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    /// Resolved manifest media type.
    pub media_type: String,
    /// `artifactType`, if set.
    pub artifact_type: Option<String>,
    /// Config blob, for image manifests.
    pub config: Option<Descriptor>,
    /// Layer blobs, for image manifests.
    pub layers: Vec<Descriptor>,
    /// Child manifests, for indexes.
    pub manifests: Vec<Descriptor>,
    /// OCI 1.1 subject.
    pub subject: Option<Descriptor>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
}

impl ParsedManifest {
    /// Decode `bytes`. `content_type` is the declared media type; when it is
    /// absent or generic the type is detected from the document.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(bytes).map_err(|err| {
            Error::invalid("manifest is not a valid JSON document")
                .with_code("MANIFEST_INVALID")
                .with_source(err)
        })?;

        let declared = content_type
            .map(media::essence)
            .filter(|ct| media::is_manifest_type(ct));
        let media_type = match (declared, raw.media_type.as_deref()) {
            (Some(declared), Some(embedded)) if declared != embedded => {
                return Err(Error::invalid(format!(
                    "manifest media type {embedded} does not match content type {declared}"
                ))
                .with_code("MANIFEST_INVALID"));
            }
            (Some(declared), _) => declared.to_owned(),
            (None, Some(embedded)) => embedded.to_owned(),
            (None, None) if raw.manifests.is_some() => media::OCI_INDEX.to_owned(),
            (None, None) => media::OCI_MANIFEST.to_owned(),
        };

        if !media::is_manifest_type(&media_type) {
            return Err(
                Error::invalid(format!("unsupported manifest media type {media_type}"))
                    .with_code("MANIFEST_INVALID"),
            );
        }
        if raw.schema_version != Some(2) {
            return Err(
                Error::invalid("only schemaVersion 2 manifests are supported")
                    .with_code("MANIFEST_INVALID"),
            );
        }

        let is_index = media::is_index_type(&media_type);
        if !is_index && raw.config.is_none() {
            return Err(Error::invalid("image manifest without config").with_code("MANIFEST_INVALID"));
        }

        Ok(ParsedManifest {
            media_type,
            artifact_type: raw.artifact_type,
            config: if is_index { None } else { raw.config },
            layers: if is_index { Vec::new() } else { raw.layers },
            manifests: if is_index {
                raw.manifests.unwrap_or_default()
            } else {
                Vec::new()
            },
            subject: raw.subject,
            annotations: raw.annotations,
        })
    }

    /// Whether this is a manifest list or index.
    pub fn is_index(&self) -> bool {
        media::is_index_type(&self.media_type)
    }

    /// Blobs the manifest needs in the repository: config and distributable
    /// layers, deduplicated, in manifest order.
    pub fn blobs(&self) -> Vec<&Descriptor> {
        let mut seen = std::collections::HashSet::new();
        self.config
            .iter()
            .chain(self.layers.iter().filter(|l| !l.is_foreign()))
            .filter(|d| seen.insert(&d.digest))
            .collect()
    }

    /// The type describing what this artifact is: `artifactType`, then the
    /// config media type.
    pub fn effective_type(&self) -> Option<&str> {
        self.artifact_type
            .as_deref()
            .or_else(|| self.config.as_ref().map(|c| c.media_type.as_str()))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn descriptor(media_type: &str, bytes: &[u8]) -> Descriptor {
        Descriptor {
            media_type: media_type.into(),
            digest: Digest::sha256(bytes),
            size: bytes.len() as u64,
            platform: None,
            artifact_type: None,
            annotations: BTreeMap::new(),
            urls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::descriptor;
    use super::*;

    fn image(config: &Descriptor, layers: &[Descriptor]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_MANIFEST,
            "config": config,
            "layers": layers,
        }))
        .unwrap()
    }

    #[test]
    fn image_manifest_blobs() {
        let config = descriptor(media::OCI_CONFIG, b"{}");
        let layer = descriptor("application/vnd.oci.image.layer.v1.tar+gzip", b"layer");
        let mut foreign = descriptor(media::DOCKER_FOREIGN_LAYER, b"windows");
        foreign.urls.push("https://example.com/layer".into());

        let bytes = image(&config, &[layer.clone(), layer.clone(), foreign]);
        let parsed = ParsedManifest::parse(&bytes, Some(media::OCI_MANIFEST)).unwrap();

        let blobs: Vec<_> = parsed.blobs().into_iter().map(|d| d.digest.clone()).collect();
        assert_eq!(blobs, vec![config.digest, layer.digest]);
        assert!(!parsed.is_index());
        assert_eq!(parsed.effective_type(), Some(media::OCI_CONFIG));
    }

    #[test]
    fn index_detected_without_media_type() {
        let child = descriptor(media::OCI_MANIFEST, b"child");
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [child],
        }))
        .unwrap();
        let parsed = ParsedManifest::parse(&bytes, None).unwrap();
        assert!(parsed.is_index());
        assert_eq!(parsed.manifests.len(), 1);
    }

    #[test]
    fn mismatched_content_type() {
        let config = descriptor(media::OCI_CONFIG, b"{}");
        let bytes = image(&config, &[]);
        let err = ParsedManifest::parse(&bytes, Some(media::DOCKER_MANIFEST)).unwrap_err();
        assert_eq!(err.code(), Some("MANIFEST_INVALID"));
    }

    #[test]
    fn garbage_is_invalid() {
        let err = ParsedManifest::parse(b"\x00\x01", Some(media::OCI_MANIFEST)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Invalid);
    }
}
