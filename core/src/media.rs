//! Well known media types.

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker image config.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// OCI image config.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI empty descriptor, used by artifacts without a config.
pub const OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";
/// Helm chart config.
pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
/// CNAB bundle config.
pub const CNAB_CONFIG: &str = "application/vnd.cnab.config.v1+json";
/// CNAB manifest config (legacy).
pub const CNAB_MANIFEST_CONFIG: &str = "application/vnd.cnab.manifest.v1";
/// WebAssembly module config.
pub const WASM_CONFIG: &str = "application/vnd.wasm.config.v1+json";

/// Docker foreign layer; never stored in or copied between registries.
pub const DOCKER_FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
/// OCI non-distributable layer.
pub const OCI_NONDISTRIBUTABLE_LAYER: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Cosign signature layer annotation carrying the base64 signature.
pub const COSIGN_SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

/// Config label naming a custom icon blob.
pub const ICON_LABEL: &str = "io.goharbor.artifact.icon";

/// Config label prefix attaching existing Harbor labels by name.
pub const LABEL_PREFIX: &str = "io.goharbor.artifact.label.";

/// Manifest media types accepted by the registry.
pub const MANIFEST_TYPES: &[&str] = &[DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX];

/// Whether `media_type` is an accepted manifest type.
pub fn is_manifest_type(media_type: &str) -> bool {
    MANIFEST_TYPES.contains(&media_type)
}

/// Whether `media_type` is a manifest list or image index.
pub fn is_index_type(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
}

/// Strip parameters from a `Content-Type` value.
pub fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}
