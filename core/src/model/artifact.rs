use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, RepositoryId};
use crate::digest::Digest;
use crate::media;

/// Artifact identifier.
pub type ArtifactId = i64;

/// Label identifier.
pub type LabelId = i64;

/// Platform of an image, as found in index descriptors and image configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Operating system version.
    #[serde(
        default,
        rename = "os.version",
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
}

/// What an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// Container image or image index.
    Image,
    /// Helm chart.
    Chart,
    /// CNAB bundle.
    Cnab,
    /// WebAssembly module.
    Wasm,
    /// Anything else.
    Unknown,
}

impl ArtifactType {
    /// Resolve from a manifest media type and its effective type (artifact
    /// type or config media type).
    pub fn resolve(manifest_media_type: &str, effective: Option<&str>) -> Self {
        match effective {
            Some(media::HELM_CONFIG) => ArtifactType::Chart,
            Some(media::CNAB_CONFIG) | Some(media::CNAB_MANIFEST_CONFIG) => ArtifactType::Cnab,
            Some(media::WASM_CONFIG) => ArtifactType::Wasm,
            Some(media::OCI_CONFIG) | Some(media::DOCKER_CONFIG) => ArtifactType::Image,
            None if media::is_index_type(manifest_media_type) => ArtifactType::Image,
            _ => ArtifactType::Unknown,
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactType::Image => "IMAGE",
            ArtifactType::Chart => "CHART",
            ArtifactType::Cnab => "CNAB",
            ArtifactType::Wasm => "WASM",
            ArtifactType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A manifest-addressable object in a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Identifier.
    pub id: ArtifactId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Owning repository.
    pub repository_id: RepositoryId,
    /// Repository path.
    pub repository_name: String,
    /// Manifest digest.
    pub digest: Digest,
    /// Manifest media type.
    pub manifest_media_type: String,
    /// Config media type or artifact type.
    pub media_type: String,
    /// Resolved kind.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Manifest size plus referenced blob sizes.
    pub size: u64,
    /// Icon digest.
    pub icon: Option<String>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
    /// Decoded config labels and other type specific attributes.
    pub extra_attrs: serde_json::Value,
    /// First push.
    pub push_time: DateTime<Utc>,
    /// Most recent pull.
    pub pull_time: Option<DateTime<Utc>>,
    /// Number of pulls.
    pub pull_count: u64,
}

/// Fields needed to insert an artifact row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    /// Owning project.
    pub project_id: ProjectId,
    /// Owning repository.
    pub repository_id: RepositoryId,
    /// Repository path.
    pub repository_name: String,
    /// Manifest digest.
    pub digest: Digest,
    /// Manifest media type.
    pub manifest_media_type: String,
    /// Config media type or artifact type.
    pub media_type: String,
    /// Resolved kind.
    pub artifact_type: ArtifactType,
    /// Total size.
    pub size: u64,
    /// Icon digest.
    pub icon: Option<String>,
    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
    /// Type specific attributes.
    pub extra_attrs: serde_json::Value,
}

/// Parent to child edge of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Index artifact.
    pub parent_id: ArtifactId,
    /// Child artifact.
    pub child_id: ArtifactId,
    /// Child digest.
    pub child_digest: Digest,
    /// Child platform.
    pub platform: Option<Platform>,
}

/// Kinds of subordinate artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessoryKind {
    /// Cosign signature.
    #[serde(rename = "signature.cosign")]
    CosignSignature,
    /// Notation signature.
    #[serde(rename = "signature.notation")]
    NotationSignature,
    /// SBOM generated by Harbor.
    #[serde(rename = "sbom.harbor")]
    HarborSbom,
    /// Any other OCI 1.1 referrer.
    #[serde(rename = "subject")]
    Subject,
}

impl AccessoryKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessoryKind::CosignSignature => "signature.cosign",
            AccessoryKind::NotationSignature => "signature.notation",
            AccessoryKind::HarborSbom => "sbom.harbor",
            AccessoryKind::Subject => "subject",
        }
    }
}

/// Subject to accessory edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessory {
    /// Accessory artifact.
    pub artifact_id: ArtifactId,
    /// Accessory digest.
    pub digest: Digest,
    /// Subject artifact.
    pub subject_artifact_id: ArtifactId,
    /// Subject digest.
    pub subject_digest: Digest,
    /// Repository of both ends.
    pub repository_id: RepositoryId,
    /// What the accessory is.
    pub kind: AccessoryKind,
    /// Manifest size of the accessory.
    pub size: u64,
    /// Artifact type of the accessory, for referrers filtering.
    pub artifact_type: Option<String>,
    /// Manifest media type of the accessory.
    pub media_type: String,
    /// Manifest annotations of the accessory.
    pub annotations: BTreeMap<String, String>,
}

/// Tag identifier.
pub type TagId = i64;

/// A mutable name for an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Identifier.
    pub id: TagId,
    /// Owning repository.
    pub repository_id: RepositoryId,
    /// Tagged artifact.
    pub artifact_id: ArtifactId,
    /// Name.
    pub name: String,
    /// When the tag last moved.
    pub push_time: DateTime<Utc>,
    /// Most recent pull through this tag.
    pub pull_time: Option<DateTime<Utc>>,
}

/// A previous binding of a tag, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagHistory {
    /// Repository.
    pub repository_id: RepositoryId,
    /// Tag name.
    pub name: String,
    /// Digest the tag pointed at.
    pub digest: Digest,
    /// When the binding was replaced or removed.
    pub replaced_at: DateTime<Utc>,
}

/// Label visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelScope {
    /// Usable in every project.
    Global,
    /// Usable in the project named by `project_id`.
    Project,
}

/// A label applicable to artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Identifier.
    pub id: LabelId,
    /// Name, unique within its scope.
    pub name: String,
    /// Display color.
    pub color: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Visibility.
    pub scope: LabelScope,
    /// Owning project of a project scoped label.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

/// Vulnerability severities, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    /// No vulnerabilities.
    #[default]
    None,
    /// Severity unknown.
    Unknown,
    /// Negligible.
    Negligible,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

/// One finding of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    /// CVE identifier.
    pub id: String,
    /// Severity.
    pub severity: Severity,
}

/// Summary of the latest scan of a digest. The full report lives with the
/// scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReportRef {
    /// Scanned artifact.
    pub digest: Digest,
    /// Scanner name.
    pub scanner: String,
    /// Findings.
    pub vulnerabilities: Vec<Vulnerability>,
    /// Completion time.
    pub completed: DateTime<Utc>,
}

impl ScanReportRef {
    /// The worst severity of findings not excluded by `allowed`.
    pub fn worst_severity<F>(&self, allowed: F) -> Severity
    where
        F: Fn(&str) -> bool,
    {
        self.vulnerabilities
            .iter()
            .filter(|v| !allowed(&v.id))
            .map(|v| v.severity)
            .max()
            .unwrap_or(Severity::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_types() {
        assert_eq!(
            ArtifactType::resolve(media::OCI_MANIFEST, Some(media::HELM_CONFIG)),
            ArtifactType::Chart
        );
        assert_eq!(ArtifactType::resolve(media::OCI_INDEX, None), ArtifactType::Image);
        assert_eq!(
            ArtifactType::resolve(media::OCI_MANIFEST, Some("application/x-unknown")),
            ArtifactType::Unknown
        );
    }

    #[test]
    fn severity_ordering_and_allowlist() {
        let report = ScanReportRef {
            digest: Digest::sha256(b"x"),
            scanner: "trivy".into(),
            vulnerabilities: vec![
                Vulnerability {
                    id: "CVE-1".into(),
                    severity: Severity::Critical,
                },
                Vulnerability {
                    id: "CVE-2".into(),
                    severity: Severity::Low,
                },
            ],
            completed: Utc::now(),
        };
        assert_eq!(report.worst_severity(|_| false), Severity::Critical);
        assert_eq!(report.worst_severity(|id| id == "CVE-1"), Severity::Low);
        assert_eq!(report.worst_severity(|_| true), Severity::None);
    }

    #[test]
    fn accessory_kind_wire_names() {
        let json = serde_json::to_string(&AccessoryKind::CosignSignature).unwrap();
        assert_eq!(json, "\"signature.cosign\"");
        assert_eq!(AccessoryKind::HarborSbom.as_str(), "sbom.harbor");
    }
}
