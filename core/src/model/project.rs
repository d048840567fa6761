use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CveAllowlist, Severity};

/// Project identifier.
pub type ProjectId = i64;

/// Repository identifier.
pub type RepositoryId = i64;

/// Per-project policy switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectMetadata {
    /// Anyone may pull.
    pub public: bool,
    /// Scan artifacts on push.
    pub auto_scan: bool,
    /// Block pulls of artifacts at or above `severity`.
    pub prevent_vulnerable: bool,
    /// Vulnerability threshold.
    pub severity: Severity,
    /// Require a verified cosign signature to pull tags.
    pub require_signature: bool,
    /// Retention policy attached to the project.
    pub retention_id: Option<i64>,
    /// Merge the system CVE allow-list into the project's.
    pub reuse_sys_cve_allowlist: bool,
}

impl Default for ProjectMetadata {
    fn default() -> Self {
        ProjectMetadata {
            public: false,
            auto_scan: false,
            prevent_vulnerable: false,
            severity: Severity::Critical,
            require_signature: false,
            retention_id: None,
            reuse_sys_cve_allowlist: true,
        }
    }
}

/// A namespace owning repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Identifier.
    pub id: ProjectId,
    /// Globally unique, case-sensitive name.
    pub name: String,
    /// Creator.
    pub owner: String,
    /// Policy switches.
    pub metadata: ProjectMetadata,
    /// Project CVE allow-list.
    pub cve_allowlist: CveAllowlist,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
}

impl Project {
    /// Whether anonymous users may pull.
    pub fn is_public(&self) -> bool {
        self.metadata.public
    }
}

/// Fields needed to create a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    /// Name.
    pub name: String,
    /// Creator.
    #[serde(default)]
    pub owner: String,
    /// Policy switches.
    #[serde(default)]
    pub metadata: ProjectMetadata,
    /// Storage quota in bytes; `None` means unlimited.
    #[serde(default)]
    pub storage_limit: Option<u64>,
}

/// Project membership roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Full control.
    ProjectAdmin,
    /// Push, pull, delete, manage tags.
    Maintainer,
    /// Push and pull.
    Developer,
    /// Pull.
    Guest,
    /// Pull, without listing.
    LimitedGuest,
}

/// Repository inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Identifier.
    pub id: RepositoryId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Full path, `project/name`.
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last modification.
    pub updated: DateTime<Utc>,
    /// Pulls across all artifacts.
    pub pull_count: u64,
}
