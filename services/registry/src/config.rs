//! Service configuration.
//!
//! The binary reads a TOML document into [`Config`]; library users build the
//! struct directly. Every section has defaults, so an empty document is
//! valid.

use std::path::PathBuf;
use std::time::Duration;

use blob_store::StorageConfig;
use harbor_core::config::{
    seconds, ArtifactConfig, FeatureFlags, LogConfig, ReplicationConfig, RetentionConfig,
    TokenConfig,
};
use harbor_core::Secret;
use serde::Deserialize;

/// Registry front end settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Base URL clients reach the registry on.
    pub external_url: String,

    /// Blob, manifest and tag storage.
    pub backend: StorageConfig,

    /// Largest manifest accepted, in bytes.
    pub max_manifest_size: usize,

    /// Deadline applied to every request.
    #[serde(with = "seconds")]
    pub request_timeout: Duration,

    /// Expected upload rate in bytes per second, used to size quota
    /// reservation lifetimes.
    pub upload_throughput: u64,

    /// PEM encoded RSA public keys cosign signatures are verified against.
    pub trust_root: Vec<PathBuf>,

    /// Account replication uses to reach this registry.
    pub replication_user: Option<String>,

    /// Password of `replication_user`.
    pub replication_password: Option<Secret>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            external_url: "http://localhost".into(),
            backend: StorageConfig::default(),
            max_manifest_size: 4 * 1024 * 1024,
            request_timeout: Duration::from_secs(300),
            upload_throughput: 10 * 1024 * 1024,
            trust_root: Vec::new(),
            replication_user: None,
            replication_password: None,
        }
    }
}

/// Initial user accounts for the static identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: Secret,
    /// System administrator.
    #[serde(default)]
    pub sysadmin: bool,
}

/// Everything the registry service is configured with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `[token]`
    pub token: TokenConfig,
    /// `[registry]`
    pub registry: RegistrySettings,
    /// `[replication]`
    pub replication: ReplicationConfig,
    /// `[retention]`
    pub retention: RetentionConfig,
    /// `[artifact]`
    pub artifact: ArtifactConfig,
    /// `[features]`
    pub features: FeatureFlags,
    /// `[log]`
    pub log: LogConfig,
    /// `[[users]]`
    pub users: Vec<UserConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_valid() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.registry.max_manifest_size, 4 * 1024 * 1024);
        assert_eq!(config.registry.request_timeout, Duration::from_secs(300));
        assert_eq!(config.registry.backend, StorageConfig::Memory);
        assert_eq!(config.token.path, "/service/token");
        assert!(config.retention.delete_untagged);
        assert!(config.users.is_empty());
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "registry": {"external_url": "https://h", "request_timeout": 2.5},
                "features": {"signature_gate": false},
                "users": [{"username": "admin", "password": "pw", "sysadmin": true}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.registry.external_url, "https://h");
        assert_eq!(config.registry.request_timeout, Duration::from_millis(2500));
        assert!(!config.features.signature_gate);
        assert!(config.features.quota);
        assert!(config.users[0].sysadmin);
    }
}
