//! Configuration sections shared by the registry and replication services.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Loading the document from disk is left to the binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::model::AccessoryKind;

/// Serialize a [`Duration`] as fractional seconds.
pub mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as `f64` seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserialize from `f64` seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Token service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of issued access tokens.
    #[serde(with = "seconds")]
    pub ttl: Duration,

    /// Lifetime of refresh tokens handed out for `offline_token=true`.
    #[serde(with = "seconds")]
    pub refresh_ttl: Duration,

    /// PEM encoded RSA private key (PKCS#1 or PKCS#8).
    pub private_key_path: Option<PathBuf>,

    /// `iss` claim.
    pub issuer: String,

    /// `aud` claim and the `service` parameter clients must send.
    pub service: String,

    /// Absolute URL clients are sent to by auth challenges.
    pub realm: String,

    /// Route the token endpoint is mounted on.
    pub path: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig {
            ttl: Duration::from_secs(30 * 60),
            refresh_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            private_key_path: None,
            issuer: "harbor-token-issuer".into(),
            service: "harbor-registry".into(),
            realm: "http://localhost/service/token".into(),
            path: "/service/token".into(),
        }
    }
}

/// Replication engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Workers per execution.
    pub concurrency: usize,

    /// Task retry schedule.
    pub backoff: BackoffPolicy,

    /// Adapter types which may be instantiated. Empty means all built-in types.
    pub enabled_adapters: Vec<String>,

    /// Chunk size for `copy_by_chunk` transfers, in bytes.
    pub chunk_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            concurrency: 10,
            backoff: BackoffPolicy::default(),
            enabled_adapters: Vec::new(),
            chunk_size: 10 * 1024 * 1024,
        }
    }
}

/// Retention sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Six field cron expression (with seconds) for the periodic sweep.
    pub sweep_cron: String,

    /// Whether untagged artifacts no rule retains are deleted by the sweep.
    pub delete_untagged: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            sweep_cron: "0 0 0 * * *".into(),
            delete_untagged: true,
        }
    }
}

/// Artifact ingestion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Largest custom icon decoded, in bytes.
    pub max_icon_size: usize,

    /// Media types (artifact type, config media type or layer media type)
    /// which mark a manifest as an accessory.
    pub accessory_media_types: BTreeMap<String, AccessoryKind>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        let accessory_media_types = [
            (
                "application/vnd.dev.cosign.artifact.sig.v1+json",
                AccessoryKind::CosignSignature,
            ),
            (
                "application/vnd.dev.cosign.simplesigning.v1+json",
                AccessoryKind::CosignSignature,
            ),
            (
                "application/vnd.cncf.notary.signature",
                AccessoryKind::NotationSignature,
            ),
            (
                "application/vnd.goharbor.harbor.sbom.v1",
                AccessoryKind::HarborSbom,
            ),
        ]
        .into_iter()
        .map(|(media_type, kind)| (media_type.to_owned(), kind))
        .collect();

        ArtifactConfig {
            max_icon_size: 1024 * 1024,
            accessory_media_types,
        }
    }
}

/// Policy feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Enforce tag immutability rules.
    pub immutability: bool,
    /// Enforce project storage quotas.
    pub quota: bool,
    /// Enforce signature requirements on pull.
    pub signature_gate: bool,
    /// Enforce vulnerability thresholds on pull.
    pub vulnerability_gate: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            immutability: true,
            quota: true,
            signature_gate: true,
            vulnerability_gate: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Pretty,
            filter: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let token: TokenConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(token, TokenConfig::default());
        assert_eq!(token.ttl, Duration::from_secs(1800));

        let replication: ReplicationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(replication.concurrency, 10);
        assert_eq!(replication.backoff.max_retries, 3);
    }

    #[test]
    fn seconds_round_trip() {
        let replication: ReplicationConfig =
            serde_json::from_str(r#"{"backoff": {"base": 0.25, "max": 5}}"#).unwrap();
        assert_eq!(replication.backoff.base, Duration::from_millis(250));
        assert_eq!(replication.backoff.max, Duration::from_secs(5));
        assert_eq!(replication.backoff.factor, 2);
    }

    #[test]
    fn accessory_table_is_overridable() {
        let artifact: ArtifactConfig = serde_json::from_str(
            r#"{"accessory_media_types": {"application/example.sig": "signature.cosign"}}"#,
        )
        .unwrap();
        assert_eq!(artifact.accessory_media_types.len(), 1);
        assert_eq!(
            artifact.accessory_media_types["application/example.sig"],
            AccessoryKind::CosignSignature
        );
    }
}
