//! Cosign signature verification.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use blob_store::BlobBackend;
use harbor_core::manifest::ParsedManifest;
use harbor_core::media::COSIGN_SIGNATURE_ANNOTATION;
use harbor_core::model::{AccessoryKind, Artifact};
use harbor_core::store::Store;
use harbor_core::{Error, ErrorKind, Result};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::Deserialize;
use sha2::Sha256;

use crate::artifact::read_small_blob;

/// Largest signature payload read.
const MAX_PAYLOAD: u64 = 64 * 1024;

/// Public keys signatures are checked against.
#[derive(Debug, Clone, Default)]
pub struct TrustRoot {
    keys: Vec<VerifyingKey<Sha256>>,
}

impl TrustRoot {
    /// An empty trust root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PEM encoded RSA public key, SPKI or PKCS#1.
    pub fn add_pem(&mut self, pem: &str) -> Result<()> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(Error::with(ErrorKind::Invalid, "trust root key is not an RSA public key"))?;
        self.keys.push(VerifyingKey::new(key));
        Ok(())
    }

    /// Read every key file in `paths`.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut root = Self::new();
        for path in paths {
            let path = path.as_ref();
            let pem = std::fs::read_to_string(path).map_err(|err| {
                Error::invalid(format!("cannot read trust root {}", path.display())).with_source(err)
            })?;
            root.add_pem(&pem)?;
        }
        Ok(root)
    }

    /// No keys configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether any key verifies `signature` over `payload`.
    pub fn verifies(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.keys
            .iter()
            .any(|key| key.verify(payload, &signature).is_ok())
    }
}

#[derive(Debug, Deserialize)]
struct SimpleSigning {
    critical: Critical,
}

#[derive(Debug, Deserialize)]
struct Critical {
    image: SignedImage,
}

#[derive(Debug, Deserialize)]
struct SignedImage {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

/// Whether `artifact` carries a cosign signature that satisfies `trust`.
///
/// With an empty trust root any attached signature counts.
pub(crate) async fn is_signed(
    store: &Arc<dyn Store>,
    backend: &Arc<dyn BlobBackend>,
    trust: &TrustRoot,
    artifact: &Artifact,
) -> Result<bool> {
    let signatures: Vec<_> = store
        .accessories_of(artifact.id)
        .await?
        .into_iter()
        .filter(|accessory| accessory.kind == AccessoryKind::CosignSignature)
        .collect();
    if trust.is_empty() || signatures.is_empty() {
        return Ok(!signatures.is_empty());
    }

    for signature in signatures {
        let stored = match backend
            .get_manifest(&artifact.repository_name, &signature.digest)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                tracing::debug!(digest = %signature.digest, error = %err, "Signature manifest unreadable");
                continue;
            }
        };
        let manifest = ParsedManifest::parse(&stored.bytes, Some(&stored.media_type))?;
        for layer in &manifest.layers {
            let Some(encoded) = layer.annotations.get(COSIGN_SIGNATURE_ANNOTATION) else {
                continue;
            };
            let Ok(raw_signature) = STANDARD.decode(encoded) else {
                continue;
            };
            let payload = read_small_blob(
                backend.as_ref(),
                &artifact.repository_name,
                &layer.digest,
                MAX_PAYLOAD,
            )
            .await?;
            let Ok(signed) = serde_json::from_slice::<SimpleSigning>(&payload) else {
                continue;
            };
            if signed.critical.image.docker_manifest_digest != artifact.digest.to_string() {
                continue;
            }
            if trust.verifies(&payload, &raw_signature) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    const PRIVATE: &str = include_str!("../../tests/fixtures/cosign-key.pk8");
    const PUBLIC: &str = include_str!("../../tests/fixtures/cosign-key.pub.pem");

    #[test]
    fn verifies_with_configured_key() {
        let key = RsaPrivateKey::from_pkcs8_pem(PRIVATE).unwrap();
        let signer = SigningKey::<Sha256>::new(key);
        let payload = br#"{"critical":{"image":{"docker-manifest-digest":"sha256:00"}}}"#;
        let signature = signer.sign(payload).to_vec();

        let mut root = TrustRoot::new();
        root.add_pem(PUBLIC).unwrap();
        assert!(root.verifies(payload, &signature));
        assert!(!root.verifies(b"tampered", &signature));
        assert!(!TrustRoot::new().verifies(payload, &signature));
    }

    #[test]
    fn rejects_non_keys() {
        assert!(TrustRoot::new().add_pem("not a key").is_err());
    }
}
