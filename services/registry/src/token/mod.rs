//! Token service.
//!
//! Issues RS256 signed bearer tokens in the Docker token format. The `kid`
//! header is the libtrust style fingerprint of the signing key, and the
//! public key is published as a JWKS document.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use harbor_core::config::TokenConfig;
use harbor_core::identity::{Subject, ANONYMOUS};
use harbor_core::{Error, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};

pub(crate) mod handler;
mod scope;

pub use self::scope::{parse_scopes, Access, REGISTRY, REPOSITORY};

/// Accepted clock skew on `nbf`.
const NOT_BEFORE_SKEW: i64 = 60;

/// Claims of issued tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Subject; `anonymous` for anonymous tokens.
    pub sub: String,
    /// Audience, the registry service name.
    pub aud: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Not before.
    pub nbf: i64,
    /// Issued at.
    pub iat: i64,
    /// Random token id.
    pub jti: String,
    /// Granted access.
    #[serde(default)]
    pub access: Vec<Access>,
    /// Refresh tokens grant nothing themselves.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
}

impl Claims {
    /// Whether the token grants `action` on `(resource_type, name)`.
    pub fn allows(&self, resource_type: &str, name: &str, action: &str) -> bool {
        self.access
            .iter()
            .any(|access| access.allows(resource_type, name, action))
    }
}

/// A signed token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT.
    pub token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
}

/// Signs and verifies tokens.
pub struct TokenService {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    kid: String,
    modulus: String,
    exponent: String,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.config.issuer)
            .field("service", &self.config.service)
            .field("kid", &self.kid)
            .finish()
    }
}

impl TokenService {
    /// Load the key named by `config.private_key_path`, or generate a
    /// throwaway key when none is configured.
    pub fn load(config: TokenConfig) -> Result<Self> {
        match &config.private_key_path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|err| {
                    Error::invalid(format!("cannot read token key {}", path.display()))
                        .with_source(err)
                })?;
                Self::from_pem(config, &pem)
            }
            None => {
                tracing::warn!("No token signing key configured, generating one");
                Self::generate(config)
            }
        }
    }

    /// Use a PEM encoded PKCS#8 or PKCS#1 RSA private key.
    pub fn from_pem(config: TokenConfig, pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(Error::with(
                harbor_core::ErrorKind::Invalid,
                "token signing key is not an RSA private key",
            ))?;
        Self::from_key(config, &key)
    }

    /// Use a fresh 2048 bit key.
    pub fn generate(config: TokenConfig) -> Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(Error::with(harbor_core::ErrorKind::Internal, "key generation failed"))?;
        Self::from_key(config, &key)
    }

    fn from_key(config: TokenConfig, key: &RsaPrivateKey) -> Result<Self> {
        let der = key
            .to_pkcs1_der()
            .map_err(Error::with(harbor_core::ErrorKind::Internal, "cannot encode signing key"))?;
        let encoding = EncodingKey::from_rsa_der(der.as_bytes());

        let public = RsaPublicKey::from(key);
        let modulus = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let exponent = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        let decoding = DecodingKey::from_rsa_components(&modulus, &exponent)
            .map_err(Error::with(harbor_core::ErrorKind::Internal, "cannot build verifying key"))?;
        let spki = public
            .to_public_key_der()
            .map_err(Error::with(harbor_core::ErrorKind::Internal, "cannot encode public key"))?;

        Ok(TokenService {
            config,
            encoding,
            decoding,
            kid: key_id(spki.as_bytes()),
            modulus,
            exponent,
        })
    }

    /// Settings the service was built with.
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Key id placed in token headers.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// JWKS document holding the verification key.
    pub fn jwks(&self) -> Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": self.kid,
                "n": self.modulus,
                "e": self.exponent,
            }]
        })
    }

    /// Issue an access token granting `access` to `subject`.
    pub fn issue(&self, subject: &Subject, access: Vec<Access>) -> Result<IssuedToken> {
        self.sign(subject.name(), access, self.config.ttl, false)
    }

    /// Issue a refresh token for `subject`. Anonymous subjects get none.
    pub fn issue_refresh(&self, subject: &Subject) -> Result<IssuedToken> {
        if subject.principal().is_none() {
            return Err(Error::unauthorized("refresh tokens require credentials"));
        }
        self.sign(subject.name(), Vec::new(), self.config.refresh_ttl, true)
    }

    fn sign(&self, sub: &str, access: Vec<Access>, ttl: Duration, refresh: bool) -> Result<IssuedToken> {
        let issued_at = Utc::now();
        let now = issued_at.timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            iss: self.config.issuer.clone(),
            sub: sub.to_owned(),
            aud: self.config.service.clone(),
            exp: now.saturating_add(ttl_secs),
            nbf: now - NOT_BEFORE_SKEW,
            iat: now,
            jti: format!("{:032x}", rand::random::<u128>()),
            access,
            refresh,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        let token = jsonwebtoken::encode(&header, &claims, &self.encoding)
            .map_err(Error::with(harbor_core::ErrorKind::Internal, "token signing failed"))?;
        Ok(IssuedToken {
            token,
            expires_in: ttl.as_secs(),
            issued_at,
        })
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.config.service]);
        validation.set_issuer(&[&self.config.issuer]);
        validation.validate_nbf = true;
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| Error::unauthorized("invalid token").with_source(err))
    }

    /// Verify an access token's signature, lifetime, issuer and audience.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let claims = self.decode(token)?;
        if claims.refresh {
            return Err(Error::unauthorized("refresh tokens cannot be used for access"));
        }
        Ok(claims)
    }

    /// Verify a refresh token, returning the username it was issued to.
    pub fn verify_refresh(&self, token: &str) -> Result<String> {
        let claims = self.decode(token)?;
        if !claims.refresh || claims.sub.is_empty() || claims.sub == ANONYMOUS {
            return Err(Error::unauthorized("not a refresh token"));
        }
        Ok(claims.sub)
    }
}

const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// libtrust key id: the first 30 bytes of the SPKI DER's SHA-256, base32
/// encoded and split into groups of four.
fn key_id(spki: &[u8]) -> String {
    let hash = Sha256::digest(spki);
    let mut encoded = String::with_capacity(48);
    for chunk in hash[..30].chunks(5) {
        let bits = chunk.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        for shift in (0..8).rev() {
            encoded.push(char::from(BASE32[((bits >> (shift * 5)) & 0x1f) as usize]));
        }
    }
    encoded
        .as_bytes()
        .chunks(4)
        .map(|group| String::from_utf8_lossy(group).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
