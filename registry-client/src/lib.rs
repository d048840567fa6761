//! # Registry client
//!
//! A client for the Docker Registry HTTP API v2 (the OCI distribution API),
//! used by replication adapters to talk to remote registries.
//!
//! Requests go through a [`Transport`]: [`ReqwestTransport`] in production,
//! [`mock::MockTransport`] in tests. Token challenges are answered by the
//! [`Authenticator`], which caches one token per scope.

mod auth;
mod client;
mod error;
pub mod mock;
pub mod paginate;
mod transport;

pub use self::auth::{Authenticator, Challenge, Scheme};
pub use self::client::{ManifestHead, PulledBlob, PulledManifest, RegistryClient, CATALOG_SCOPE};
pub use self::error::{ClientError, StatusError};
pub use self::transport::{collect, empty, full, stream, Body, ReqwestTransport, Transport};
