//! Shared building blocks of the Harbor registry access plane.
//!
//! The crates built on top of this one (blob storage, the registry proxy,
//! the replication engine) share the error taxonomy, the data model, the
//! [`store::Store`] interface and the [`event::EventBus`] defined here.

pub mod backoff;
pub mod config;
pub mod digest;
/// Error taxonomy shared by every crate.
pub mod error;
pub mod event;
pub mod identity;
pub mod lock;
pub mod manifest;
pub mod media;
pub mod model;
pub mod pattern;
pub mod reference;
/// Credentials that stay out of logs.
pub mod secret;
pub mod store;

pub use self::digest::Digest;
pub use self::error::{Error, ErrorKind, Result};
pub use self::reference::{Reference, RepositoryName};
pub use self::secret::Secret;
