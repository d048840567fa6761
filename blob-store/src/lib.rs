//! # Blob storage
//!
//! Content-addressed storage for registry blobs, manifests, tags and
//! resumable uploads, layered over a pluggable object [`Driver`].

#[cfg(feature = "local")]
pub(crate) mod local;

/// Storage configuration and driver selection.
pub mod config;
/// The object driver interface.
pub mod driver;
/// Storage errors.
pub mod error;
/// Hashing readers.
pub mod hash;
pub(crate) mod memory;
/// Content-addressed blob and manifest storage.
pub mod store;
pub mod upload;

#[doc(inline)]
pub use config::StorageConfig;
#[doc(inline)]
pub use driver::{BoxReader, Driver, Metadata, Reader};
#[doc(inline)]
pub use error::{StorageError, StorageErrorKind};
#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;
#[doc(inline)]
pub use memory::MemoryDriver;
#[doc(inline)]
pub use store::{BlobBackend, BlobStore, BlobStream, ByteRange, StoredManifest, TagPage};
#[doc(inline)]
pub use upload::{Committed, UploadSession, UploadState};
