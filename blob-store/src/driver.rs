use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncRead + Unpin + Send + 'r;

/// An owned reader returned by [`Driver::open`].
pub type BoxReader = Box<Reader<'static>>;

/// Object metadata common to every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// Size in bytes.
    pub size: u64,

    /// Creation time.
    pub created: DateTime<Utc>,
}

/// A flat key/value object store addressed by relative paths.
///
/// Writes through [`Driver::put`] and [`Driver::rename`] are atomic: readers
/// observe either the old object or the complete new one.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Delete an object.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Metadata of an object.
    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Replace an object with the contents of `reader`, returning its size.
    async fn put(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError>;

    /// Append the contents of `reader` to an object, creating it if needed.
    /// Returns the new size.
    async fn append(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError>;

    /// Open an object for reading, starting at `offset` and reading at most
    /// `length` bytes.
    async fn open(
        &self,
        path: &Utf8Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<BoxReader, StorageError>;

    /// Move an object. Fails with `AlreadyExists` if `to` exists.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Paths of every object under `prefix`, sorted.
    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError>;

    /// Read a whole (small) object into memory.
    async fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        use tokio::io::AsyncReadExt;

        let mut reader = self.open(path, 0, None).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), path.as_str(), err))?;
        Ok(buf)
    }

    /// Write a whole (small) object from memory.
    async fn write(&self, path: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        let mut reader = data;
        self.put(path, &mut reader).await?;
        Ok(())
    }

    /// Whether an object exists.
    async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == crate::StorageErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(path).await
    }

    async fn put(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.deref().put(path, reader).await
    }

    async fn append(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.deref().append(path, reader).await
    }

    async fn open(
        &self,
        path: &Utf8Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<BoxReader, StorageError> {
        self.deref().open(path, offset, length).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.deref().list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
