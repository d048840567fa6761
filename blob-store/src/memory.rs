use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::driver::{BoxReader, Driver, Metadata, Reader};
use crate::error::{StorageError, StorageErrorKind};

const ENGINE: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

fn not_found(path: &Utf8Path) -> StorageError {
    StorageError::builder(ENGINE, StorageErrorKind::NotFound, format!("{path} not found"))
        .path(path.as_str())
        .build()
}

async fn drain(reader: &mut Reader<'_>, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|err| StorageError::io(ENGINE, path.as_str(), err))?;
    Ok(data)
}

/// Storage driver that keeps objects in memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    files: RwLock<BTreeMap<Utf8PathBuf, MemoryFileItem>>,
}

impl MemoryDriver {
    /// An empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.files
            .write()
            .await
            .remove(path)
            .map(drop)
            .ok_or_else(|| not_found(path))
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.files
            .read()
            .await
            .get(path)
            .map(Metadata::from)
            .ok_or_else(|| not_found(path))
    }

    async fn put(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let data = drain(reader, path).await?;
        let size = data.len() as u64;
        self.files.write().await.insert(path.to_owned(), data.into());
        Ok(size)
    }

    async fn append(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let tail = drain(reader, path).await?;
        let mut files = self.files.write().await;
        let item = files
            .entry(path.to_owned())
            .or_insert_with(|| Vec::new().into());
        let mut data = Vec::with_capacity(item.data.len() + tail.len());
        data.extend_from_slice(&item.data);
        data.extend_from_slice(&tail);
        item.data = data.into();
        Ok(item.data.len() as u64)
    }

    async fn open(
        &self,
        path: &Utf8Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<BoxReader, StorageError> {
        let data = self
            .files
            .read()
            .await
            .get(path)
            .map(|item| item.data.clone())
            .ok_or_else(|| not_found(path))?;

        let size = data.len() as u64;
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("offset {offset} beyond end of {size} byte object"),
            )
            .path(path.as_str())
            .build());
        }
        let end = length.map_or(size, |len| size.min(offset.saturating_add(len)));
        let slice = data.slice(offset as usize..end as usize);
        Ok(Box::new(Cursor::new(slice)))
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        if files.contains_key(to) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::AlreadyExists,
                format!("{to} already exists"),
            )
            .path(to.as_str())
            .build());
        }
        let item = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_owned(), item);
        Ok(())
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let files = self.files.read().await;
        Ok(files
            .keys()
            .filter(|path| path.starts_with(prefix))
            .map(|path| path.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn put_append_open() {
        let driver = MemoryDriver::new();
        let path = Utf8Path::new("uploads/a/data");

        driver.write(path, b"hello ").await.unwrap();
        let mut tail: &[u8] = b"world";
        assert_eq!(driver.append(path, &mut tail).await.unwrap(), 11);

        let mut reader = driver.open(path, 6, Some(3)).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "wor");

        assert_eq!(driver.metadata(path).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn rename_refuses_to_overwrite() {
        let driver = MemoryDriver::new();
        driver.write(Utf8Path::new("a"), b"1").await.unwrap();
        driver.write(Utf8Path::new("b"), b"2").await.unwrap();

        let err = driver.rename(Utf8Path::new("a"), Utf8Path::new("b")).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyExists);

        driver.delete(Utf8Path::new("b")).await.unwrap();
        driver.rename(Utf8Path::new("a"), Utf8Path::new("b")).await.unwrap();
        assert_eq!(driver.read(Utf8Path::new("b")).await.unwrap(), b"1");
        assert!(!driver.exists(Utf8Path::new("a")).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_component_prefix() {
        let driver = MemoryDriver::new();
        driver.write(Utf8Path::new("repositories/lib/a/link"), b"").await.unwrap();
        driver.write(Utf8Path::new("repositories/lib/ab/link"), b"").await.unwrap();

        let listed = driver.list(Utf8Path::new("repositories/lib/a")).await.unwrap();
        assert_eq!(listed, vec!["repositories/lib/a/link".to_owned()]);
    }
}
