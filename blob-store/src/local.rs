use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use crate::driver::{BoxReader, Driver, Metadata, Reader};
use crate::error::{StorageError, StorageErrorKind};

const ENGINE: &str = "local";

/// Storage driver backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// A driver storing objects under `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, remote: &Utf8Path) -> Utf8PathBuf {
        self.root.join(remote)
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(ENGINE, parent.as_str(), err))?;
        }
        Ok(())
    }

    async fn copy_into(
        &self,
        file: tokio::fs::File,
        path: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut writer = tokio::io::BufWriter::new(file);
        tokio::io::copy(reader, &mut writer)
            .await
            .map_err(|err| StorageError::io(ENGINE, path.as_str(), err))?;
        writer
            .shutdown()
            .await
            .map_err(|err| StorageError::io(ENGINE, path.as_str(), err))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        if metadata.is_dir() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                format!("{remote} is a directory"),
            )
            .path(remote.as_str())
            .build());
        }
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(remote))
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))
    }

    async fn put(&self, remote: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let path = self.path(remote);
        self.create_parent(&path).await?;

        // Write beside the target, then rename over it.
        let staging = path.with_file_name(format!(
            ".{}.{}",
            path.file_name().unwrap_or("object"),
            uuid::Uuid::new_v4()
        ));
        let file = tokio::fs::File::create(&staging)
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        if let Err(err) = self.copy_into(file, remote, reader).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        self.metadata(remote).await.map(|m| m.size)
    }

    async fn append(&self, remote: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let path = self.path(remote);
        self.create_parent(&path).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        self.copy_into(file, remote, reader).await?;
        self.metadata(remote).await.map(|m| m.size)
    }

    async fn open(
        &self,
        remote: &Utf8Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<BoxReader, StorageError> {
        let size = self.metadata(remote).await?.size;
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("offset {offset} beyond end of {size} byte object"),
            )
            .path(remote.as_str())
            .build());
        }

        let mut file = tokio::fs::File::open(self.path(remote))
            .await
            .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| StorageError::io(ENGINE, remote.as_str(), err))?;
        }
        let reader = tokio::io::BufReader::new(file);
        Ok(match length {
            Some(length) => Box::new(reader.take(length)),
            None => Box::new(reader),
        })
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let target = self.path(to);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::AlreadyExists,
                format!("{to} already exists"),
            )
            .path(to.as_str())
            .build());
        }
        self.create_parent(&target).await?;
        tokio::fs::rename(self.path(from), &target)
            .await
            .map_err(|err| StorageError::io(ENGINE, from.as_str(), err))
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let start = self.path(prefix);

        let mut items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(ENGINE, prefix.as_str(), err))?;

        items.sort();
        tracing::trace!("Found {} entries under {prefix}", items.len());
        Ok(items)
    }
}

fn collect_list(root: &Utf8Path, start: &Utf8Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    match std::fs::metadata(start) {
        Ok(meta) if meta.is_dir() => visit(start, &mut files)?,
        Ok(_) => files.push(start.to_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    Ok(files
        .into_iter()
        .filter(|p| !p.file_name().is_some_and(|name| name.starts_with('.')))
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn put_and_ranged_open() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("blobs/sha256/ab/data");
        let mut body: &[u8] = b"0123456789";
        assert_eq!(driver.put(path, &mut body).await.unwrap(), 10);

        let mut reader = driver.open(path, 2, Some(4)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"2345");
    }

    #[tokio::test]
    async fn append_grows_object() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("uploads/u/data");
        let mut first: &[u8] = b"abc";
        let mut second: &[u8] = b"def";
        driver.append(path, &mut first).await.unwrap();
        assert_eq!(driver.append(path, &mut second).await.unwrap(), 6);
        assert_eq!(driver.read(path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn list_skips_staging_files_and_missing_prefixes() {
        let (_dir, driver) = driver();
        driver.write(Utf8Path::new("r/a/link"), b"x").await.unwrap();
        driver.write(Utf8Path::new("r/b/link"), b"y").await.unwrap();

        let listed = driver.list(Utf8Path::new("r")).await.unwrap();
        assert_eq!(listed, vec!["r/a/link".to_owned(), "r/b/link".to_owned()]);
        assert!(driver.list(Utf8Path::new("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_refuses_to_overwrite() {
        let (_dir, driver) = driver();
        driver.write(Utf8Path::new("a"), b"1").await.unwrap();
        driver.write(Utf8Path::new("b"), b"2").await.unwrap();
        let err = driver
            .rename(Utf8Path::new("a"), Utf8Path::new("b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::AlreadyExists);
    }
}
