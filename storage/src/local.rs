use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Storage driver backed by a directory on the local filesystem.
///
/// Blobs are written to a sibling temporary file and renamed into place, so
/// a reader never observes a half-written blob.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    #[cfg(feature = "tmp")]
    scratch: Option<tempfile::TempDir>,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. Buckets are subdirectories.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            #[cfg(feature = "tmp")]
            scratch: None,
        }
    }

    /// Create a driver in a fresh temporary directory, removed with the driver.
    #[cfg(feature = "tmp")]
    pub fn scratch() -> std::io::Result<Self> {
        let dir = tempfile::TempDir::new()?;
        let root = Utf8Path::from_path(dir.path())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "temporary directory is not utf-8")
            })?
            .to_owned();
        Ok(Self {
            root,
            scratch: Some(dir),
        })
    }

    /// The directory holding every bucket.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if remote.is_absolute()
            || remote
                .components()
                .any(|c| matches!(c, camino::Utf8Component::ParentDir))
        {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path escapes bucket"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        Ok(self.bucket_root(bucket).join(remote))
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::builder(self.name(), err.kind().into(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn scheme(&self) -> &str {
        #[cfg(feature = "tmp")]
        if self.scratch.is_some() {
            return "tmp";
        }
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(bucket, remote, err))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        let parent = path.parent().unwrap_or(&self.root).to_owned();

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        let staging = parent.join(format!(
            ".{}.partial",
            path.file_name().unwrap_or("blob")
        ));

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&staging)
                .await
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        let copied = async {
            tokio::io::copy(local, &mut writer).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(err) = copied {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.error(bucket, remote, err));
        }

        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|err| self.error(bucket, remote, err))
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket);
        let start = match prefix {
            Some(prefix) => self.path(bucket, prefix)?,
            None => root.clone(),
        };

        let mut items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        items.sort();
        tracing::debug!("Found {} entries", items.len());

        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files).map_err(|err| err.wrap_err(format!("walking {start}")))?;
    }

    Ok(files
        .into_iter()
        .filter(|p| !p.file_name().is_some_and(|name| name.ends_with(".partial")))
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
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
    async fn write_read_delete() {
        let (_dir, driver) = driver();
        let remote = Utf8Path::new("packages/demo/1.0.0/demo.1.0.0.nupkg");

        let mut reader: &[u8] = b"zip bytes";
        driver.upload("feed", remote, &mut reader).await.unwrap();

        let mut out = Vec::new();
        driver.download("feed", remote, &mut out).await.unwrap();
        assert_eq!(out, b"zip bytes");
        assert_eq!(driver.metadata("feed", remote).await.unwrap().size, 9);

        let listed = driver
            .list("feed", Some(Utf8Path::new("packages/demo")))
            .await
            .unwrap();
        assert_eq!(listed, vec![remote.to_string()]);

        driver.delete("feed", remote).await.unwrap();
        assert!(driver
            .delete("feed", remote)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[cfg(feature = "tmp")]
    #[tokio::test]
    async fn scratch_directory_is_removed_on_drop() {
        let driver = LocalDriver::scratch().unwrap();
        let root = driver.root().to_owned();
        assert_eq!(driver.scheme(), "tmp");

        let mut reader: &[u8] = b"nuspec";
        driver
            .upload("feed", Utf8Path::new("demo.nuspec"), &mut reader)
            .await
            .unwrap();
        assert!(root.join("feed").is_dir());

        drop(driver);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn rejects_parent_components() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("feed", Utf8Path::new("../escape"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
