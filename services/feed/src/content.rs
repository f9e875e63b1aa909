//! Content store for package artifacts.
//!
//! Every package version owns up to five blobs, laid out under
//! `packages/<id>/<version>/` in a single storage bucket. Blobs are written at
//! most once: a second write of the same bytes is accepted without touching
//! storage, and a write of different bytes is a [`ContentError::Conflict`].

use std::fmt;

use base64::Engine as _;
use bytes::Bytes;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use storage::{Storage, StorageBucket, StorageError};

use crate::id::PackageKey;

/// The kinds of blob stored for a package version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// The `.nupkg` archive itself.
    Package,
    /// The `.nuspec` manifest.
    Manifest,
    /// The embedded readme.
    Readme,
    /// The embedded icon.
    Icon,
    /// The embedded license file.
    License,
}

impl ArtifactKind {
    /// Every artifact kind.
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Package,
        ArtifactKind::Manifest,
        ArtifactKind::Readme,
        ArtifactKind::Icon,
        ArtifactKind::License,
    ];

    /// The file extension used in storage paths.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Package => "nupkg",
            ArtifactKind::Manifest => "nuspec",
            ArtifactKind::Readme => "readme",
            ArtifactKind::Icon => "icon",
            ArtifactKind::License => "license",
        }
    }

    /// The content type served for this artifact.
    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Package => "application/octet-stream",
            ArtifactKind::Manifest => "text/xml",
            ArtifactKind::Readme | ArtifactKind::License => "text/plain",
            ArtifactKind::Icon => "application/octet-stream",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// SHA-512 of an artifact, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a blob.
    pub fn of(data: &[u8]) -> Self {
        ContentHash(hex::encode(Sha512::digest(data)))
    }

    /// The hex digest.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// The digest in base64, as reported in package metadata.
    pub fn to_base64(&self) -> String {
        let raw = hex::decode(&self.0).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(raw)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha512:{}", self.0)
    }
}

/// Errors from the content store.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// Different bytes are already stored for this artifact.
    #[error("{kind} for {key} already exists with different content")]
    Conflict {
        /// The package the artifact belongs to.
        key: PackageKey,
        /// The conflicting artifact.
        kind: ArtifactKind,
    },

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Stores package artifacts in a storage bucket.
#[derive(Debug, Clone)]
pub struct ContentStore {
    bucket: StorageBucket,
}

impl ContentStore {
    /// Store artifacts in `bucket` of `storage`.
    pub fn new(storage: &Storage, bucket: &str) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    /// The storage path of an artifact.
    pub fn path(key: &PackageKey, kind: ArtifactKind) -> Utf8PathBuf {
        let version = key.version().key();
        Utf8PathBuf::from(format!(
            "packages/{id}/{version}/{id}.{version}.{ext}",
            id = key.id(),
            ext = kind.extension()
        ))
    }

    /// Write an artifact unless identical bytes are already stored.
    #[tracing::instrument(skip_all, fields(%key, %kind, size = data.len()))]
    pub async fn put(
        &self,
        key: &PackageKey,
        kind: ArtifactKind,
        data: &[u8],
    ) -> Result<ContentHash, ContentError> {
        let path = Self::path(key, kind);
        let hash = ContentHash::of(data);

        match self.bucket.read(&path).await {
            Ok(existing) if ContentHash::of(&existing) == hash => {
                tracing::trace!("artifact already stored");
                return Ok(hash);
            }
            Ok(_) => {
                return Err(ContentError::Conflict {
                    key: key.clone(),
                    kind,
                })
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        self.bucket.write(&path, data).await?;
        Ok(hash)
    }

    /// Write an artifact, replacing whatever is stored.
    ///
    /// Only for blobs with no catalog record, which no reader can observe.
    pub(crate) async fn replace(
        &self,
        key: &PackageKey,
        kind: ArtifactKind,
        data: &[u8],
    ) -> Result<ContentHash, StorageError> {
        self.bucket.write(&Self::path(key, kind), data).await?;
        Ok(ContentHash::of(data))
    }

    /// Read an artifact, `None` if it is not stored.
    #[tracing::instrument(skip_all, fields(%key, %kind))]
    pub async fn get(
        &self,
        key: &PackageKey,
        kind: ArtifactKind,
    ) -> Result<Option<Bytes>, StorageError> {
        match self.bucket.read(&Self::path(key, kind)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove every artifact of a package version. Missing blobs are ignored.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn delete(&self, key: &PackageKey) -> Result<(), StorageError> {
        for kind in ArtifactKind::ALL {
            match self.bucket.delete(&Self::path(key, kind)).await {
                Ok(()) => tracing::trace!(%kind, "deleted artifact"),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::PackageId;
    use crate::version::PackageVersion;
    use storage::MemoryStorage;

    fn key(id: &str, version: &str) -> PackageKey {
        PackageKey::new(
            &PackageId::new(id).unwrap(),
            &PackageVersion::parse(version).unwrap(),
        )
    }

    fn store() -> ContentStore {
        let storage: Storage = MemoryStorage::with_buckets(&["packages"]).into();
        ContentStore::new(&storage, "packages")
    }

    #[test]
    fn paths_use_normalized_keys() {
        let path = ContentStore::path(&key("Demo.Pkg", "1.0-Beta"), ArtifactKind::Package);
        assert_eq!(
            path.as_str(),
            "packages/demo.pkg/1.0.0-beta/demo.pkg.1.0.0-beta.nupkg"
        );
    }

    #[test]
    fn hash_is_sha512() {
        let hash = ContentHash::of(b"");
        assert!(hash.as_hex().starts_with("cf83e1357eefb8bd"));
        assert!(hash.to_base64().starts_with("z4PhNX7vuL3x"));
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let store = store();
        let key = key("Demo", "1.0.0");

        let first = store.put(&key, ArtifactKind::Package, b"one").await.unwrap();
        let again = store.put(&key, ArtifactKind::Package, b"one").await.unwrap();
        assert_eq!(first, again);

        let err = store
            .put(&key, ArtifactKind::Package, b"two")
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::Conflict { kind: ArtifactKind::Package, .. }));

        let stored = store.get(&key, ArtifactKind::Package).await.unwrap();
        assert_eq!(stored.as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        let key = key("Demo", "1.0.0");

        store.delete(&key).await.unwrap();
        store.put(&key, ArtifactKind::Package, b"pkg").await.unwrap();
        store.put(&key, ArtifactKind::Manifest, b"xml").await.unwrap();
        store.delete(&key).await.unwrap();

        for kind in ArtifactKind::ALL {
            assert!(store.get(&key, kind).await.unwrap().is_none());
        }
        store.delete(&key).await.unwrap();
    }
}
