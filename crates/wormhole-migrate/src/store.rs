//! Content-addressed blob store, laid out the way containerd keeps it on disk
//!
//! Blobs live at `<root>/blobs/<algorithm>/<hex>`. Besides reads, the store
//! exposes a raw overwrite that deliberately bypasses digest computation:
//! after [`ContentStore::write_blob_raw`] the bytes under a key no longer
//! hash to that key. Anything downstream that verifies digests will see a
//! mismatch for that blob.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::{MigrateError, Result};

const SHA256: &str = "sha256";
const SHA256_HEX_LEN: usize = 64;

/// Default location of containerd's content store.
pub const CONTAINERD_CONTENT_ROOT: &str = "/var/lib/containerd/io.containerd.content.v1.content";

/// Content digest (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Digest of `data`, the way the store would key it on ingestion
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: SHA256.to_string(),
            hex: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Blob path relative to a content store root
    pub fn blob_path(&self, root: &Path) -> PathBuf {
        root.join("blobs").join(&self.algorithm).join(&self.hex)
    }
}

impl FromStr for Digest {
    type Err = MigrateError;

    /// Accepts `sha256:<hex>` or bare hex, which is taken to be sha256.
    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').unwrap_or((SHA256, s));
        if algorithm != SHA256
            || hex.len() != SHA256_HEX_LEN
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(MigrateError::InvalidDigest(s.to_string()));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Storage backend trait for the blobs a restore reads and patches
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Retrieve a blob by digest
    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Get blob size without fetching content
    async fn blob_size(&self, digest: &Digest) -> Result<u64>;

    /// Overwrite the bytes stored under `digest` without recomputing it.
    ///
    /// Breaks the digest-to-content invariant for this blob.
    async fn write_blob_raw(&self, digest: &Digest, data: &[u8]) -> Result<()>;
}

/// Content store backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_error(digest: &Digest, err: std::io::Error) -> MigrateError {
        if err.kind() == std::io::ErrorKind::NotFound {
            MigrateError::BlobNotFound(digest.to_string())
        } else {
            MigrateError::StoreRead {
                digest: digest.to_string(),
                source: err,
            }
        }
    }
}

impl Default for LocalContentStore {
    fn default() -> Self {
        Self::new(CONTAINERD_CONTENT_ROOT)
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = digest.blob_path(&self.root);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::read_error(digest, e))?;
        debug!(%digest, bytes = data.len(), "read blob");
        Ok(data)
    }

    async fn blob_size(&self, digest: &Digest) -> Result<u64> {
        let path = digest.blob_path(&self.root);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::read_error(digest, e))?;
        Ok(meta.len())
    }

    async fn write_blob_raw(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = digest.blob_path(&self.root);
        let data = data.to_vec();
        let key = digest.to_string();

        // Runs to completion even if the caller stops polling, so the blob
        // is either fully replaced or untouched.
        tokio::task::spawn_blocking(move || replace_file(&path, &data))
            .await
            .map_err(|e| MigrateError::StoreWrite {
                digest: key.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|source| MigrateError::StoreWrite {
                digest: key.clone(),
                source,
            })?;

        warn!(digest = %key, "blob overwritten in place, stored bytes no longer match their digest");
        Ok(())
    }
}

/// Replace `path` with `data` via a sibling temp file and rename.
fn replace_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "blob path has no parent")
    })?;
    let permissions = std::fs::metadata(path)?.permissions();

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.as_file().set_permissions(permissions)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
