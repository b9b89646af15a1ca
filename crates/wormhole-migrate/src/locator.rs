//! Finds the blob holding a checkpoint's runtime spec

use regex::bytes::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, instrument};

use crate::runtime::Image;
use crate::store::{ContentStore, Digest};
use crate::{MigrateError, Result};

/// Media type fragment marking the checkpoint configuration entry.
pub const CHECKPOINT_CONFIG_MARKER: &str = "checkpoint.config";

static CONFIG_DIGEST_PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> =
    OnceLock::new();

/// Fallback for manifests that are not well-formed JSON: the digest that
/// follows the marker, bounded by the next two colons and a quote.
fn config_digest_pattern() -> Result<&'static Regex> {
    CONFIG_DIGEST_PATTERN
        .get_or_init(|| Regex::new(r#"checkpoint\.config[^:]*:[^:]*:([^"]*)""#))
        .as_ref()
        .map_err(|e| MigrateError::InvalidPattern(e.clone()))
}

/// Where a checkpoint's spec blob lives in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecLocation {
    pub digest: Digest,
    /// Size of the blob as stored, the capacity a rewrite must fit in
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    manifests: Vec<ManifestEntry>,
    #[serde(default)]
    layers: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    digest: String,
}

pub struct BlobLocator {
    store: Arc<dyn ContentStore>,
}

impl BlobLocator {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, image), fields(image = %image.name, manifest = %image.target.digest))]
    pub async fn locate(&self, image: &Image) -> Result<SpecLocation> {
        let manifest = self.store.read_blob(&image.target.digest).await?;
        let digest = find_spec_digest(&manifest).ok_or_else(|| {
            MigrateError::BlobNotFound(format!(
                "no {CHECKPOINT_CONFIG_MARKER} entry in manifest {}",
                image.target.digest
            ))
        })??;
        let size = self.store.blob_size(&digest).await?;

        debug!(%digest, size, "located checkpoint spec blob");
        Ok(SpecLocation { digest, size })
    }
}

/// Digest of the checkpoint config entry in a manifest or index.
///
/// `None` when the manifest has no such entry; `Some(Err(_))` when it does
/// but the digest is malformed.
pub fn find_spec_digest(manifest: &[u8]) -> Option<Result<Digest>> {
    if let Ok(doc) = serde_json::from_slice::<ManifestDocument>(manifest) {
        if let Some(entry) = doc
            .manifests
            .iter()
            .chain(doc.layers.iter())
            .find(|e| e.media_type.contains(CHECKPOINT_CONFIG_MARKER))
        {
            return Some(entry.digest.parse());
        }
    }

    let pattern = match config_digest_pattern() {
        Ok(pattern) => pattern,
        Err(e) => return Some(Err(e)),
    };
    let captures = pattern.captures(manifest)?;
    let raw = String::from_utf8_lossy(&captures[1]).into_owned();
    Some(raw.parse())
}
