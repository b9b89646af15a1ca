use std::sync::Arc;
use tracing::{info, instrument};

use crate::rewrite::PatchedSpec;
use crate::store::{ContentStore, Digest};
use crate::Result;

/// Writes patched specs back over the checkpoint's spec blob
pub struct BlobWriter {
    store: Arc<dyn ContentStore>,
}

impl BlobWriter {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// After this returns the blob no longer hashes to `digest`.
    #[instrument(skip(self, patched), fields(bytes = patched.bytes.len()))]
    pub async fn write(&self, digest: &Digest, patched: &PatchedSpec) -> Result<()> {
        self.store.write_blob_raw(digest, &patched.bytes).await?;
        info!(padding = patched.report.padding, "patched spec written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::RewriteReport;
    use crate::store::LocalContentStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_replaces_blob_under_same_key() {
        let temp_dir = TempDir::new().unwrap();
        let digest = Digest::of(b"/pods/AAA/etc-hosts");
        let path = digest.blob_path(temp_dir.path());
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"/pods/AAA/etc-hosts").await.unwrap();

        let store = Arc::new(LocalContentStore::new(temp_dir.path()));
        let writer = BlobWriter::new(store.clone());
        let patched = PatchedSpec {
            bytes: b"/pods/BB/etc-hosts ".to_vec(),
            report: RewriteReport {
                substitutions: Vec::new(),
                original_len: 19,
                padding: 1,
            },
        };
        writer.write(&digest, &patched).await.unwrap();

        assert_eq!(store.read_blob(&digest).await.unwrap(), patched.bytes);
    }
}
