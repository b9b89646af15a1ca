//! Checkpoint-and-push for the source host

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::runtime::{ContainerRuntime, Image, RegistryAuth};
use crate::Result;

/// Local name of the checkpoint image while it is being pushed
pub const CHECKPOINT_IMAGE_NAME: &str = "wrmcheckpt";

pub struct CheckpointPipeline {
    runtime: Arc<dyn ContainerRuntime>,
}

impl CheckpointPipeline {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Checkpoint `container_id` (runtime, rw layer and task) and push it to
    /// `remote_ref`. The local checkpoint image is removed whether or not the
    /// push succeeds.
    #[instrument(skip(self, auth), fields(auth = auth.is_some()))]
    pub async fn checkpoint(
        &self,
        container_id: &str,
        remote_ref: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<()> {
        let container = self.runtime.load_container(container_id).await?;
        let image = self
            .runtime
            .checkpoint(&container.id, CHECKPOINT_IMAGE_NAME)
            .await?;
        info!(image = %image.name, digest = %image.target.digest, "container checkpointed");

        let pushed = self.push(remote_ref, &image, auth).await;

        if let Err(e) = self.runtime.delete_image(&image.name).await {
            warn!(image = %image.name, error = %e, "failed to delete local checkpoint image");
        }
        pushed
    }

    async fn push(&self, remote_ref: &str, image: &Image, auth: Option<&RegistryAuth>) -> Result<()> {
        self.runtime.push(remote_ref, image, auth).await?;
        info!(remote_ref, "checkpoint pushed");
        Ok(())
    }
}
