//! Restore pipeline for the destination host
//!
//! `Pulled -> Located/Extracted -> Rewritten -> Written -> Restored -> Started`
//!
//! Locating the spec blob and extracting the placeholder's spec run
//! concurrently and join before the rewrite. The full patch is computed
//! before anything is written, so a failure up to and including
//! `Rewritten` leaves the content store untouched. Once `Written`
//! succeeds the checkpoint's spec blob has been consumed: retrying from a
//! fresh pull would read the patched bytes back, so a failed attempt is not
//! retried here.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use wormhole_common::WormholeError;

use crate::extractor::DestinationSpecExtractor;
use crate::locator::{BlobLocator, SpecLocation};
use crate::rewrite::{RewriteReport, RuleSet};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ExitStatus, Image, Platform, RestoreOpts, TaskHandle,
};
use crate::store::ContentStore;
use crate::writer::BlobWriter;
use crate::MigrateError;

/// Default name of the restored container
pub const DEFAULT_CONTAINER_NAME: &str = "alprestr";
/// Default name of the workload container inside the placeholder pod
pub const DEFAULT_WORKLOAD_NAME: &str = "workload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Pulled,
    Located,
    Extracted,
    Rewritten,
    Written,
    Restored,
    Started,
}

impl RestoreStage {
    /// Whether the spec blob has been overwritten once this stage is reached
    pub fn store_mutated(self) -> bool {
        matches!(self, RestoreStage::Restored | RestoreStage::Started)
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Pulled => "pulled",
            RestoreStage::Located => "located",
            RestoreStage::Extracted => "extracted",
            RestoreStage::Rewritten => "rewritten",
            RestoreStage::Written => "written",
            RestoreStage::Restored => "restored",
            RestoreStage::Started => "started",
        };
        f.write_str(name)
    }
}

/// Migration target for one restore attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    /// Checkpoint image to restore; must be set before a restore runs
    pub checkpoint_ref: Option<String>,
    /// Name given to the restored container
    pub container_name: String,
    /// Workload container name, part of the termination-log path
    pub workload_name: String,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_ref: None,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            workload_name: DEFAULT_WORKLOAD_NAME.to_string(),
        }
    }
}

/// A restore attempt that did not reach `Started`
#[derive(Error, Debug)]
#[error("Restore failed at stage '{stage}' (store mutated: {store_mutated}): {source}")]
pub struct StageFailure {
    /// Stage that was being entered when the attempt failed
    pub stage: RestoreStage,
    /// True once the checkpoint's spec blob has been overwritten
    pub store_mutated: bool,
    #[source]
    pub source: MigrateError,
}

impl StageFailure {
    fn at(stage: RestoreStage) -> impl FnOnce(MigrateError) -> StageFailure {
        move |source| StageFailure {
            stage,
            store_mutated: stage.store_mutated(),
            source,
        }
    }
}

impl From<StageFailure> for WormholeError {
    fn from(failure: StageFailure) -> Self {
        let message = failure.to_string();
        match WormholeError::from(failure.source) {
            WormholeError::NotConfigured(_) => WormholeError::NotConfigured(message),
            WormholeError::NotFound(_) => WormholeError::NotFound(message),
            WormholeError::Rewrite(_) => WormholeError::Rewrite(message),
            WormholeError::Runtime(_) => WormholeError::Runtime(message),
            WormholeError::Store(_) => WormholeError::Store(message),
            _ => WormholeError::Internal(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub container: ContainerHandle,
    pub task: TaskHandle,
    pub spec: SpecLocation,
    pub report: RewriteReport,
}

pub struct RestoreOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ContentStore>,
    locator: BlobLocator,
    extractor: DestinationSpecExtractor,
    writer: BlobWriter,
}

impl RestoreOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<dyn ContentStore>) -> Self {
        Self {
            locator: BlobLocator::new(store.clone()),
            extractor: DestinationSpecExtractor::new(runtime.clone()),
            writer: BlobWriter::new(store.clone()),
            runtime,
            store,
        }
    }

    /// Restore the configured checkpoint into a new container, taking the
    /// host identifiers from the placeholder container `placeholder_id`.
    ///
    /// Dropping the returned future between stages abandons the attempt;
    /// a blob write already in progress still runs to completion.
    #[instrument(skip(self, config), fields(checkpoint = ?config.checkpoint_ref, container = %config.container_name))]
    pub async fn restore(
        &self,
        config: &RestoreConfig,
        placeholder_id: &str,
    ) -> Result<RestoreOutcome, StageFailure> {
        let checkpoint_ref = config
            .checkpoint_ref
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(MigrateError::NotConfigured("checkpoint_ref"))
            .map_err(StageFailure::at(RestoreStage::Pulled))?;

        let result = self.run(config, checkpoint_ref, placeholder_id).await;
        if let Err(failure) = &result {
            error!(
                stage = %failure.stage,
                store_mutated = failure.store_mutated,
                error = %failure.source,
                "restore failed"
            );
        }
        result
    }

    async fn run(
        &self,
        config: &RestoreConfig,
        checkpoint_ref: &str,
        placeholder_id: &str,
    ) -> Result<RestoreOutcome, StageFailure> {
        let image = self
            .pull(checkpoint_ref)
            .await
            .map_err(StageFailure::at(RestoreStage::Pulled))?;
        info!(stage = %RestoreStage::Pulled, image = %image.name, "checkpoint pulled");

        let locate = async {
            let location = self
                .locator
                .locate(&image)
                .await
                .map_err(StageFailure::at(RestoreStage::Located))?;
            let spec = self
                .store
                .read_blob(&location.digest)
                .await
                .map_err(StageFailure::at(RestoreStage::Located))?;
            Ok::<_, StageFailure>((location, spec))
        };
        let extract = async {
            self.extractor
                .extract(placeholder_id)
                .await
                .map_err(StageFailure::at(RestoreStage::Extracted))
        };
        let ((location, source_spec), destination) = futures::try_join!(locate, extract)?;
        info!(stage = %RestoreStage::Extracted, spec = %location.digest, "spec blob located and destination spec extracted");

        let capacity = usize::try_from(location.size).unwrap_or(usize::MAX);
        let patched = RuleSet::kubernetes(&config.workload_name)
            .and_then(|rules| rules.rewrite_within(&source_spec, &destination, capacity))
            .map_err(StageFailure::at(RestoreStage::Rewritten))?;
        info!(
            stage = %RestoreStage::Rewritten,
            substitutions = patched.report.substitutions.len(),
            padding = patched.report.padding,
            "checkpoint spec rewritten"
        );

        // Nothing is written until every rule has been applied
        self.writer
            .write(&location.digest, &patched)
            .await
            .map_err(StageFailure::at(RestoreStage::Written))?;
        info!(stage = %RestoreStage::Written, digest = %location.digest, "spec blob overwritten");

        let container = self
            .runtime
            .restore(&config.container_name, &image, RestoreOpts::default())
            .await
            .map_err(StageFailure::at(RestoreStage::Restored))?;
        info!(stage = %RestoreStage::Restored, container = %container.id, "container restored");

        let task = match self.start_task(&container, &image).await {
            Ok(task) => task,
            Err((task, failure)) => {
                self.cleanup(&container, task.as_ref()).await;
                return Err(failure);
            }
        };
        info!(stage = %RestoreStage::Started, pid = task.pid, "restored task started");

        Ok(RestoreOutcome {
            container,
            task,
            spec: location,
            report: patched.report,
        })
    }

    /// Pull and unpack; unpack failures are logged and skipped
    async fn pull(&self, checkpoint_ref: &str) -> crate::Result<Image> {
        let image = self.runtime.pull(checkpoint_ref).await?;

        let mut platforms = match self.runtime.image_platforms(&image).await {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!(error = %e, "could not list checkpoint platforms");
                Vec::new()
            }
        };
        if platforms.is_empty() {
            platforms.push(Platform::host());
        }
        for platform in &platforms {
            if let Err(e) = self.runtime.unpack(&image, platform).await {
                warn!(%platform, error = %e, "unpack failed, continuing");
            }
        }
        Ok(image)
    }

    async fn start_task(
        &self,
        container: &ContainerHandle,
        image: &Image,
    ) -> Result<TaskHandle, (Option<TaskHandle>, StageFailure)> {
        let task = self
            .runtime
            .new_task(container, image)
            .await
            .map_err(|e| (None, StageFailure::at(RestoreStage::Started)(e)))?;
        match self.runtime.start(&task).await {
            Ok(()) => Ok(task),
            Err(e) => Err((Some(task), StageFailure::at(RestoreStage::Started)(e))),
        }
    }

    /// Release what this attempt created; the placeholder and the rewritten
    /// blob are left alone.
    async fn cleanup(&self, container: &ContainerHandle, task: Option<&TaskHandle>) {
        if let Some(task) = task {
            if let Err(e) = self.runtime.delete_task(task).await {
                warn!(container = %container.id, error = %e, "failed to delete task");
            }
        }
        if let Err(e) = self.runtime.delete_container(container).await {
            warn!(container = %container.id, error = %e, "failed to delete container");
        }
    }

    /// SIGTERM a restored task and wait for it to exit
    #[instrument(skip(self), fields(container = %task.container_id))]
    pub async fn stop(&self, task: &TaskHandle) -> crate::Result<ExitStatus> {
        self.runtime.kill(task, libc::SIGTERM).await?;
        let status = self.runtime.wait(task).await?;
        info!(code = status.code, "task exited");
        Ok(status)
    }
}
