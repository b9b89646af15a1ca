//! Container runtime capability consumed by the migration pipelines
//!
//! The runtime's own checkpoint, restore, push and pull primitives are
//! opaque to this crate; [`ContainerRuntime`] names only the calls the
//! pipelines make. [`CtrRuntime`] drives containerd through its `ctr` CLI.

mod ctr;

pub use ctr::{CtrConfig, CtrRuntime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::store::Digest;
use crate::{MigrateError, Result};

/// Type URL containerd uses for a JSON-encoded OCI runtime spec.
pub const RUNTIME_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

/// Content descriptor of an image's root object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// An image known to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// Platform of the running host, in OCI naming
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
                })
            }
            _ => Err(MigrateError::runtime("platform", format!("invalid platform {s:?}"))),
        }
    }
}

/// A protobuf "any" value: a type URL plus the encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyValue {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// Metadata of an existing container as recorded by the runtime
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Container record without its spec
    pub record: serde_json::Map<String, serde_json::Value>,
    /// Runtime spec, still encoded
    pub spec: Option<AnyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub container_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
}

/// What a restore takes from the checkpoint image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOpts {
    pub image: bool,
    pub spec: bool,
    pub runtime: bool,
    pub rw: bool,
}

impl Default for RestoreOpts {
    fn default() -> Self {
        Self {
            image: true,
            spec: true,
            runtime: true,
            rw: true,
        }
    }
}

/// Registry credentials passed through to push
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub user: String,
    pub secret: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch an image into the local content store without unpacking it
    async fn pull(&self, image_ref: &str) -> Result<Image>;

    /// Platforms the image provides; empty when it declares none
    async fn image_platforms(&self, image: &Image) -> Result<Vec<Platform>>;

    async fn unpack(&self, image: &Image, platform: &Platform) -> Result<()>;

    /// Fails with [`MigrateError::ContainerNotFound`] for unknown ids
    async fn load_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Create container `name` from a checkpoint image
    async fn restore(&self, name: &str, checkpoint: &Image, opts: RestoreOpts)
        -> Result<ContainerHandle>;

    /// Create the container's task from the checkpointed process state
    async fn new_task(&self, container: &ContainerHandle, checkpoint: &Image) -> Result<TaskHandle>;

    async fn start(&self, task: &TaskHandle) -> Result<()>;

    async fn kill(&self, task: &TaskHandle, signal: i32) -> Result<()>;

    async fn wait(&self, task: &TaskHandle) -> Result<ExitStatus>;

    async fn delete_task(&self, task: &TaskHandle) -> Result<()>;

    async fn delete_container(&self, container: &ContainerHandle) -> Result<()>;

    /// Checkpoint a running container (runtime, rw layer and task) into a local image
    async fn checkpoint(&self, container_id: &str, image_name: &str) -> Result<Image>;

    async fn push(&self, remote_ref: &str, image: &Image, auth: Option<&RegistryAuth>) -> Result<()>;

    async fn delete_image(&self, name: &str) -> Result<()>;
}
