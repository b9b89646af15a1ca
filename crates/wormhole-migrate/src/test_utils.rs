//! Test doubles for running the pipelines without containerd
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::runtime::{
    AnyValue, ContainerHandle, ContainerInfo, ContainerRuntime, Descriptor, ExitStatus, Image,
    Platform, RegistryAuth, RestoreOpts, TaskHandle, RUNTIME_SPEC_TYPE_URL,
};
use crate::store::Digest;
use crate::{MigrateError, Result};

pub fn has_ctr() -> bool {
    Command::new("ctr")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Host identifiers baked into a pod container's runtime spec
#[derive(Debug, Clone)]
pub struct PodIdentifiers {
    pub pod_uid: String,
    pub termination_id: String,
    pub sandbox_id: String,
    pub token: String,
    pub container_id: String,
    pub pid: u32,
}

impl PodIdentifiers {
    pub fn source() -> Self {
        Self {
            pod_uid: "0d3c1d2e-aaaa-4bbb-8ccc-111111111111".to_string(),
            termination_id: "9f8e7d6c".to_string(),
            sandbox_id: "5ad0b0c5".repeat(8),
            token: "x7k2p".to_string(),
            container_id: "c0ffee00".repeat(8),
            pid: 48213,
        }
    }

    pub fn destination() -> Self {
        Self {
            pod_uid: "7e6f5a4b-dddd-4eee-9fff-222222222222".to_string(),
            termination_id: "1a2b3c4d".to_string(),
            sandbox_id: "feedface".repeat(8),
            token: "q9w8e".to_string(),
            container_id: "deadbeef".repeat(8),
            pid: 7011,
        }
    }
}

/// Runtime spec of a Kubernetes pod container with the given identifiers
pub fn pod_spec(ids: &PodIdentifiers, workload: &str) -> Value {
    let kubelet_pod = format!("/var/lib/kubelet/pods/{}", ids.pod_uid);
    json!({
        "ociVersion": "1.1.0",
        "process": {
            "args": ["/bin/sh", "-c", "i=0; while true; do echo $i; i=$((i+1)); sleep 1; done"],
            "cwd": "/"
        },
        "root": {"path": "rootfs"},
        "mounts": [
            {
                "destination": "/etc/hosts",
                "type": "bind",
                "source": format!("{kubelet_pod}/etc-hosts"),
                "options": ["rbind", "rprivate", "rw"]
            },
            {
                "destination": "/dev/termination-log",
                "type": "bind",
                "source": format!("{kubelet_pod}/containers/{workload}/{}", ids.termination_id),
                "options": ["rbind", "rprivate", "rw"]
            },
            {
                "destination": "/etc/hostname",
                "type": "bind",
                "source": format!(
                    "/var/lib/containerd/io.containerd.grpc.v1.cri/sandboxes/{}/hostname",
                    ids.sandbox_id
                ),
                "options": ["rbind", "rprivate", "rw"]
            },
            {
                "destination": "/var/run/secrets/kubernetes.io/serviceaccount",
                "type": "bind",
                "source": format!(
                    "{kubelet_pod}/volumes/kubernetes.io~projected/kube-api-access-{}",
                    ids.token
                ),
                "options": ["rbind", "rprivate", "ro"]
            }
        ],
        "linux": {
            "cgroupsPath": format!("/kubepods/besteffort/pod{}/{}", ids.pod_uid, ids.container_id),
            "namespaces": [
                {"type": "pid"},
                {"type": "ipc", "path": format!("/proc/{}/ns/ipc", ids.pid)},
                {"type": "uts", "path": format!("/proc/{}/ns/uts", ids.pid)},
                {"type": "network", "path": format!("/proc/{}/ns/net", ids.pid)}
            ]
        }
    })
}

/// Store a checkpoint's spec blob and index under `root`, containerd layout
pub async fn seed_checkpoint(root: &Path, name: &str, spec: &[u8]) -> std::io::Result<(Image, Digest)> {
    let spec_digest = put_blob(root, spec).await?;
    let criu_digest = put_blob(root, b"criu image files").await?;
    let index = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.containerd.container.criu.checkpoint.criu.tar",
                "digest": criu_digest.to_string(),
                "size": 16
            },
            {
                "mediaType": "application/vnd.containerd.container.checkpoint.config.v1+proto",
                "digest": spec_digest.to_string(),
                "size": spec.len()
            }
        ]
    })
    .to_string()
    .into_bytes();
    let index_digest = put_blob(root, &index).await?;

    let image = Image {
        name: name.to_string(),
        target: Descriptor {
            media_type: "application/vnd.oci.image.index.v1+json".to_string(),
            digest: index_digest,
            size: index.len() as u64,
        },
    };
    Ok((image, spec_digest))
}

pub async fn put_blob(root: &Path, data: &[u8]) -> std::io::Result<Digest> {
    let digest = Digest::of(data);
    let path = digest.blob_path(root);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, data).await?;
    Ok(digest)
}

/// One call the mock runtime received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub call: &'static str,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Calls that fail with a runtime error
    pub fail_on: HashSet<&'static str>,
    /// Platforms `image_platforms` reports; empty means none declared
    pub platforms: Vec<Platform>,
    pub exit_code: u32,
    /// Calls that sleep before answering
    pub delays: HashMap<&'static str, Duration>,
}

/// Recording in-memory runtime
#[derive(Clone)]
pub struct MockRuntime {
    pub calls: Arc<Mutex<Vec<RuntimeCall>>>,
    pub behavior: Arc<RwLock<MockBehavior>>,
    containers: Arc<RwLock<HashMap<String, Value>>>,
    checkpoint_image: Image,
}

impl MockRuntime {
    /// `pull` and `checkpoint` hand out `checkpoint_image`
    pub fn new(checkpoint_image: Image) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(RwLock::new(MockBehavior::default())),
            containers: Arc::new(RwLock::new(HashMap::new())),
            checkpoint_image,
        }
    }

    pub async fn add_container(&self, id: &str, spec: Value) {
        self.containers.write().await.insert(id.to_string(), spec);
    }

    pub async fn fail_on(&self, call: &'static str) {
        self.behavior.write().await.fail_on.insert(call);
    }

    pub async fn delay_on(&self, call: &'static str, delay: Duration) {
        self.behavior.write().await.delays.insert(call, delay);
    }

    pub async fn set_platforms(&self, platforms: Vec<Platform>) {
        self.behavior.write().await.platforms = platforms;
    }

    pub async fn set_exit_code(&self, code: u32) {
        self.behavior.write().await.exit_code = code;
    }

    pub async fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().await.iter().map(|c| c.call).collect()
    }

    pub async fn was_called(&self, call: &str) -> bool {
        self.calls.lock().await.iter().any(|c| c.call == call)
    }

    async fn record(&self, call: &'static str, target: impl Into<String>) -> Result<()> {
        self.calls.lock().await.push(RuntimeCall {
            call,
            target: target.into(),
        });
        let (delay, fail) = {
            let behavior = self.behavior.read().await;
            (behavior.delays.get(call).copied(), behavior.fail_on.contains(call))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(MigrateError::runtime(call, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, image_ref: &str) -> Result<Image> {
        self.record("pull", image_ref).await?;
        Ok(self.checkpoint_image.clone())
    }

    async fn image_platforms(&self, image: &Image) -> Result<Vec<Platform>> {
        self.record("image_platforms", &image.name).await?;
        Ok(self.behavior.read().await.platforms.clone())
    }

    async fn unpack(&self, _image: &Image, platform: &Platform) -> Result<()> {
        self.record("unpack", platform.to_string()).await
    }

    async fn load_container(&self, id: &str) -> Result<ContainerInfo> {
        self.record("load_container", id).await?;
        let spec = self
            .containers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MigrateError::ContainerNotFound(id.to_string()))?;

        let mut record = serde_json::Map::new();
        record.insert("ID".to_string(), json!(id));
        record.insert("Image".to_string(), json!("registry.k8s.io/pause:3.9"));
        record.insert("Runtime".to_string(), json!({"Name": "io.containerd.runc.v2"}));
        Ok(ContainerInfo {
            id: id.to_string(),
            record,
            spec: Some(AnyValue {
                type_url: RUNTIME_SPEC_TYPE_URL.to_string(),
                value: serde_json::to_vec(&spec)
                    .map_err(|e| MigrateError::SpecDecode(e.to_string()))?,
            }),
        })
    }

    async fn restore(&self, name: &str, _checkpoint: &Image, _opts: RestoreOpts) -> Result<ContainerHandle> {
        self.record("restore", name).await?;
        Ok(ContainerHandle {
            id: name.to_string(),
        })
    }

    async fn new_task(&self, container: &ContainerHandle, _checkpoint: &Image) -> Result<TaskHandle> {
        self.record("new_task", &container.id).await?;
        Ok(TaskHandle {
            container_id: container.id.clone(),
            pid: 4242,
        })
    }

    async fn start(&self, task: &TaskHandle) -> Result<()> {
        self.record("start", &task.container_id).await
    }

    async fn kill(&self, task: &TaskHandle, signal: i32) -> Result<()> {
        self.record("kill", format!("{}:{signal}", task.container_id)).await
    }

    async fn wait(&self, task: &TaskHandle) -> Result<ExitStatus> {
        self.record("wait", &task.container_id).await?;
        Ok(ExitStatus {
            code: self.behavior.read().await.exit_code,
        })
    }

    async fn delete_task(&self, task: &TaskHandle) -> Result<()> {
        self.record("delete_task", &task.container_id).await
    }

    async fn delete_container(&self, container: &ContainerHandle) -> Result<()> {
        self.record("delete_container", &container.id).await
    }

    async fn checkpoint(&self, container_id: &str, image_name: &str) -> Result<Image> {
        self.record("checkpoint", format!("{container_id}:{image_name}")).await?;
        Ok(Image {
            name: image_name.to_string(),
            target: self.checkpoint_image.target.clone(),
        })
    }

    async fn push(&self, remote_ref: &str, _image: &Image, auth: Option<&RegistryAuth>) -> Result<()> {
        let target = match auth {
            Some(auth) => format!("{remote_ref} as {}", auth.user),
            None => remote_ref.to_string(),
        };
        self.record("push", target).await
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        self.record("delete_image", name).await
    }
}
