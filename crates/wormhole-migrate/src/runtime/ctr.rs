use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, instrument, warn};

use super::{
    AnyValue, ContainerHandle, ContainerInfo, ContainerRuntime, Descriptor, ExitStatus, Image,
    Platform, RegistryAuth, RestoreOpts, TaskHandle, RUNTIME_SPEC_TYPE_URL,
};
use crate::{MigrateError, Result};

/// containerd integration through the `ctr` client binary
pub struct CtrRuntime {
    config: CtrConfig,
}

#[derive(Debug, Clone)]
pub struct CtrConfig {
    pub binary_path: PathBuf,
    pub namespace: String,
    /// containerd socket; `ctr`'s default when unset
    pub address: Option<PathBuf>,
    /// How often `wait` polls the task list
    pub poll_interval: Duration,
}

impl Default for CtrConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("ctr"),
            namespace: "k8s.io".to_string(),
            address: None,
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageListing {
    image: Image,
    platforms: Vec<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskListing {
    pid: u32,
    status: String,
}

impl CtrRuntime {
    pub fn new(config: CtrConfig) -> Self {
        info!(
            binary = ?config.binary_path,
            namespace = %config.namespace,
            "ctr runtime initialized"
        );
        Self { config }
    }

    pub fn config(&self) -> &CtrConfig {
        &self.config
    }

    fn command(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.config.binary_path);
        if let Some(address) = &self.config.address {
            cmd.arg("--address").arg(address);
        }
        cmd.arg("--namespace").arg(&self.config.namespace);
        cmd
    }

    /// Run a ctr command, returning its stdout
    async fn run(&self, call: &'static str, mut cmd: AsyncCommand) -> Result<String> {
        debug!(call, "ctr command: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| MigrateError::runtime(call, format!("failed to run ctr: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(call, "ctr failed: {}", stderr.trim());
            return Err(MigrateError::runtime(call, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn find_image(&self, call: &'static str, name: &str) -> Result<ImageListing> {
        let mut cmd = self.command();
        cmd.args(["images", "ls"]).arg(format!("name=={name}"));
        let stdout = self.run(call, cmd).await?;
        parse_image_listing(&stdout, name)?
            .ok_or_else(|| MigrateError::runtime(call, format!("image {name} not listed")))
    }

    async fn find_task(&self, call: &'static str, container_id: &str) -> Result<Option<TaskListing>> {
        let mut cmd = self.command();
        cmd.args(["tasks", "ls"]);
        let stdout = self.run(call, cmd).await?;
        Ok(parse_task_listing(&stdout, container_id))
    }
}

#[async_trait]
impl ContainerRuntime for CtrRuntime {
    #[instrument(skip(self))]
    async fn pull(&self, image_ref: &str) -> Result<Image> {
        let mut cmd = self.command();
        cmd.args(["content", "fetch"]).arg(image_ref);
        self.run("pull", cmd).await?;
        Ok(self.find_image("pull", image_ref).await?.image)
    }

    async fn image_platforms(&self, image: &Image) -> Result<Vec<Platform>> {
        Ok(self.find_image("image_platforms", &image.name).await?.platforms)
    }

    #[instrument(skip(self, image), fields(image = %image.name))]
    async fn unpack(&self, image: &Image, platform: &Platform) -> Result<()> {
        // Content is already local; pull only unpacks the snapshot layers
        let mut cmd = self.command();
        cmd.args(["images", "pull", "--platform"])
            .arg(platform.to_string())
            .arg(&image.name);
        self.run("unpack", cmd).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_container(&self, id: &str) -> Result<ContainerInfo> {
        let mut cmd = self.command();
        cmd.args(["containers", "info"]).arg(id);
        let stdout = match self.run("load_container", cmd).await {
            Ok(stdout) => stdout,
            Err(MigrateError::Runtime { message, .. }) if message.contains("not found") => {
                return Err(MigrateError::ContainerNotFound(id.to_string()));
            }
            Err(e) => return Err(e),
        };
        parse_container_info(id, &stdout)
    }

    /// `ctr containers restore --live` restores the container, creates its
    /// task from the checkpoint and starts it in one call; `new_task` and
    /// `start` then only look up and verify that task.
    #[instrument(skip(self, checkpoint), fields(checkpoint = %checkpoint.name))]
    async fn restore(
        &self,
        name: &str,
        checkpoint: &Image,
        opts: RestoreOpts,
    ) -> Result<ContainerHandle> {
        if !(opts.image && opts.spec && opts.runtime) {
            warn!(?opts, "ctr always restores image, spec and runtime from the checkpoint");
        }
        let mut cmd = self.command();
        cmd.args(["containers", "restore", "--live"]);
        if opts.rw {
            cmd.arg("--rw");
        }
        cmd.arg(name).arg(&checkpoint.name);
        self.run("restore", cmd).await?;
        Ok(ContainerHandle {
            id: name.to_string(),
        })
    }

    async fn new_task(&self, container: &ContainerHandle, _checkpoint: &Image) -> Result<TaskHandle> {
        let task = self
            .find_task("new_task", &container.id)
            .await?
            .ok_or_else(|| {
                MigrateError::runtime("new_task", format!("no task for container {}", container.id))
            })?;
        Ok(TaskHandle {
            container_id: container.id.clone(),
            pid: task.pid,
        })
    }

    async fn start(&self, task: &TaskHandle) -> Result<()> {
        let listing = self.find_task("start", &task.container_id).await?;
        match listing.as_ref().map(|t| t.status.as_str()) {
            Some("RUNNING") => {
                debug!(container = %task.container_id, "task already running");
                Ok(())
            }
            Some("CREATED") => {
                let mut cmd = self.command();
                cmd.args(["tasks", "start", "--detach"]).arg(&task.container_id);
                self.run("start", cmd).await?;
                Ok(())
            }
            Some(status) => Err(MigrateError::runtime(
                "start",
                format!("task {} is {status}", task.container_id),
            )),
            None => Err(MigrateError::runtime(
                "start",
                format!("task {} disappeared", task.container_id),
            )),
        }
    }

    async fn kill(&self, task: &TaskHandle, signal: i32) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["tasks", "kill", "--signal"])
            .arg(signal.to_string())
            .arg(&task.container_id);
        self.run("kill", cmd).await?;
        Ok(())
    }

    /// Polls until the task stops, then deletes it; `ctr tasks delete`
    /// exits with the task's exit code.
    async fn wait(&self, task: &TaskHandle) -> Result<ExitStatus> {
        loop {
            match self.find_task("wait", &task.container_id).await? {
                Some(t) if t.status != "STOPPED" => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                _ => break,
            }
        }

        let mut cmd = self.command();
        cmd.args(["tasks", "delete"]).arg(&task.container_id);
        let output = cmd
            .output()
            .await
            .map_err(|e| MigrateError::runtime("wait", format!("failed to run ctr: {e}")))?;
        let code = output
            .status
            .code()
            .ok_or_else(|| MigrateError::runtime("wait", "ctr terminated by signal"))?;
        Ok(ExitStatus { code: code as u32 })
    }

    async fn delete_task(&self, task: &TaskHandle) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["tasks", "delete", "--force"]).arg(&task.container_id);
        match self.run("delete_task", cmd).await {
            Err(MigrateError::Runtime { message, .. }) if message.contains("not found") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn delete_container(&self, container: &ContainerHandle) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["containers", "delete"]).arg(&container.id);
        match self.run("delete_container", cmd).await {
            Err(MigrateError::Runtime { message, .. }) if message.contains("not found") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    #[instrument(skip(self))]
    async fn checkpoint(&self, container_id: &str, image_name: &str) -> Result<Image> {
        let mut cmd = self.command();
        cmd.args(["containers", "checkpoint", "--rw", "--task"])
            .arg(container_id)
            .arg(image_name);
        self.run("checkpoint", cmd).await?;
        Ok(self.find_image("checkpoint", image_name).await?.image)
    }

    #[instrument(skip(self, image, auth), fields(image = %image.name))]
    async fn push(&self, remote_ref: &str, image: &Image, auth: Option<&RegistryAuth>) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["images", "push"]);
        if let Some(auth) = auth {
            cmd.arg("--user").arg(format!("{}:{}", auth.user, auth.secret));
        }
        cmd.arg(remote_ref).arg(&image.name);
        self.run("push", cmd).await?;
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["images", "rm"]).arg(name);
        self.run("delete_image", cmd).await?;
        Ok(())
    }
}

/// Find `name` in `ctr images ls` output.
///
/// Columns are `REF TYPE DIGEST SIZE PLATFORMS LABELS`, where SIZE is two
/// whitespace-separated tokens (`4.7 KiB`) and PLATFORMS is `-` when the
/// image declares none.
fn parse_image_listing(stdout: &str, name: &str) -> Result<Option<ImageListing>> {
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 || tokens[0] != name {
            continue;
        }
        let digest = tokens[2].parse()?;
        let size = parse_size(tokens[3], tokens[4]);
        let platforms = tokens
            .get(5)
            .filter(|p| **p != "-")
            .map(|p| p.split(',').filter_map(|p| p.parse().ok()).collect())
            .unwrap_or_default();

        return Ok(Some(ImageListing {
            image: Image {
                name: name.to_string(),
                target: Descriptor {
                    media_type: tokens[1].to_string(),
                    digest,
                    size,
                },
            },
            platforms,
        }));
    }
    Ok(None)
}

fn parse_size(value: &str, unit: &str) -> u64 {
    let multiplier: f64 = match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    value
        .parse::<f64>()
        .map(|v| (v * multiplier).round() as u64)
        .unwrap_or(0)
}

/// Find a container's task in `ctr tasks ls` output (`TASK PID STATUS`)
fn parse_task_listing(stdout: &str, container_id: &str) -> Option<TaskListing> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(id), Some(pid), Some(status)) if id == container_id => Some(TaskListing {
                pid: pid.parse().ok()?,
                status: status.to_string(),
            }),
            _ => None,
        }
    })
}

/// `ctr containers info` prints the container record with its spec already
/// decoded under `Spec`. Split the spec back out as the encoded value the
/// runtime stores.
fn parse_container_info(id: &str, stdout: &str) -> Result<ContainerInfo> {
    let value: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| MigrateError::runtime("load_container", format!("bad container info: {e}")))?;
    let serde_json::Value::Object(mut record) = value else {
        return Err(MigrateError::runtime(
            "load_container",
            "container info is not an object",
        ));
    };

    let spec = match record.remove("Spec") {
        None | Some(serde_json::Value::Null) => None,
        Some(spec) => Some(AnyValue {
            type_url: RUNTIME_SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(&spec).map_err(|e| {
                MigrateError::runtime("load_container", format!("re-encoding spec: {e}"))
            })?,
        }),
    };

    Ok(ContainerInfo {
        id: id.to_string(),
        record,
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:5b0bcabd1ed22e9fb1310cf6c2dec7cdef19f0ad69efa1f392e94a4333501270";

    #[test]
    fn test_parse_image_listing() {
        let stdout = format!(
            "REF TYPE DIGEST SIZE PLATFORMS LABELS\n\
             docker.io/library/alpine:latest application/vnd.oci.image.index.v1+json {DIGEST} 3.3 MiB linux/amd64,linux/arm64/v8 -\n\
             docker.io/acme/ckpt:latest application/vnd.oci.image.index.v1+json {DIGEST} 4.7 KiB - -\n"
        );

        let alpine = parse_image_listing(&stdout, "docker.io/library/alpine:latest")
            .unwrap()
            .unwrap();
        assert_eq!(alpine.image.target.digest.to_string(), DIGEST);
        assert_eq!(alpine.image.target.size, 3460301);
        assert_eq!(alpine.platforms.len(), 2);
        assert_eq!(alpine.platforms[1].variant.as_deref(), Some("v8"));

        let ckpt = parse_image_listing(&stdout, "docker.io/acme/ckpt:latest")
            .unwrap()
            .unwrap();
        assert!(ckpt.platforms.is_empty());
        assert_eq!(ckpt.image.target.size, 4813);

        assert!(parse_image_listing(&stdout, "missing").unwrap().is_none());
    }

    #[test]
    fn test_parse_task_listing() {
        let stdout = "TASK      PID     STATUS\nalprestr  4242    RUNNING\nother     17      STOPPED\n";
        let task = parse_task_listing(stdout, "alprestr").unwrap();
        assert_eq!(task.pid, 4242);
        assert_eq!(task.status, "RUNNING");
        assert!(parse_task_listing(stdout, "absent").is_none());
    }

    #[test]
    fn test_parse_container_info_splits_spec() {
        let stdout = r#"{"ID":"abc","Labels":{"io.kubernetes.pod.uid":"BBB-222"},"Spec":{"ociVersion":"1.1.0","hostname":"web"}}"#;
        let info = parse_container_info("abc", stdout).unwrap();

        assert_eq!(info.id, "abc");
        assert!(info.record.contains_key("Labels"));
        assert!(!info.record.contains_key("Spec"));

        let spec = info.spec.unwrap();
        assert_eq!(spec.type_url, RUNTIME_SPEC_TYPE_URL);
        let decoded: serde_json::Value = serde_json::from_slice(&spec.value).unwrap();
        assert_eq!(decoded["hostname"], "web");
    }

    #[test]
    fn test_parse_container_info_rejects_garbage() {
        assert!(parse_container_info("abc", "not json").is_err());
        assert!(parse_container_info("abc", "[1,2]").is_err());
    }
}
