//! End-to-end restore and checkpoint pipelines against a recording runtime

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;
use wormhole_migrate::runtime::{ContainerRuntime, Image, Platform, RegistryAuth, TaskHandle};
use wormhole_migrate::test_utils::{pod_spec, seed_checkpoint, MockRuntime, PodIdentifiers};
use wormhole_migrate::{
    CheckpointPipeline, ContentStore, Digest, IdentifierKind, LocalContentStore, MigrateError,
    RestoreConfig, RestoreOrchestrator, RestoreStage, SpecDocument,
};

const CHECKPOINT_REF: &str = "docker.io/acme/ckpt:latest";
const PLACEHOLDER: &str = "placeholder";

struct Harness {
    _temp_dir: TempDir,
    runtime: MockRuntime,
    store: Arc<LocalContentStore>,
    spec_digest: Digest,
    original_spec: Vec<u8>,
}

impl Harness {
    async fn new() -> Self {
        let source = serde_json::to_vec(&pod_spec(&PodIdentifiers::source(), "workload")).unwrap();
        Self::with_destination(source, pod_spec(&PodIdentifiers::destination(), "workload")).await
    }

    async fn with_destination(source: Vec<u8>, destination: serde_json::Value) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let temp_dir = TempDir::new().unwrap();
        let (image, spec_digest) = seed_checkpoint(temp_dir.path(), CHECKPOINT_REF, &source)
            .await
            .unwrap();

        let runtime = MockRuntime::new(image);
        runtime.add_container(PLACEHOLDER, destination).await;
        let store = Arc::new(LocalContentStore::new(temp_dir.path()));

        Self {
            _temp_dir: temp_dir,
            runtime,
            store,
            spec_digest,
            original_spec: source,
        }
    }

    fn orchestrator(&self) -> RestoreOrchestrator {
        RestoreOrchestrator::new(Arc::new(self.runtime.clone()), self.store.clone())
    }

    async fn stored_spec(&self) -> Vec<u8> {
        self.store.read_blob(&self.spec_digest).await.unwrap()
    }
}

/// Store whose raw writes always fail, leaving the blob as it was
struct ReadOnlyStore(Arc<LocalContentStore>);

#[async_trait]
impl ContentStore for ReadOnlyStore {
    async fn read_blob(&self, digest: &Digest) -> wormhole_migrate::Result<Vec<u8>> {
        self.0.read_blob(digest).await
    }

    async fn blob_size(&self, digest: &Digest) -> wormhole_migrate::Result<u64> {
        self.0.blob_size(digest).await
    }

    async fn write_blob_raw(&self, digest: &Digest, _data: &[u8]) -> wormhole_migrate::Result<()> {
        Err(MigrateError::StoreWrite {
            digest: digest.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only store"),
        })
    }
}

fn configured() -> RestoreConfig {
    RestoreConfig {
        checkpoint_ref: Some(CHECKPOINT_REF.to_string()),
        ..RestoreConfig::default()
    }
}

#[tokio::test]
async fn test_restore_rewrites_spec_and_starts_task() {
    let harness = Harness::new().await;

    let outcome = harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap();

    assert_eq!(outcome.container.id, "alprestr");
    assert_eq!(outcome.spec.digest, harness.spec_digest);
    assert_eq!(outcome.report.substitutions.len(), 6);
    // the namespace pid is one digit shorter in three paths
    assert_eq!(outcome.report.padding, 3);

    let stored = harness.stored_spec().await;
    assert_eq!(stored.len(), harness.original_spec.len());
    let expected = serde_json::to_string(&pod_spec(&PodIdentifiers::destination(), "workload")).unwrap();
    assert_eq!(String::from_utf8(stored).unwrap().trim_end(), expected);

    assert_eq!(
        harness.runtime.call_names().await,
        vec![
            "pull",
            "image_platforms",
            "unpack",
            "load_container",
            "restore",
            "new_task",
            "start"
        ]
    );
}

#[tokio::test]
async fn test_missing_sandbox_in_destination_leaves_store_untouched() {
    let destination = serde_json::to_string(&pod_spec(&PodIdentifiers::destination(), "workload"))
        .unwrap()
        .replace("/sandboxes/", "/sandbox/");
    let source = serde_json::to_vec(&pod_spec(&PodIdentifiers::source(), "workload")).unwrap();
    let harness =
        Harness::with_destination(source, serde_json::from_str(&destination).unwrap()).await;

    let failure = harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Rewritten);
    assert!(!failure.store_mutated);
    assert!(matches!(
        failure.source,
        MigrateError::PatternNotMatched {
            rule_index: 2,
            rule: IdentifierKind::SandboxId,
            document: SpecDocument::Destination,
        }
    ));
    assert_eq!(harness.stored_spec().await, harness.original_spec);
    assert!(!harness.runtime.was_called("restore").await);
}

#[tokio::test]
async fn test_longer_destination_ids_abort_before_write() {
    let mut ids = PodIdentifiers::destination();
    ids.pid = 1_000_000;
    let harness = Harness::with_destination(
        serde_json::to_vec(&pod_spec(&PodIdentifiers::source(), "workload")).unwrap(),
        pod_spec(&ids, "workload"),
    )
    .await;

    let failure = harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Rewritten);
    assert!(matches!(failure.source, MigrateError::LengthOverflow { .. }));
    assert_eq!(harness.stored_spec().await, harness.original_spec);
}

#[tokio::test]
async fn test_write_failure_stops_before_restore() {
    let harness = Harness::new().await;
    let orchestrator = RestoreOrchestrator::new(
        Arc::new(harness.runtime.clone()),
        Arc::new(ReadOnlyStore(harness.store.clone())),
    );

    let failure = orchestrator
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Written);
    assert!(!failure.store_mutated);
    assert!(matches!(failure.source, MigrateError::StoreWrite { .. }));
    assert_eq!(harness.stored_spec().await, harness.original_spec);
    assert!(!harness.runtime.was_called("restore").await);
}

#[tokio::test]
async fn test_start_failure_cleans_up_after_write() {
    let harness = Harness::new().await;
    harness.runtime.fail_on("start").await;

    let failure = harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Started);
    assert!(failure.store_mutated);
    assert_ne!(harness.stored_spec().await, harness.original_spec);

    let calls = harness.runtime.calls().await;
    let cleanup: Vec<_> = calls
        .iter()
        .filter(|c| c.call.starts_with("delete_"))
        .map(|c| (c.call, c.target.as_str()))
        .collect();
    assert_eq!(
        cleanup,
        vec![("delete_task", "alprestr"), ("delete_container", "alprestr")]
    );
}

#[tokio::test]
async fn test_restore_failure_has_nothing_to_clean_up() {
    let harness = Harness::new().await;
    harness.runtime.fail_on("restore").await;

    let failure = harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Restored);
    assert!(failure.store_mutated);
    assert!(!harness.runtime.was_called("delete_container").await);
}

#[tokio::test]
async fn test_unconfigured_target_makes_no_runtime_calls() {
    let harness = Harness::new().await;

    let failure = harness
        .orchestrator()
        .restore(&RestoreConfig::default(), PLACEHOLDER)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.source,
        MigrateError::NotConfigured("checkpoint_ref")
    ));
    assert!(harness.runtime.calls().await.is_empty());
}

#[tokio::test]
async fn test_unpack_failure_is_not_fatal() {
    let harness = Harness::new().await;
    harness
        .runtime
        .set_platforms(vec![
            "linux/amd64".parse::<Platform>().unwrap(),
            "linux/arm64".parse::<Platform>().unwrap(),
        ])
        .await;
    harness.runtime.fail_on("unpack").await;

    harness
        .orchestrator()
        .restore(&configured(), PLACEHOLDER)
        .await
        .unwrap();

    let unpacked: Vec<_> = harness
        .runtime
        .calls()
        .await
        .into_iter()
        .filter(|c| c.call == "unpack")
        .map(|c| c.target)
        .collect();
    assert_eq!(unpacked, vec!["linux/amd64", "linux/arm64"]);
}

#[tokio::test]
async fn test_unknown_placeholder_fails_extraction() {
    let harness = Harness::new().await;

    let failure = harness
        .orchestrator()
        .restore(&configured(), "no-such-container")
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RestoreStage::Extracted);
    assert!(matches!(failure.source, MigrateError::ContainerNotFound(_)));
    assert_eq!(harness.stored_spec().await, harness.original_spec);
}

#[tokio::test]
async fn test_stop_sends_sigterm_and_waits() {
    let harness = Harness::new().await;
    harness.runtime.set_exit_code(143).await;
    let task = TaskHandle {
        container_id: "alprestr".to_string(),
        pid: 4242,
    };

    let status = harness.orchestrator().stop(&task).await.unwrap();

    assert_eq!(status.code, 143);
    let calls = harness.runtime.calls().await;
    assert_eq!(calls[0].target, format!("alprestr:{}", libc::SIGTERM));
    assert_eq!(calls[1].call, "wait");
}

#[tokio::test]
async fn test_checkpoint_pushes_and_removes_local_image() {
    let harness = Harness::new().await;
    let pipeline = CheckpointPipeline::new(Arc::new(harness.runtime.clone()));
    let auth = RegistryAuth {
        user: "acme".to_string(),
        secret: "token".to_string(),
    };

    pipeline
        .checkpoint(PLACEHOLDER, CHECKPOINT_REF, Some(&auth))
        .await
        .unwrap();

    let calls = harness.runtime.calls().await;
    let names: Vec<_> = calls.iter().map(|c| c.call).collect();
    assert_eq!(names, vec!["load_container", "checkpoint", "push", "delete_image"]);
    assert_eq!(calls[2].target, format!("{CHECKPOINT_REF} as acme"));
    assert_eq!(calls[3].target, "wrmcheckpt");
}

#[tokio::test]
async fn test_checkpoint_removes_local_image_when_push_fails() {
    let harness = Harness::new().await;
    harness.runtime.fail_on("push").await;
    let pipeline = CheckpointPipeline::new(Arc::new(harness.runtime.clone()));

    let err = pipeline
        .checkpoint(PLACEHOLDER, CHECKPOINT_REF, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Runtime { call: "push", .. }));
    assert!(harness.runtime.was_called("delete_image").await);
}

#[tokio::test]
async fn test_checkpoint_of_unknown_container() {
    let harness = Harness::new().await;
    let pipeline = CheckpointPipeline::new(Arc::new(harness.runtime.clone()));

    let err = pipeline
        .checkpoint("ghost", CHECKPOINT_REF, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::ContainerNotFound(_)));
    assert!(!harness.runtime.was_called("checkpoint").await);
}

#[tokio::test]
async fn test_mock_hands_out_seeded_image() {
    let harness = Harness::new().await;
    let image: Image = harness.runtime.pull(CHECKPOINT_REF).await.unwrap();
    assert_eq!(image.name, CHECKPOINT_REF);
}
