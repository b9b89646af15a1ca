//! Rebuilds the placeholder container's runtime spec as one document

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::runtime::{AnyValue, ContainerInfo, ContainerRuntime};
use crate::{MigrateError, Result};

/// Type URL suffix of a JSON-encoded OCI runtime spec
const RUNTIME_SPEC_TYPE_SUFFIX: &str = "opencontainers/runtime-spec/1/Spec";

pub struct DestinationSpecExtractor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DestinationSpecExtractor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Container record with its decoded spec under `Spec`, serialized.
    #[instrument(skip(self))]
    pub async fn extract(&self, container_id: &str) -> Result<Vec<u8>> {
        let info = self.runtime.load_container(container_id).await?;
        let document = build_destination_document(info)?;
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| MigrateError::SpecDecode(format!("serializing destination spec: {e}")))?;
        debug!(bytes = bytes.len(), "destination spec extracted");
        Ok(bytes)
    }
}

/// Decode a stored spec payload into its document form
pub fn decode_spec(spec: &AnyValue) -> Result<Value> {
    if !spec.type_url.ends_with(RUNTIME_SPEC_TYPE_SUFFIX) {
        return Err(MigrateError::SpecDecode(format!(
            "unsupported spec type {}",
            spec.type_url
        )));
    }
    serde_json::from_slice(&spec.value)
        .map_err(|e| MigrateError::SpecDecode(format!("invalid runtime spec: {e}")))
}

pub fn build_destination_document(info: ContainerInfo) -> Result<Value> {
    let spec = info
        .spec
        .as_ref()
        .ok_or_else(|| MigrateError::SpecDecode(format!("container {} has no spec", info.id)))?;
    let spec = decode_spec(spec)?;

    let mut record = info.record;
    record.insert("Spec".to_string(), spec);
    Ok(Value::Object(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RUNTIME_SPEC_TYPE_URL;
    use serde_json::json;

    fn info(spec: Option<AnyValue>) -> ContainerInfo {
        let record = json!({
            "ID": "placeholder",
            "Image": "registry.k8s.io/pause:3.9",
            "Labels": {"io.kubernetes.pod.uid": "BBB-222"}
        });
        let Value::Object(record) = record else {
            unreachable!()
        };
        ContainerInfo {
            id: "placeholder".to_string(),
            record,
            spec,
        }
    }

    fn spec_any(spec: &Value) -> AnyValue {
        AnyValue {
            type_url: RUNTIME_SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(spec).unwrap(),
        }
    }

    #[test]
    fn test_document_embeds_decoded_spec() {
        let spec = json!({"mounts": [{"source": "/var/lib/kubelet/pods/BBB-222/etc-hosts"}]});
        let doc = build_destination_document(info(Some(spec_any(&spec)))).unwrap();

        assert_eq!(doc["ID"], "placeholder");
        assert_eq!(doc["Spec"], spec);
        let text = serde_json::to_string(&doc).unwrap();
        assert!(text.contains("/pods/BBB-222/etc-hosts"));
    }

    #[test]
    fn test_missing_spec_is_decode_error() {
        let err = build_destination_document(info(None)).unwrap_err();
        assert!(matches!(err, MigrateError::SpecDecode(_)));
    }

    #[test]
    fn test_foreign_type_url_is_rejected() {
        let spec = AnyValue {
            type_url: "types.containerd.io/something/else".to_string(),
            value: b"{}".to_vec(),
        };
        assert!(matches!(decode_spec(&spec), Err(MigrateError::SpecDecode(_))));
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let spec = AnyValue {
            type_url: RUNTIME_SPEC_TYPE_URL.to_string(),
            value: b"\x0a\x03abc".to_vec(),
        };
        assert!(matches!(decode_spec(&spec), Err(MigrateError::SpecDecode(_))));
    }
}
