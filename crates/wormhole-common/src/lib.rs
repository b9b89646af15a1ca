// Types shared between the migration core and the control surface

use std::fmt::Display;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WormholeError {
    #[error("Not Configured: {0}")]
    NotConfigured(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Spec Rewrite Error: {0}")]
    Rewrite(String),

    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("Deadline Exceeded: {0}")]
    Deadline(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for migration operations
pub type Result<T> = std::result::Result<T, WormholeError>;

/// Replacement migration target, accepted by `POST /configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub checkpoint_ref: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub workload_name: Option<String>,
}

/// Query parameters of the checkpoint and restore endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerQuery {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub container: String,
    pub exit_code: u32,
}

impl Display for StopResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} exited with status: {}", self.container, self.exit_code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub checkpoint_ref: Option<String>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_request_defaults() {
        let req: ConfigureRequest =
            serde_json::from_str(r#"{"checkpoint_ref":"docker.io/acme/ckpt:latest"}"#).unwrap();
        assert_eq!(req.checkpoint_ref, "docker.io/acme/ckpt:latest");
        assert!(req.container_name.is_none());
        assert!(req.workload_name.is_none());
    }

    #[test]
    fn test_stop_response_display() {
        let stop = StopResponse {
            container: "alprestr".to_string(),
            exit_code: 143,
        };
        assert_eq!(stop.to_string(), "alprestr exited with status: 143");
        let json = serde_json::to_string(&stop).unwrap();
        assert!(json.contains("\"exit_code\":143"));
    }
}
