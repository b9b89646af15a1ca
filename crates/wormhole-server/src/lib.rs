use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, instrument};
use uuid::Uuid;

use wormhole_common::{
    ConfigureRequest, ContainerQuery, HealthResponse, StopResponse, WormholeError,
};
use wormhole_migrate::runtime::{ContainerRuntime, CtrConfig, RegistryAuth, TaskHandle};
use wormhole_migrate::store::{ContentStore, CONTAINERD_CONTENT_ROOT};
use wormhole_migrate::{CheckpointPipeline, RestoreConfig, RestoreOrchestrator};


/// Server configuration, read from `WORMHOLE_*` environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ctr: CtrConfig,
    pub content_root: PathBuf,
    /// Initial migration target; `POST /configure` replaces it
    pub target: RestoreConfig,
    pub registry_auth: Option<RegistryAuth>,
    /// Deadline for one whole checkpoint or restore request
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ctr: CtrConfig::default(),
            content_root: PathBuf::from(CONTAINERD_CONTENT_ROOT),
            target: RestoreConfig::default(),
            registry_auth: None,
            request_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> wormhole_common::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> wormhole_common::Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = var("WORMHOLE_HOST") {
            config.host = host;
        }
        if let Some(port) = var("WORMHOLE_PORT") {
            config.port = port
                .parse()
                .map_err(|e| WormholeError::Config(format!("WORMHOLE_PORT={port}: {e}")))?;
        }
        if let Some(namespace) = var("WORMHOLE_NAMESPACE") {
            config.ctr.namespace = namespace;
        }
        if let Some(bin) = var("WORMHOLE_CTR_BIN") {
            config.ctr.binary_path = PathBuf::from(bin);
        }
        if let Some(root) = var("WORMHOLE_CONTENT_ROOT") {
            config.content_root = PathBuf::from(root);
        }
        config.target.checkpoint_ref = var("WORMHOLE_CHECKPOINT_REF");
        if let Some(name) = var("WORMHOLE_CONTAINER_NAME") {
            config.target.container_name = name;
        }
        if let Some(name) = var("WORMHOLE_WORKLOAD_NAME") {
            config.target.workload_name = name;
        }
        config.registry_auth = match (var("WORMHOLE_REGISTRY_USER"), var("WORMHOLE_REGISTRY_ACCESS")) {
            (Some(user), Some(secret)) => Some(RegistryAuth { user, secret }),
            (None, None) => None,
            _ => {
                return Err(WormholeError::Config(
                    "WORMHOLE_REGISTRY_USER and WORMHOLE_REGISTRY_ACCESS must be set together"
                        .to_string(),
                ))
            }
        };
        if let Some(secs) = var("WORMHOLE_RESTORE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                WormholeError::Config(format!("WORMHOLE_RESTORE_TIMEOUT_SECS={secs}: {e}"))
            })?;
            config.request_timeout = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }
}

/// Shared state for the control server
#[derive(Clone)]
pub struct AppState {
    pub restorer: Arc<RestoreOrchestrator>,
    pub checkpointer: Arc<CheckpointPipeline>,
    pub target: Arc<RwLock<RestoreConfig>>,
    /// Tasks started by restores, by container name
    pub tasks: Arc<RwLock<HashMap<String, TaskHandle>>>,
    pub registry_auth: Option<RegistryAuth>,
    pub request_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ContentStore>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            restorer: Arc::new(RestoreOrchestrator::new(runtime.clone(), store)),
            checkpointer: Arc::new(CheckpointPipeline::new(runtime)),
            target: Arc::new(RwLock::new(config.target.clone())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            registry_auth: config.registry_auth.clone(),
            request_timeout: config.request_timeout,
        }
    }
}

/// Plain-text error reply
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn missing_id() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Url Param 'id' is missing".to_string(),
        }
    }
}

impl From<WormholeError> for ApiError {
    fn from(err: WormholeError) -> Self {
        let status = match err {
            WormholeError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.message)).into_response()
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/health", get(health_handler))
        .route("/configure", post(configure_handler))
        .route("/checkpoint", get(checkpoint_handler).post(checkpoint_handler))
        .route("/restore", get(restore_handler).post(restore_handler))
        .route("/stop", post(stop_handler))
        .with_state(state)
}

/// Run `fut` under the request deadline, if one is set
async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = T>,
) -> Result<T, WormholeError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            WormholeError::Deadline(format!("request did not finish within {}ms", limit.as_millis()))
        }),
        None => Ok(fut.await),
    }
}

async fn hello_handler() -> &'static str {
    "Hello!\n"
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let checkpoint_ref = state.target.read().await.checkpoint_ref.clone();
    Json(HealthResponse {
        status: "healthy".to_string(),
        checkpoint_ref,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn configure_handler(
    State(state): State<AppState>,
    Json(req): Json<ConfigureRequest>,
) -> Result<Json<HealthResponse>, ApiError> {
    if req.checkpoint_ref.trim().is_empty() {
        return Err(WormholeError::Config("checkpoint_ref must not be empty".to_string()).into());
    }

    let mut target = state.target.write().await;
    target.checkpoint_ref = Some(req.checkpoint_ref);
    if let Some(name) = req.container_name {
        target.container_name = name;
    }
    if let Some(name) = req.workload_name {
        target.workload_name = name;
    }
    info!(checkpoint = ?target.checkpoint_ref, container = %target.container_name, "migration target configured");

    Ok(Json(HealthResponse {
        status: "configured".to_string(),
        checkpoint_ref: target.checkpoint_ref.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn checkpoint_handler(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> Result<&'static str, ApiError> {
    let id = query.id.filter(|id| !id.is_empty()).ok_or_else(ApiError::missing_id)?;
    info!(container = %id, "checkpoint requested");
    let remote_ref = state
        .target
        .read()
        .await
        .checkpoint_ref
        .clone()
        .ok_or_else(|| WormholeError::NotConfigured("checkpoint_ref is required".to_string()))?;

    let result = with_deadline(
        state.request_timeout,
        state
            .checkpointer
            .checkpoint(&id, &remote_ref, state.registry_auth.as_ref()),
    )
    .await?;
    if let Err(e) = result {
        error!(error = %e, "checkpoint failed");
        return Err(WormholeError::from(e).into());
    }

    info!(container = %id, %remote_ref, "checkpoint complete");
    Ok("Checkpoint complete\n")
}

#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn restore_handler(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> Result<&'static str, ApiError> {
    let id = query.id.filter(|id| !id.is_empty()).ok_or_else(ApiError::missing_id)?;
    info!(placeholder = %id, "restore requested");
    let mut config = state.target.read().await.clone();
    if let Some(name) = query.name.filter(|n| !n.is_empty()) {
        config.container_name = name;
    }

    let outcome = with_deadline(state.request_timeout, state.restorer.restore(&config, &id))
        .await?
        .map_err(WormholeError::from)?;

    info!(
        container = %outcome.container.id,
        pid = outcome.task.pid,
        padding = outcome.report.padding,
        "restore complete"
    );
    state
        .tasks
        .write()
        .await
        .insert(outcome.container.id.clone(), outcome.task);
    Ok("Restore complete\n")
}

async fn stop_handler(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> Result<Json<StopResponse>, ApiError> {
    let target = state.target.read().await.container_name.clone();
    let name = query.name.filter(|n| !n.is_empty()).unwrap_or(target);

    let task = state.tasks.read().await.get(&name).cloned().ok_or_else(|| ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("no restored task for container {name}"),
    })?;

    let status = state
        .restorer
        .stop(&task)
        .await
        .map_err(WormholeError::from)?;
    state.tasks.write().await.remove(&name);

    let response = StopResponse {
        container: name,
        exit_code: status.code,
    };
    info!("{}", response);
    Ok(Json(response))
}
