use color_eyre::eyre;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wormhole_migrate::{CtrRuntime, LocalContentStore};
use wormhole_server::{create_app, AppState, ServerConfig};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        namespace = %config.ctr.namespace,
        content_root = ?config.content_root,
        checkpoint = ?config.target.checkpoint_ref,
        "Starting wormhole migration server..."
    );

    let runtime = Arc::new(CtrRuntime::new(config.ctr.clone()));
    let store = Arc::new(LocalContentStore::new(config.content_root.clone()));
    let app = create_app(AppState::new(runtime, store, &config));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Migration server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
