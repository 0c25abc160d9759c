//! # EchoFS API
//!
//! The controller admin surface: an actix-web server exposing mode
//! queries, hints, registration, overrides, critical keys, status, and
//! the chunk write/read path, over the replication manager and the
//! consistency controller.

pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::info;

use echofs_cluster::policy::MetricsSource;
use echofs_cluster::{
    ConsistencyController, HttpTransport, PolicyEngine, ReplicationManager, WorkerPool,
    WorkerTransport,
};
use echofs_cluster::metrics::ClusterMetrics;
use echofs_core::{MetaStore, StoreConfig};

pub use config::ApiConfig;
pub use error::ApiError;
pub use handlers::AppState;

/// Wire up the core components behind the server.
///
/// # Errors
///
/// Returns an error when the store cannot be opened, the configuration
/// is invalid, or the controller fails to start.
pub async fn build_state(config: &ApiConfig) -> anyhow::Result<AppState> {
    config.echo.validate()?;

    let store = Arc::new(MetaStore::open(&config.echo.store_dir, StoreConfig::default()).await?);
    let pool = Arc::new(WorkerPool::new(config.echo.pool.clone()));
    let transport: Arc<dyn WorkerTransport> = Arc::new(HttpTransport::new()?);
    let metrics = Arc::new(ClusterMetrics::new());

    let manager = Arc::new(ReplicationManager::new(
        &config.echo,
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&transport),
        Arc::clone(&metrics),
    )?);
    manager.start().await;
    pool.start_probing(Arc::clone(&transport)).await;

    let controller = ConsistencyController::start(
        config.echo.controller.clone(),
        PolicyEngine::new(config.echo.policy.clone()),
        store,
        Arc::clone(&manager) as Arc<dyn MetricsSource>,
        metrics,
    )
    .await?;

    Ok(AppState {
        controller,
        manager,
    })
}

/// Run the admin HTTP server until it is stopped.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn start_server(config: ApiConfig) -> anyhow::Result<()> {
    let state = build_state(&config).await?;
    let addr = config.listen.addr();
    info!(addr = %addr, "Admin server listening");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure)
    })
    .bind(&addr)?
    .run()
    .await?;

    Ok(())
}
