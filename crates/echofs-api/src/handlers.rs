//! Admin surface handlers over the controller and replication manager.

use std::str::FromStr;
use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use echofs_cluster::manager::ManagerStats;
use echofs_cluster::{ConsistencyController, ReplicationManager, WriteReceipt};
use echofs_core::{ConsistencyMode, ModeHint};

use crate::error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The consistency controller
    pub controller: Arc<ConsistencyController>,
    /// The replication manager
    pub manager: Arc<ReplicationManager>,
}

/// Mount all admin routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health)).service(
        web::scope("/v1")
            .route("/mode", web::get().to(get_mode))
            .route("/hint", web::post().to(set_hint))
            .route("/register", web::post().to(register))
            .route("/override", web::post().to(set_override))
            .route("/critical-keys", web::get().to(list_critical_keys))
            .route("/critical-keys", web::post().to(edit_critical_keys))
            .route("/status", web::get().to(status))
            .route("/stats", web::get().to(stats))
            .route("/conflicts", web::get().to(list_conflicts))
            .route("/conflicts/resolve", web::post().to(resolve_conflict))
            .route("/objects/{object_id}/chunks", web::put().to(write_chunk))
            .route(
                "/objects/{object_id}/chunks/{chunk_id}",
                web::get().to(read_chunk),
            ),
    );
}

#[derive(Debug, Deserialize)]
struct ModeQuery {
    object_id: String,
}

#[derive(Debug, Serialize)]
struct ModeResponse {
    mode: String,
    ttl_seconds: u64,
    reason: String,
    timestamp: DateTime<Utc>,
}

async fn get_mode(
    state: web::Data<AppState>,
    query: web::Query<ModeQuery>,
) -> Result<HttpResponse, ApiError> {
    let info = state.controller.get_mode(&query.object_id).await?;
    Ok(HttpResponse::Ok().json(ModeResponse {
        mode: info.mode.to_string(),
        ttl_seconds: info.ttl_seconds,
        reason: info.reason.to_string(),
        timestamp: info.timestamp,
    }))
}

#[derive(Debug, Deserialize)]
struct HintRequest {
    object_id: String,
    hint: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: String,
}

async fn set_hint(
    state: web::Data<AppState>,
    body: web::Json<HintRequest>,
) -> Result<HttpResponse, ApiError> {
    let hint = ModeHint::from_str(&body.hint)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state.controller.set_hint(&body.object_id, hint).await?;
    Ok(HttpResponse::Ok().json(StatusBody {
        status: "ok".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    object_id: String,
    #[allow(dead_code)]
    name: Option<String>,
    #[allow(dead_code)]
    size: Option<u64>,
    hint: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    status: String,
    mode: String,
}

async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    let hint = match &body.hint {
        Some(hint) => {
            ModeHint::from_str(hint).map_err(|err| ApiError::BadRequest(err.to_string()))?
        }
        None => ModeHint::Auto,
    };
    let (outcome, mode) = state.controller.register(&body.object_id, hint).await?;
    Ok(HttpResponse::Ok().json(RegisterResponse {
        status: match outcome {
            echofs_cluster::controller::RegisterOutcome::Registered => "registered".to_string(),
            echofs_cluster::controller::RegisterOutcome::AlreadyExists => {
                "already_exists".to_string()
            }
        },
        mode: mode.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    mode: String,
}

#[derive(Debug, Serialize)]
struct OverrideResponse {
    status: String,
    mode: String,
}

async fn set_override(
    state: web::Data<AppState>,
    body: web::Json<OverrideRequest>,
) -> Result<HttpResponse, ApiError> {
    if body.mode.is_empty() {
        state.controller.set_global_override(None).await?;
        return Ok(HttpResponse::Ok().json(OverrideResponse {
            status: "cleared".to_string(),
            mode: String::new(),
        }));
    }

    let mode = ConsistencyMode::from_str(&body.mode)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if mode == ConsistencyMode::Hybrid {
        return Err(ApiError::BadRequest(
            "Override must be C or A".to_string(),
        ));
    }

    // An active override must be cleared before it can be replaced.
    let current = state.controller.status().await.global_override;
    if let Some(current) = current {
        if current != mode {
            return Err(ApiError::Conflict(format!(
                "Override {current} already active, clear it first"
            )));
        }
    }

    state.controller.set_global_override(Some(mode)).await?;
    Ok(HttpResponse::Ok().json(OverrideResponse {
        status: "ok".to_string(),
        mode: mode.to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct CriticalKeysResponse {
    critical_keys: Vec<String>,
}

async fn list_critical_keys(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(CriticalKeysResponse {
        critical_keys: state.controller.critical_keys().await,
    })
}

#[derive(Debug, Deserialize)]
struct CriticalKeyRequest {
    object_id: String,
    action: String,
}

async fn edit_critical_keys(
    state: web::Data<AppState>,
    body: web::Json<CriticalKeyRequest>,
) -> Result<HttpResponse, ApiError> {
    match body.action.as_str() {
        "add" => state.controller.add_critical_key(&body.object_id).await?,
        "remove" => state.controller.remove_critical_key(&body.object_id).await?,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown action {other:?}, expected add or remove"
            )))
        }
    }
    Ok(HttpResponse::Ok().json(StatusBody {
        status: "ok".to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct ConflictSummary {
    conflict_id: Uuid,
    object_id: String,
    priority: String,
    queued_at: DateTime<Utc>,
}

async fn list_conflicts(state: web::Data<AppState>) -> HttpResponse {
    let conflicts = state.manager.pending_conflicts().list().await;
    let summaries: Vec<ConflictSummary> = conflicts
        .into_iter()
        .map(|c| ConflictSummary {
            conflict_id: c.id,
            object_id: c.left.object_id,
            priority: format!("{:?}", c.priority).to_lowercase(),
            queued_at: c.queued_at,
        })
        .collect();
    HttpResponse::Ok().json(summaries)
}

#[derive(Debug, Deserialize)]
struct ResolveConflictRequest {
    conflict_id: Uuid,
    side: String,
}

async fn resolve_conflict(
    state: web::Data<AppState>,
    body: web::Json<ResolveConflictRequest>,
) -> Result<HttpResponse, ApiError> {
    let side = match body.side.as_str() {
        "left" => echofs_core::conflict::ConflictSide::Left,
        "right" => echofs_core::conflict::ConflictSide::Right,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown side {other:?}, expected left or right"
            )))
        }
    };
    let winner = state.manager.resolve_conflict(body.conflict_id, side).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "resolved",
        "object_id": winner.object_id,
        "version": winner.last_version,
    })))
}

async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.controller.status().await)
}

async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let stats: ManagerStats = state.manager.stats().await;
    HttpResponse::Ok().json(stats)
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    if state.controller.is_alive().await {
        HttpResponse::Ok().json(StatusBody {
            status: "ok".to_string(),
        })
    } else {
        HttpResponse::ServiceUnavailable().json(StatusBody {
            status: "controller stalled".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WriteQuery {
    hint: Option<String>,
}

async fn write_chunk(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WriteQuery>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let object_id = path.into_inner();
    let hint = match &query.hint {
        Some(hint) => Some(
            ModeHint::from_str(hint).map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ),
        None => None,
    };

    debug!(object_id = %object_id, bytes = body.len(), "Chunk write received");
    let receipt: WriteReceipt = state
        .manager
        .write(&object_id, body.to_vec(), hint)
        .await?;
    Ok(HttpResponse::Ok().json(receipt))
}

async fn read_chunk(
    state: web::Data<AppState>,
    path: web::Path<(String, Uuid)>,
) -> Result<HttpResponse, ApiError> {
    let (object_id, chunk_id) = path.into_inner();
    let bytes = state.manager.read(&object_id, chunk_id).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .body(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use echofs_cluster::config::{ControllerConfig, EchoConfig, PoolConfig, WorkerAddr};
    use echofs_cluster::metrics::ClusterMetrics;
    use echofs_cluster::policy::{MetricsSource, PolicyEngine};
    use echofs_cluster::pool::WorkerPool;
    use echofs_cluster::transport::{InMemoryTransport, WorkerTransport};
    use echofs_core::{MetaStore, StoreConfig};
    use std::time::Duration;

    async fn app_state(dir: &std::path::Path) -> (AppState, Arc<MetaStore>) {
        let config = EchoConfig {
            pool: PoolConfig {
                workers: (1..=3)
                    .map(|i| WorkerAddr::new(format!("n{i}"), format!("http://n{i}.local")))
                    .collect(),
                ..Default::default()
            },
            controller: ControllerConfig {
                poll_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(MetaStore::open(dir, StoreConfig::default()).await.unwrap());
        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        let transport = Arc::new(InMemoryTransport::new());
        let metrics = Arc::new(ClusterMetrics::new());

        let manager = Arc::new(
            ReplicationManager::new(
                &config,
                Arc::clone(&store),
                pool,
                transport as Arc<dyn WorkerTransport>,
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let controller = ConsistencyController::start(
            config.controller.clone(),
            PolicyEngine::new(config.policy.clone()),
            Arc::clone(&store),
            Arc::clone(&manager) as Arc<dyn MetricsSource>,
            metrics,
        )
        .await
        .unwrap();

        (
            AppState {
                controller,
                manager,
            },
            store,
        )
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_register_and_mode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _store) = app_state(dir.path()).await;
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/register")
            .set_json(serde_json::json!({"object_id": "obj1"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "registered");
        assert_eq!(body["mode"], "C");

        let req = test::TestRequest::get()
            .uri("/v1/mode?object_id=obj1")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mode"], "C");
        assert_eq!(body["reason"], "registered");

        // Unknown objects are a 404.
        let req = test::TestRequest::get()
            .uri("/v1/mode?object_id=ghost")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_critical_key_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _store) = app_state(dir.path()).await;
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/register")
            .set_json(serde_json::json!({"object_id": "X", "hint": "available"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mode"], "A");

        let req = test::TestRequest::post()
            .uri("/v1/critical-keys")
            .set_json(serde_json::json!({"object_id": "X", "action": "add"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        // The key is listed and its mode is forced to C.
        let req = test::TestRequest::get().uri("/v1/critical-keys").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["critical_keys"][0], "X");

        let req = test::TestRequest::get()
            .uri("/v1/mode?object_id=X")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mode"], "C");
        assert_eq!(body["reason"], "critical_key_designation");
    }

    #[actix_web::test]
    async fn test_override_validation_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _store) = app_state(dir.path()).await;
        let app = test_app!(state);

        // Hybrid is not a valid override target.
        let req = test::TestRequest::post()
            .uri("/v1/override")
            .set_json(serde_json::json!({"mode": "hybrid"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/v1/override")
            .set_json(serde_json::json!({"mode": "a"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        // Replacing an active override without clearing is a conflict.
        let req = test::TestRequest::post()
            .uri("/v1/override")
            .set_json(serde_json::json!({"mode": "c"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);

        // Empty mode clears.
        let req = test::TestRequest::post()
            .uri("/v1/override")
            .set_json(serde_json::json!({"mode": ""}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "cleared");
    }

    #[actix_web::test]
    async fn test_hint_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _store) = app_state(dir.path()).await;
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/v1/register")
            .set_json(serde_json::json!({"object_id": "obj1"}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/v1/hint")
            .set_json(serde_json::json!({"object_id": "obj1", "hint": "strong"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        // Invalid hints are rejected.
        let req = test::TestRequest::post()
            .uri("/v1/hint")
            .set_json(serde_json::json!({"object_id": "obj1", "hint": "bogus"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_write_read_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = app_state(dir.path()).await;
        let app = test_app!(state);

        let req = test::TestRequest::put()
            .uri("/v1/objects/obj1/chunks")
            .set_payload(b"hello echo".to_vec())
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["acked"], true);
        assert_eq!(body["version"], 1);

        let chunk_id = store.get("obj1").await.unwrap().chunks[0].chunk_id;
        let req = test::TestRequest::get()
            .uri(&format!("/v1/objects/obj1/chunks/{chunk_id}"))
            .to_request();
        let bytes = test::call_and_read_body(&app, req).await;
        assert_eq!(bytes.as_ref(), b"hello echo");

        let req = test::TestRequest::get().uri("/v1/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["objects"], 1);
        assert_eq!(body["sync"]["writes_success"], 1);
    }

    #[actix_web::test]
    async fn test_status_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _store) = app_state(dir.path()).await;
        let controller = Arc::clone(&state.controller);
        let app = test_app!(state);

        // Drive one cycle so the heartbeat is fresh.
        controller.run_cycle_once().await.unwrap();

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/v1/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["emergency_mode"], false);
        assert_eq!(body["total_objects"], 0);
    }
}
