// src/server.rs

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use qrcode::QrCode;
use qrcode::render::svg;
use serde_json::{Value, json};
use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ListenAddr;
use crate::deployment::{DeploymentRecord, DeploymentTracker, phase_progress};
use crate::error::PoolError;
use crate::pool::{Pool, PoolStatus, ProbeReport};
use crate::provisioning::ProvisionPhase;
use crate::sys::traits::ProviderKind;
use crate::wireguard;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub deployments: Arc<DeploymentTracker>,
    pub provider: ProviderKind,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/join/{username}", post(handle_join))
        .route("/deployment-status/{username}", get(handle_deployment_status))
        .route("/status", get(handle_status))
        .route("/disconnect/{username}", post(handle_disconnect))
        .route("/config/{username}", get(handle_config))
        .route("/qr/{username}", get(handle_qr))
        .route("/servers/{id}/probe", get(handle_probe))
        .route("/servers/{id}", axum::routing::delete(handle_shutdown_server))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serves the facade until `shutdown` resolves.
pub async fn serve<F>(state: AppState, listen: &ListenAddr, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    match listen {
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("🌐 wgpool API listening on {}", addr);
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
        }
        ListenAddr::Unix(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            // Leftover from a previous crash.
            if path.exists() {
                fs::remove_file(path)?;
            }
            let listener = tokio::net::UnixListener::bind(path)?;

            // 🛡️ Owner and group only.
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o660);
            fs::set_permissions(path, perms)?;

            info!("🌐 wgpool API listening on unix:{}", path.display());
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
        }
    }
    Ok(())
}

// ==============================================================================
// Handlers
// ==============================================================================

async fn handle_root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "wgpool",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.provider,
        "max_peers_per_server": state.pool.max_peers_per_server(),
    }))
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Accepts the join and runs it in the background; progress is read from
/// `/deployment-status/{username}`.
async fn handle_join(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<(StatusCode, Json<Value>), PoolError> {
    wireguard::validate_username(&username)?;
    state.deployments.begin(&username)?;

    let AppState { pool, deployments, .. } = state;
    let user = username.clone();
    tokio::spawn(async move {
        let tracker = deployments.clone();
        let phase_user = user.clone();
        let on_phase = move |phase: &ProvisionPhase| {
            let (progress, message) = phase_progress(phase);
            tracker.progress(&phase_user, progress, message);
        };

        deployments.progress(&user, 10, "Looking for a server with free capacity");
        match pool.join_or_create_with(&user, &on_phase).await {
            Ok(result) => {
                info!(username = %user, kind = ?result.kind, server_ip = %result.server_ip, "join completed");
                deployments.complete(&user, &result);
            }
            Err(e) => {
                error!(username = %user, "join failed: {}", e);
                deployments.fail(&user, &e);
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": format!("Connecting {} to the VPN pool", username),
            "status": "starting",
        })),
    ))
}

async fn handle_deployment_status(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Json<DeploymentRecord> {
    Json(state.deployments.get(&username))
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<PoolStatus>, PoolError> {
    Ok(Json(state.pool.status().await?))
}

async fn handle_disconnect(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, PoolError> {
    state.pool.disconnect(&username).await?;
    state.deployments.reset(&username);
    Ok(Json(json!({
        "success": true,
        "message": format!("User {} disconnected", username),
    })))
}

async fn handle_config(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, PoolError> {
    let config = state.pool.config(&username).await?;
    Ok(Json(json!({
        "username": username,
        "config": config,
        "filename": format!("{}-wgpool.conf", username),
    })))
}

async fn handle_qr(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, PoolError> {
    let config = state.pool.config(&username).await?;
    let code = QrCode::new(config.as_bytes())
        .map_err(|e| PoolError::Persistence(format!("stored config does not fit a QR code: {}", e)))?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(320, 320)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml".to_string()),
            (header::CONTENT_DISPOSITION, format!("inline; filename={}-wgpool-qr.svg", username)),
        ],
        image,
    )
        .into_response())
}

async fn handle_probe(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Json<ProbeReport>, PoolError> {
    Ok(Json(state.pool.probe(&server_id).await?))
}

async fn handle_shutdown_server(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, PoolError> {
    let users = state.pool.shutdown_server(&server_id).await?;
    for user in &users {
        state.deployments.reset(user);
    }
    Ok(Json(json!({
        "server_id": server_id,
        "disconnected": users,
    })))
}
