//! HTTP surface: two linking endpoints plus a health probe.

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::AppError;
use crate::link::Linker;
use crate::phone;

/// Linking walkthrough returned alongside the QR image.
const QR_INSTRUCTIONS: [&str; 4] = [
    "1. Open WhatsApp on your phone",
    "2. Go to Settings > Linked Devices",
    "3. Tap \"Link a Device\"",
    "4. Scan the QR code above",
];

#[derive(Clone)]
pub struct AppState {
    pub linker: Arc<Linker>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/pair", get(pair))
        .route("/qr", get(qr))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and run until Ctrl+C.
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    let state = AppState {
        linker: Arc::new(Linker::new(Arc::new(config))),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;
    let actual = listener.local_addr()?;

    tracing::info!("linkgate listening on http://{actual}");
    tracing::info!("  GET /pair?number=<phone>  — pairing code");
    tracing::info!("  GET /qr                   — QR code");
    tracing::info!("  GET /health               — health check");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received, stopping server...");
}

#[derive(Debug, Deserialize)]
struct PairParams {
    number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PairResponse {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub qr: String,
    pub message: String,
    pub instructions: [&'static str; 4],
}

async fn pair(
    State(state): State<AppState>,
    Query(params): Query<PairParams>,
) -> Result<Json<PairResponse>, AppError> {
    let number = params
        .number
        .ok_or_else(|| AppError::BadRequest(phone::INVALID_NUMBER_HINT.into()))?;
    let code = state.linker.pair(&number).await?;
    Ok(Json(PairResponse { code }))
}

async fn qr(State(state): State<AppState>) -> Result<Json<QrResponse>, AppError> {
    let qr = state.linker.qr().await?;
    Ok(Json(QrResponse {
        qr,
        message: "QR code generated. Scan it with your WhatsApp app.".into(),
        instructions: QR_INSTRUCTIONS,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn not_found() -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "not found",
            "routes": ["GET /pair?number=<phone>", "GET /qr", "GET /health"],
        })),
    )
}
