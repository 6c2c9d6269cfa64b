//! Dashboard HTTP + WebSocket surface.
//!
//! A thin layer over the core: reads go straight to the stores, mutations
//! go through the same handles the director uses, and the chat endpoint
//! enqueues into the loop and waits for the reply.

pub mod routes;
pub mod ws;

use crate::budget::BudgetTracker;
use crate::config::VigilConfig;
use crate::core::ChatSender;
use crate::memory::working::WorkingContext;
use crate::memory::{BlobStore, NotePad, VectorStore};
use crate::state::Database;
use crate::tools::ToolRegistry;
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state behind every handler.
pub struct AppState {
    pub config: VigilConfig,
    pub db: Arc<Mutex<Database>>,
    pub budget: BudgetTracker,
    pub vector: Arc<Mutex<VectorStore>>,
    pub blob: BlobStore,
    pub notes: NotePad,
    pub chat: ChatSender,
    pub broadcast: broadcast::Sender<Value>,
    pub registry: Arc<ToolRegistry>,
    pub working: Arc<RwLock<Option<WorkingContext>>>,
    pub next_sleep: Arc<RwLock<f64>>,
}

/// API error with an HTTP status and a stable error code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "Creator authentication required".into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": self.code, "message": self.message}));
        (self.status, body).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(routes::status))
        .route("/budget", get(routes::budget))
        .route("/budget/override", post(routes::budget_override))
        .route("/memory/stats", get(routes::memory_stats))
        .route("/memory/vector", get(routes::memory_vector))
        .route("/memory/blob", get(routes::memory_blob))
        .route("/memory/working", get(routes::memory_working))
        .route("/memory/short-term", get(routes::memory_short_term))
        .route("/memory/config", put(routes::memory_config))
        .route("/directive", post(routes::set_directive))
        .route("/goals", post(routes::set_goals))
        .route("/control/pause", post(routes::pause))
        .route("/control/resume", post(routes::resume))
        .route("/control/wake", post(routes::wake))
        .route("/providers", post(routes::add_provider))
        .route("/providers/:name", put(routes::update_provider))
        .route("/chat", post(routes::chat))
        .route("/chat/history", get(routes::chat_history))
        .route("/analytics", get(routes::analytics))
        .route("/tools", get(routes::tools))
        .route("/health", get(routes::health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until shutdown.
pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let addr = state.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Dashboard API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server failed")?;
    Ok(())
}
