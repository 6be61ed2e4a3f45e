//! Aura token server library logic.

pub mod api;
pub mod config;

use aura_voice::TokenService;
use axum::{routing::get, Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Signs join tokens with the key pair read at startup.
    pub tokens: TokenService,
}

impl AppState {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/getToken", get(api::get_token_handler))
        .layer(TraceLayer::new_for_http())
        // The browser extension calls from its own origin.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
