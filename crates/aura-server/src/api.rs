//! API handlers for the Aura token server.

use crate::AppState;
use aura_voice::JoinRequest;
use axum::{
    extract::{Extension, Json, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Query string for `GET /getToken`.
///
/// Each field falls back to its default only when the parameter is absent.
/// A repeated parameter keeps its first value.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TokenQuery {
    pub room_name: Option<String>,
    pub identity: Option<String>,
    pub name: Option<String>,
}

impl TokenQuery {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut query = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "roomName" => &mut query.room_name,
                "identity" => &mut query.identity,
                "name" => &mut query.name,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        query
    }
}

/// Response body for a successfully issued token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Handler for `GET /getToken`.
///
/// Signing failures are logged with their cause; the caller only ever sees
/// the generic message.
pub async fn get_token_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let query = TokenQuery::from_pairs(pairs);
    let request = JoinRequest::with_defaults(query.room_name, query.identity, query.name);

    match state.tokens.issue(&request) {
        Ok(token) => {
            tracing::info!(
                room = %request.room_name,
                identity = %request.identity,
                "issued join token"
            );
            Ok(Json(TokenResponse { token }))
        }
        Err(e) => {
            tracing::error!(
                room = %request.room_name,
                identity = %request.identity,
                error = %e,
                "failed to generate token"
            );
            Err(ApiError::InternalServerError(
                "Failed to generate token".to_string(),
            ))
        }
    }
}
