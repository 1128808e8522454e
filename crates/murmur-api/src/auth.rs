use std::sync::Arc;

use axum::{Json, extract::State, extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use tracing::info;

use murmur_crypto::token::issue_token;
use murmur_db::Identity;
use murmur_types::api::{AuthResponse, LoginRequest, RegisterRequest};
use murmur_types::models::User;

use crate::error::ApiError;

pub type ApiState = Arc<ApiStateInner>;

pub struct ApiStateInner {
    pub identity: Identity,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

pub async fn register(
    State(state): State<ApiState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    // Argon2 is CPU-bound; keep it off the async workers
    let identity = state.identity.clone();
    let user = tokio::task::spawn_blocking(move || identity.create_user(&req.username, &req.password, false))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!("Registered {} ({})", user.username, user.id);
    let response = respond_with_token(&state, user)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<ApiState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let identity = state.identity.clone();
    let user = tokio::task::spawn_blocking(move || identity.authenticate(&req.username, &req.password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!("{} ({}) authenticated over HTTP", user.username, user.id);
    Ok(Json(respond_with_token(&state, user)?))
}

fn respond_with_token(state: &ApiStateInner, user: User) -> Result<AuthResponse, ApiError> {
    let token = issue_token(&state.jwt_secret, &user.id, &user.username, state.token_ttl)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(AuthResponse {
        success: true,
        user,
        token,
    })
}
