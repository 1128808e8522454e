pub mod auth;
pub mod error;

use std::sync::Arc;

use axum::{Router, routing::post};

pub use auth::{ApiState, ApiStateInner};
pub use error::ApiError;

/// Credential routes. Mounted by the server next to the WebSocket endpoint.
pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .with_state(state)
}

pub fn state(identity: murmur_db::Identity, jwt_secret: String, token_ttl: chrono::Duration) -> ApiState {
    Arc::new(ApiStateInner {
        identity,
        jwt_secret,
        token_ttl,
    })
}
