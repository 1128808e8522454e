pub mod config;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use murmur_db::Database;
use murmur_gateway::{Engine, EngineConfig, connection};
use murmur_types::models::GENERAL_CHAT_ID;

use crate::config::Config;

pub struct Server {
    pub router: Router,
    pub engine: Engine,
}

/// Open storage, seed it, and assemble the HTTP + WebSocket router.
pub fn build(config: &Config) -> Result<Server> {
    let db = match &config.db_path {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    let db = Arc::new(db);

    let engine = Engine::new(
        db,
        EngineConfig {
            typing_timeout: config.typing_timeout,
            login_token_secret: config.require_token.then(|| config.jwt_secret.clone()),
            ..EngineConfig::default()
        },
    )?;
    seed(&engine, config)?;

    let api = murmur_api::state(
        engine.identity().clone(),
        config.jwt_secret.clone(),
        config.token_ttl,
    );

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(engine.clone());

    let mut router = Router::new().merge(murmur_api::routes(api)).merge(ws_route);
    if let Some(dir) = &config.static_dir {
        info!("Serving static files from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    let router = router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    Ok(Server { router, engine })
}

/// Startup state: nobody is connected yet, the admin account exists if
/// configured, and an empty general room gets its welcome message.
fn seed(engine: &Engine, config: &Config) -> Result<()> {
    let reset = engine.identity().reset_presence()?;
    if reset > 0 {
        info!("Reset presence for {} users", reset);
    }

    if let Some(admin) = &config.admin {
        engine.identity().ensure_admin(&admin.username, &admin.password)?;
    }

    if let Some(welcome) = &config.welcome_message {
        if engine.ledger().history(GENERAL_CHAT_ID)?.is_empty() {
            engine.ledger().create_system_message(GENERAL_CHAT_ID, welcome)?;
            info!("Seeded welcome message");
        }
    }

    Ok(())
}

async fn ws_upgrade(State(engine): State<Engine>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, engine))
}
