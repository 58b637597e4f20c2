use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::ollama;
use crate::settings::Settings;
use crate::token::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
    pub tokens: TokenManager,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("CHATBRIDGE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "127.0.0.1:8000".to_string());
        Self { listen }
    }
}

pub fn load_state() -> AppResult<AppState> {
    load_state_with(RuntimeConfig::from_env(), Settings::from_env())
}

pub fn load_state_with(runtime: RuntimeConfig, settings: Settings) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatbridge/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("http client init failed: {err}"),
            )
        })?;

    let tokens = TokenManager::new(
        CredentialStore::new(settings.home.clone()),
        settings.client_id.clone(),
        settings.oauth_token_url.clone(),
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        settings: Arc::new(settings),
        http,
        tokens,
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/responses", post(handlers::responses_passthrough))
        .route("/v1/models", get(handlers::list_models))
        .route("/api/chat", post(ollama::api_chat))
        .route("/api/tags", get(ollama::api_tags))
        .route("/api/version", get(ollama::api_version))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
