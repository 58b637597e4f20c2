use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::AppError;

/// Body of a Responses API call. `stream` is always true; non-streaming
/// client requests are aggregated on our side.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub instructions: String,
    pub input: Value,
    pub tools: Vec<Value>,
    pub tool_choice: Value,
    pub parallel_tool_calls: bool,
    pub store: bool,
    pub stream: bool,
    pub prompt_cache_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
}

impl UpstreamRequest {
    pub fn new(
        model: String,
        instructions: String,
        input: Value,
        tools: Vec<Value>,
        tool_choice: Value,
        parallel_tool_calls: bool,
        session_id: String,
        reasoning: Option<Value>,
        text: Option<Value>,
    ) -> Self {
        let include = if reasoning.is_some() {
            vec!["reasoning.encrypted_content".to_string()]
        } else {
            Vec::new()
        };
        Self {
            model,
            instructions,
            input,
            tools,
            tool_choice,
            parallel_tool_calls,
            store: false,
            stream: true,
            prompt_cache_key: session_id,
            reasoning,
            include,
            text,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamCallError {
    #[error("upstream request failed: {0}")]
    Network(String),
    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },
}

impl UpstreamCallError {
    pub fn into_app_error(self) -> AppError {
        match self {
            UpstreamCallError::Network(msg) => {
                AppError::bad_gateway(format!("Upstream request failed: {msg}"))
            }
            UpstreamCallError::Http { status, message } => AppError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
        }
    }
}

/// Issues the streaming Responses call. A status of 400 or above is read to
/// completion here so the caller gets the upstream error message instead of
/// a half-open SSE body.
pub async fn start_upstream_request(
    http: &reqwest::Client,
    responses_url: &str,
    access_token: &str,
    account_id: &str,
    session_id: &str,
    request: &UpstreamRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    debug!(model = %request.model, session = %session_id, "calling responses upstream");

    let resp = http
        .post(responses_url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("chatgpt-account-id", account_id)
        .header("OpenAI-Beta", "responses=experimental")
        .header("session_id", session_id)
        .header("Accept", "text/event-stream")
        .json(request)
        .send()
        .await
        .map_err(|err| UpstreamCallError::Network(err.to_string()))?;

    let status = resp.status();
    if status.as_u16() >= 400 {
        let body = resp.text().await.unwrap_or_default();
        let message = extract_error_message(&body)
            .unwrap_or_else(|| "Upstream error".to_string());
        return Err(UpstreamCallError::Http {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

fn extract_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}
