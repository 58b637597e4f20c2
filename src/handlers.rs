use axum::Json;
use axum::extract::State;
use bytes::Bytes;
use axum::http::HeaderMap;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::model_registry::{instructions_for_model, normalize_model_name, openai_models};
use crate::normalize::{NormalizedChat, normalize_chat_request};
use crate::reasoning::build_reasoning_param;
use crate::session::ensure_session_id;
use crate::translate::{
    ChatCollector, ChatTranslator, TextTranslator, collect_chat_completion,
    collect_responses_response, collect_text_completion, pump_responses_passthrough,
    pump_translated_sse,
};
use crate::upstream::{UpstreamCallError, UpstreamRequest, start_upstream_request};

fn parse_body(body: &Bytes) -> AppResult<Value> {
    serde_json::from_slice(body).map_err(|_| AppError::bad_request("Invalid JSON body"))
}

fn client_session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-session-id")
        .or_else(|| headers.get("session_id"))
        .and_then(|v| v.to_str().ok())
}

fn sse_response(rx: mpsc::Receiver<axum::response::sse::Event>) -> Response {
    Sse::new(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>)).into_response()
}

/// Calls the upstream once, and once more without the passthrough tools if
/// the first attempt carried them and was rejected. The retry keeps the
/// client's original tool surface so their own function tools still work.
pub(crate) async fn call_with_tool_retry(
    state: &AppState,
    normalized: &NormalizedChat,
    session_id: &str,
) -> AppResult<reqwest::Response> {
    let (access_token, account_id) = state.tokens.get_valid_credential(&state.http).await?;

    let request = UpstreamRequest::new(
        normalized.model.clone(),
        normalized.instructions.clone(),
        normalized.input_items.clone(),
        normalized.tools.clone(),
        normalized.tool_choice.clone(),
        normalized.parallel_tool_calls,
        session_id.to_string(),
        normalized.reasoning.clone(),
        None,
    );

    let first = start_upstream_request(
        &state.http,
        &state.settings.responses_url,
        &access_token,
        &account_id,
        session_id,
        &request,
    )
    .await;

    match first {
        Ok(resp) => Ok(resp),
        Err(err @ UpstreamCallError::Http { .. }) if normalized.had_responses_tools => {
            warn!(error = %err, "upstream rejected passthrough tools, retrying without them");
            let retry = UpstreamRequest {
                tools: normalized.base_tools.clone(),
                tool_choice: normalized.base_tool_choice.clone(),
                ..request
            };
            match start_upstream_request(
                &state.http,
                &state.settings.responses_url,
                &access_token,
                &account_id,
                session_id,
                &retry,
            )
            .await
            {
                Ok(resp) => Ok(resp),
                Err(UpstreamCallError::Http { status, message }) => Err(AppError::new(
                    axum::http::StatusCode::from_u16(status)
                        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
                    message,
                )
                .with_code("RESPONSES_TOOLS_REJECTED")),
                Err(network) => Err(network.into_app_error()),
            }
        }
        Err(err) => Err(err.into_app_error()),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let payload = parse_body(&body)?;
    let normalized = normalize_chat_request(&payload, &state.settings, None)?;
    let session_id = ensure_session_id(
        Some(&normalized.instructions),
        &normalized.input_items,
        client_session_id(&headers),
    );

    let upstream = call_with_tool_retry(&state, &normalized, &session_id).await?;
    let created = Utc::now().timestamp();
    let client_model = normalized
        .requested_model
        .clone()
        .unwrap_or_else(|| normalized.model.clone());
    info!(model = %normalized.model, stream = normalized.is_stream, "chat completion accepted");

    if normalized.is_stream {
        let translator = ChatTranslator::new(
            client_model,
            created,
            state.settings.reasoning_compat,
            normalized.include_usage,
        );
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_translated_sse(upstream, translator, tx));
        return Ok(sse_response(rx));
    }

    let collector = ChatCollector::new(
        client_model,
        created,
        state.settings.reasoning_compat,
        normalized.strict_json_text,
    );
    let completion = collect_chat_completion(upstream, collector).await?;
    Ok(Json(completion).into_response())
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let payload = parse_body(&body)?;

    let prompt = match payload.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        _ => payload
            .get("suffix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };

    let mut chat_payload = json!({
        "messages": [{ "role": "user", "content": prompt }],
    });
    for key in ["model", "stream", "stream_options", "reasoning"] {
        if let Some(v) = payload.get(key) {
            chat_payload[key] = v.clone();
        }
    }

    let normalized = normalize_chat_request(&chat_payload, &state.settings, None)?;
    let session_id = ensure_session_id(
        Some(&normalized.instructions),
        &normalized.input_items,
        client_session_id(&headers),
    );

    let upstream = call_with_tool_retry(&state, &normalized, &session_id).await?;
    let created = Utc::now().timestamp();
    let client_model = normalized
        .requested_model
        .clone()
        .unwrap_or_else(|| normalized.model.clone());

    if normalized.is_stream {
        let translator = TextTranslator::new(client_model, created, normalized.include_usage);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_translated_sse(upstream, translator, tx));
        return Ok(sse_response(rx));
    }

    let completion = collect_text_completion(upstream, client_model, created).await?;
    Ok(Json(completion).into_response())
}

fn merge_instructions(base: &str, requested: Option<&str>) -> String {
    let base = base.trim();
    let requested = requested.map(str::trim).unwrap_or_default();
    match (base.is_empty(), requested.is_empty()) {
        (false, false) => format!("{base}\n\n{requested}"),
        (true, false) => requested.to_string(),
        _ => base.to_string(),
    }
}

/// Near-passthrough for clients speaking the Responses protocol natively.
/// The bridge still owns auth, model normalization, and the reasoning
/// defaults; everything else goes through untouched.
pub async fn responses_passthrough(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let payload = parse_body(&body)?;
    let requested_model = payload.get("model").and_then(Value::as_str);
    let is_stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let model = normalize_model_name(requested_model, state.settings.debug_model.as_deref());
    let instructions = merge_instructions(
        instructions_for_model(&model, &state.settings),
        payload.get("instructions").and_then(Value::as_str),
    );

    let input_items = match payload.get("input") {
        Some(v @ Value::Array(_)) => v.clone(),
        _ => json!([]),
    };

    let reasoning = build_reasoning_param(
        state.settings.reasoning_effort,
        state.settings.reasoning_summary,
        payload.get("reasoning").filter(|v| v.is_object()),
        None,
        crate::model_registry::allowed_efforts_for_model(&model),
    )?;

    let tools = match payload.get("tools") {
        Some(Value::Array(tools)) => tools.clone(),
        _ => Vec::new(),
    };
    let tool_choice = match payload.get("tool_choice") {
        Some(Value::String(s)) if s == "auto" || s == "none" => json!(s),
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => json!("auto"),
    };
    let text = payload.get("text").filter(|v| v.is_object()).cloned();

    let (access_token, account_id) = state.tokens.get_valid_credential(&state.http).await?;
    let session_id = ensure_session_id(
        Some(&instructions),
        &input_items,
        client_session_id(&headers),
    );

    let request = UpstreamRequest::new(
        model.clone(),
        instructions,
        input_items,
        tools,
        tool_choice,
        payload
            .get("parallel_tool_calls")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        session_id.clone(),
        reasoning,
        text.clone(),
    );

    let upstream = start_upstream_request(
        &state.http,
        &state.settings.responses_url,
        &access_token,
        &account_id,
        &session_id,
        &request,
    )
    .await
    .map_err(UpstreamCallError::into_app_error)?;

    if is_stream {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_responses_passthrough(upstream, tx));
        return Ok(sse_response(rx));
    }

    let client_model = requested_model.unwrap_or(&model).to_string();
    let response = collect_responses_response(
        upstream,
        client_model,
        state.settings.reasoning_compat,
        text,
    )
    .await?;
    Ok(Json(response).into_response())
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": openai_models(state.settings.expose_reasoning_models),
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
