use axum::Json;
use axum::body::Body;
use axum::extract::State;
use bytes::Bytes;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::model_registry::{ollama_fake_eval, ollama_models};
use crate::normalize::normalize_chat_request;
use crate::session::ensure_session_id;
use crate::translate::{UpstreamEvent, failure_message};

fn ndjson_line(value: &Value) -> Bytes {
    Bytes::from(format!("{value}\n"))
}

fn chat_frame(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": { "role": "assistant", "content": content },
        "done": false,
    })
}

fn done_frame(model: &str) -> Value {
    let mut frame = json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": { "role": "assistant", "content": "" },
        "done_reason": "stop",
        "done": true,
    });
    let eval = ollama_fake_eval();
    if let (Some(frame_obj), Some(eval)) = (frame.as_object_mut(), eval.as_object()) {
        for (k, v) in eval {
            frame_obj.insert(k.clone(), v.clone());
        }
    }
    frame
}

/// Drives the upstream stream into NDJSON frames the Ollama protocol
/// expects. Reasoning deltas are dropped; Ollama clients have no channel
/// for them.
async fn pump_ollama_chat(upstream: reqwest::Response, model: String, tx: mpsc::Sender<Bytes>) {
    let mut events = upstream.bytes_stream().eventsource();

    while let Some(next) = events.next().await {
        let sse = match next {
            Ok(sse) => sse,
            Err(err) => {
                debug!(error = %err, "upstream stream interrupted");
                break;
            }
        };
        if sse.data == "[DONE]" {
            break;
        }
        let Ok(evt) = serde_json::from_str::<UpstreamEvent>(&sse.data) else {
            continue;
        };

        match evt.kind.as_str() {
            "response.output_text.delta" => {
                let frame = chat_frame(&model, evt.delta.as_deref().unwrap_or_default());
                if tx.send(ndjson_line(&frame)).await.is_err() {
                    return;
                }
            }
            "response.failed" => {
                let frame = json!({ "error": failure_message(evt.response.as_ref()) });
                let _ = tx.send(ndjson_line(&frame)).await;
                break;
            }
            "response.completed" => break,
            _ => {}
        }
    }

    let _ = tx.send(ndjson_line(&done_frame(&model))).await;
}

/// POST /api/chat. Same normalization pipeline as the OpenAI surface; only
/// the response framing differs. Ollama clients default to streaming.
pub async fn api_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| AppError::bad_request("Invalid JSON body"))?;
    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let normalized = normalize_chat_request(&payload, &state.settings, Some(stream))?;
    let session_id = ensure_session_id(
        Some(&normalized.instructions),
        &normalized.input_items,
        headers
            .get("x-session-id")
            .and_then(|v| v.to_str().ok()),
    );

    let upstream = crate::handlers::call_with_tool_retry(&state, &normalized, &session_id).await?;
    let client_model = normalized
        .requested_model
        .clone()
        .unwrap_or_else(|| normalized.model.clone());

    if stream {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_ollama_chat(upstream, client_model, tx));
        let body = Body::from_stream(
            ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
        );
        return Ok(Response::builder()
            .header("content-type", "application/x-ndjson")
            .body(body)
            .map_err(|e| AppError::bad_gateway(e.to_string()))?);
    }

    let mut full_text = String::new();
    let mut error_message: Option<String> = None;

    let mut events = upstream.bytes_stream().eventsource();
    while let Some(next) = events.next().await {
        let Ok(sse) = next else { break };
        if sse.data == "[DONE]" {
            break;
        }
        let Ok(evt) = serde_json::from_str::<UpstreamEvent>(&sse.data) else {
            continue;
        };
        match evt.kind.as_str() {
            "response.output_text.delta" => {
                full_text.push_str(evt.delta.as_deref().unwrap_or_default())
            }
            "response.failed" => {
                error_message = Some(failure_message(evt.response.as_ref()));
                break;
            }
            "response.completed" => break,
            _ => {}
        }
    }

    if let Some(message) = error_message {
        return Err(AppError::bad_gateway(message));
    }

    let mut response = done_frame(&client_model);
    response["message"]["content"] = json!(full_text);
    Ok(Json(response).into_response())
}

/// GET /api/tags. A fixed model catalog so Ollama clients can pick a model.
pub async fn api_tags(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": ollama_models(state.settings.expose_reasoning_models) }))
}

/// GET /api/version. Some clients refuse to talk to an Ollama server that
/// does not report one.
pub async fn api_version(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "version": state.settings.ollama_version }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_frame_carries_eval_stats() {
        let frame = done_frame("gpt-5");
        assert_eq!(frame["done"], true);
        assert_eq!(frame["model"], "gpt-5");
        assert!(frame["eval_count"].is_number());
        assert!(frame["total_duration"].is_number());
    }

    #[test]
    fn chat_frame_wraps_delta() {
        let frame = chat_frame("gpt-5", "hi");
        assert_eq!(frame["message"]["content"], "hi");
        assert_eq!(frame["done"], false);
    }
}
