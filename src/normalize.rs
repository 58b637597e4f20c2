use serde_json::{Map, Value, json};

use crate::error::AppError;
use crate::model_registry::{allowed_efforts_for_model, instructions_for_model, normalize_model_name};
use crate::reasoning::{build_reasoning_param, effort_from_model_name, is_strict_json_text_format};
use crate::settings::Settings;

const MAX_RESPONSES_TOOLS_BYTES: usize = 32_768;

/// A chat request reduced to the upstream call's ingredients. `base_tools`
/// and `base_tool_choice` carry the client's original tool surface for the
/// retry path after an upstream tool rejection.
#[derive(Debug, Clone)]
pub struct NormalizedChat {
    pub model: String,
    pub requested_model: Option<String>,
    pub instructions: String,
    pub input_items: Value,
    pub tools: Vec<Value>,
    pub base_tools: Vec<Value>,
    pub tool_choice: Value,
    pub base_tool_choice: Value,
    pub parallel_tool_calls: bool,
    pub reasoning: Option<Value>,
    pub had_responses_tools: bool,
    pub is_stream: bool,
    pub include_usage: bool,
    pub strict_json_text: bool,
}

/// Builds the upstream request ingredients from an OpenAI-style chat
/// completions payload. Also serves `/v1/completions` and the Ollama chat
/// route, which reduce their payloads to the same shape first.
pub fn normalize_chat_request(
    payload: &Value,
    settings: &Settings,
    stream_override: Option<bool>,
) -> Result<NormalizedChat, AppError> {
    let requested_model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut messages = match payload.get("messages") {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(AppError::bad_request("Request must include messages: []")),
        None => {
            let fallback = payload
                .get("prompt")
                .or_else(|| payload.get("input"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            vec![json!({ "role": "user", "content": fallback })]
        }
    };
    relocate_system_message(&mut messages);

    let is_stream = stream_override.unwrap_or_else(|| {
        payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    });
    let include_usage = payload
        .get("stream_options")
        .and_then(|o| o.get("include_usage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let model = normalize_model_name(requested_model.as_deref(), settings.debug_model.as_deref());

    let model_effort = effort_from_model_name(requested_model.as_deref());
    let reasoning_overrides = payload.get("reasoning").filter(|v| v.is_object());
    let reasoning = build_reasoning_param(
        settings.reasoning_effort,
        settings.reasoning_summary,
        reasoning_overrides,
        model_effort,
        allowed_efforts_for_model(&model),
    )?;

    let instructions = instructions_for_model(&model, settings).to_string();

    let base_tools = convert_tools_chat_to_responses(payload.get("tools"));
    let base_tool_choice = effective_tool_choice(payload.get("tool_choice"));

    let mut tools = base_tools.clone();
    let mut tool_choice = base_tool_choice.clone();
    let mut had_responses_tools = false;

    // An absent responses_tools field behaves like an empty list, so the
    // server-wide default web_search still injects for plain OpenAI clients.
    let requested: &[Value] = match payload.get("responses_tools") {
        Some(Value::Array(requested)) => requested,
        _ => &[],
    };
    let mut extra: Vec<Value> = Vec::new();
    for tool in requested {
        let Some(kind) = tool.get("type").and_then(Value::as_str) else {
            continue;
        };
        if kind != "web_search" && kind != "web_search_preview" {
            return Err(AppError::bad_request(
                "Only web_search/web_search_preview are supported in responses_tools",
            )
            .with_code("RESPONSES_TOOL_UNSUPPORTED"));
        }
        extra.push(tool.clone());
    }

    let choice_is_none = payload
        .get("responses_tool_choice")
        .and_then(Value::as_str)
        .is_some_and(|c| c == "none");
    if extra.is_empty() && settings.default_web_search && !choice_is_none {
        extra.push(json!({ "type": "web_search" }));
    }

    if !extra.is_empty() {
        let size = serde_json::to_string(&extra).map(|s| s.len()).unwrap_or(0);
        if size > MAX_RESPONSES_TOOLS_BYTES {
            return Err(AppError::bad_request("responses_tools too large")
                .with_code("RESPONSES_TOOLS_TOO_LARGE"));
        }
        had_responses_tools = true;
        tools.extend(extra);
    }

    if let Some(choice) = payload.get("responses_tool_choice").and_then(Value::as_str)
        && (choice == "auto" || choice == "none")
    {
        tool_choice = Value::String(choice.to_string());
    }

    let mut input_items = convert_chat_messages_to_responses_input(&messages);
    if input_items.is_empty()
        && let Some(prompt) = payload.get("prompt").and_then(Value::as_str)
        && !prompt.trim().is_empty()
    {
        input_items.push(json!({
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": prompt }],
        }));
    }

    Ok(NormalizedChat {
        model,
        requested_model,
        instructions,
        input_items: Value::Array(input_items),
        tools,
        base_tools,
        tool_choice,
        base_tool_choice,
        parallel_tool_calls: payload
            .get("parallel_tool_calls")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        reasoning,
        had_responses_tools,
        is_stream,
        include_usage,
        strict_json_text: is_strict_json_text_format(payload.get("text")),
    })
}

/// Upstream accepts "auto", "none", or an object choice. Anything else
/// collapses to "auto".
fn effective_tool_choice(choice: Option<&Value>) -> Value {
    match choice {
        Some(Value::String(s)) if s == "auto" || s == "none" => Value::String(s.clone()),
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => Value::String("auto".to_string()),
    }
}

/// The upstream has no system role. The first system message, if any, is
/// reinserted at the front as a user message.
pub fn relocate_system_message(messages: &mut Vec<Value>) {
    let idx = messages
        .iter()
        .position(|m| m.get("role").and_then(Value::as_str) == Some("system"));
    if let Some(idx) = idx {
        let sys = messages.remove(idx);
        let content = sys.get("content").cloned().unwrap_or(Value::String(String::new()));
        messages.insert(0, json!({ "role": "user", "content": content }));
    }
}

/// Chat-format messages to Responses-format input items. Assistant tool
/// calls become `function_call` items, tool results become
/// `function_call_output`, everything else becomes a `message` item whose
/// parts use `input_text` for the client side and `output_text` for the
/// assistant side.
pub fn convert_chat_messages_to_responses_input(messages: &[Value]) -> Vec<Value> {
    let mut items = Vec::new();

    for msg in messages {
        let Some(obj) = msg.as_object() else { continue };
        let role = obj.get("role").and_then(Value::as_str).unwrap_or("user");

        if role == "tool" {
            let call_id = obj
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            items.push(json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": content_as_text(obj.get("content")),
            }));
            continue;
        }

        if role == "assistant"
            && let Some(Value::Array(calls)) = obj.get("tool_calls")
        {
            for call in calls {
                let function = call.get("function");
                items.push(json!({
                    "type": "function_call",
                    "call_id": call.get("id").and_then(Value::as_str).unwrap_or_default(),
                    "name": function
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    "arguments": function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or("{}"),
                }));
            }
        }

        let parts = content_to_parts(obj.get("content"), role);
        if !parts.is_empty() {
            items.push(json!({
                "type": "message",
                "role": if role == "assistant" { "assistant" } else { "user" },
                "content": parts,
            }));
        }
    }

    items
}

fn content_to_parts(content: Option<&Value>, role: &str) -> Vec<Value> {
    let text_type = if role == "assistant" {
        "output_text"
    } else {
        "input_text"
    };

    match content {
        Some(Value::String(s)) if !s.is_empty() => {
            vec![json!({ "type": text_type, "text": s })]
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                let kind = part.get("type").and_then(Value::as_str)?;
                match kind {
                    "text" | "input_text" | "output_text" => {
                        let text = part.get("text").and_then(Value::as_str)?;
                        Some(json!({ "type": text_type, "text": text }))
                    }
                    "image_url" => {
                        let url = match part.get("image_url") {
                            Some(Value::String(s)) => s.as_str(),
                            Some(Value::Object(o)) => o.get("url").and_then(Value::as_str)?,
                            _ => return None,
                        };
                        Some(json!({ "type": "input_image", "image_url": url }))
                    }
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn content_as_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Chat-format tool declarations to the Responses flat shape.
pub fn convert_tools_chat_to_responses(tools: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(tools)) = tools else {
        return Vec::new();
    };

    tools
        .iter()
        .filter_map(|tool| {
            if tool.get("type").and_then(Value::as_str) != Some("function") {
                return None;
            }
            let function = tool.get("function")?.as_object()?;
            let name = function.get("name").and_then(Value::as_str)?;

            let mut out = Map::new();
            out.insert("type".into(), json!("function"));
            out.insert("name".into(), json!(name));
            if let Some(desc) = function.get("description") {
                out.insert("description".into(), desc.clone());
            }
            out.insert(
                "parameters".into(),
                function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            );
            if let Some(strict) = function.get("strict") {
                out.insert("strict".into(), strict.clone());
            }
            Some(Value::Object(out))
        })
        .collect()
}
