use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::AppError;
use crate::reasoning::{ReasoningCompat, apply_reasoning_to_message};

/// One parsed upstream SSE event. Unknown payload fields ride along in
/// `rest` so passthrough mode loses nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub item: Option<Value>,
    #[serde(default)]
    pub part: Option<Value>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl UpstreamEvent {
    fn response_id(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .get("id")?
            .as_str()
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageCounts {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Usage off a `response` object, mapped to chat-completions naming.
pub fn extract_usage(response: Option<&Value>) -> Option<UsageCounts> {
    let usage = response?.get("usage")?.as_object()?;
    let prompt = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let completion = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + completion);
    Some(UsageCounts {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Whether the stream should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Done,
}

/// Tool call arguments as a JSON string. A bare string that is not itself
/// a JSON object or array gets wrapped as a query argument.
fn serialize_tool_args(args: &Value) -> String {
    match args {
        Value::Object(_) | Value::Array(_) => args.to_string(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed.to_string(),
            _ => json!({ "query": s }).to_string(),
        },
        _ => "{}".to_string(),
    }
}

/// Accumulated web search parameters for one upstream call id. Fragments
/// arrive across multiple events; later values for the same canonical key
/// replace earlier ones.
#[derive(Debug, Default)]
struct ToolArgState {
    params: Map<String, Value>,
}

impl ToolArgState {
    fn merge_from(&mut self, src: &Value) {
        let Some(obj) = src.as_object() else { return };

        for whole in ["parameters", "args", "arguments", "input"] {
            if let Some(Value::Object(inner)) = obj.get(whole) {
                for (k, v) in inner {
                    self.params.insert(k.clone(), v.clone());
                }
            }
        }
        for key in ["query", "q"] {
            if let Some(Value::String(q)) = obj.get(key) {
                self.params.insert("query".into(), json!(q));
            }
        }
        for key in ["recency", "time_range", "days"] {
            if let Some(v) = obj.get(key).filter(|v| !v.is_null()) {
                self.params.insert(key.into(), v.clone());
            }
        }
        for key in ["domains", "include_domains", "include"] {
            if let Some(v @ Value::Array(_)) = obj.get(key) {
                self.params.insert("domains".into(), v.clone());
            }
        }
        for key in ["max_results", "topn", "limit"] {
            if let Some(v) = obj.get(key).filter(|v| !v.is_null()) {
                self.params.insert("max_results".into(), v.clone());
            }
        }
    }
}

/// Translates upstream Responses events into OpenAI chat completion chunks.
/// Holds the per-stream state for think-tag bracketing, summary paragraph
/// breaks, and tool call index assignment.
pub struct ChatTranslator {
    response_id: String,
    created: i64,
    model: String,
    compat: ReasoningCompat,
    include_usage: bool,
    think_open: bool,
    think_closed: bool,
    saw_any_summary: bool,
    pending_summary_paragraph: bool,
    sent_stop: bool,
    usage: Option<UsageCounts>,
    tool_args: HashMap<String, ToolArgState>,
    tool_index: HashMap<String, usize>,
    next_tool_index: usize,
}

impl ChatTranslator {
    pub fn new(model: String, created: i64, compat: ReasoningCompat, include_usage: bool) -> Self {
        Self {
            response_id: "chatcmpl-stream".to_string(),
            created,
            model,
            compat,
            include_usage,
            think_open: false,
            think_closed: false,
            saw_any_summary: false,
            pending_summary_paragraph: false,
            sent_stop: false,
            usage: None,
            tool_args: HashMap::new(),
            tool_index: HashMap::new(),
            next_tool_index: 0,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn content_chunk(&self, text: &str) -> Value {
        self.chunk(json!({ "content": text }), None)
    }

    fn tool_index_for(&mut self, call_id: &str) -> usize {
        if let Some(idx) = self.tool_index.get(call_id) {
            return *idx;
        }
        let idx = self.next_tool_index;
        self.tool_index.insert(call_id.to_string(), idx);
        self.next_tool_index += 1;
        idx
    }

    fn tool_call_chunk(&mut self, call_id: &str, name: &str, args: &str) -> Value {
        let index = self.tool_index_for(call_id);
        self.chunk(
            json!({
                "tool_calls": [{
                    "index": index,
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": args },
                }],
            }),
            None,
        )
    }

    pub fn handle(&mut self, evt: &UpstreamEvent) -> (Vec<Value>, Disposition) {
        if let Some(id) = evt.response_id() {
            self.response_id = id.to_string();
        }

        let mut frames = Vec::new();

        if evt.kind.contains("web_search_call") {
            let call_id = evt.item_id.clone().unwrap_or_else(|| "ws_call".to_string());
            let state = self.tool_args.entry(call_id.clone()).or_default();
            if let Some(item) = &evt.item {
                state.merge_from(item);
            }
            state.merge_from(&Value::Object(evt.rest.clone()));
            let args = serialize_tool_args(&Value::Object(state.params.clone()));

            frames.push(self.tool_call_chunk(&call_id, "web_search", &args));
            if evt.kind.ends_with(".completed") || evt.kind.ends_with(".done") {
                frames.push(self.chunk(json!({}), Some("tool_calls")));
            }
        }

        match evt.kind.as_str() {
            "response.output_text.delta" => {
                if self.compat == ReasoningCompat::ThinkTags && self.think_open && !self.think_closed
                {
                    frames.push(self.content_chunk("</think>"));
                    self.think_open = false;
                    self.think_closed = true;
                }
                frames.push(self.content_chunk(evt.delta.as_deref().unwrap_or_default()));
            }
            "response.output_item.done" => {
                if let Some(item) = evt.item.as_ref().and_then(Value::as_object) {
                    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
                    if item_type == "function_call" || item_type == "web_search_call" {
                        let call_id = item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or(if item_type == "web_search_call" {
                                "web_search"
                            } else {
                                ""
                            })
                            .to_string();

                        let raw_args = item
                            .get("arguments")
                            .or_else(|| item.get("parameters"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let state = self.tool_args.entry(call_id.clone()).or_default();
                        state.merge_from(&json!({ "arguments": raw_args }));
                        let args = if state.params.is_empty() {
                            serialize_tool_args(&raw_args)
                        } else {
                            serialize_tool_args(&Value::Object(state.params.clone()))
                        };

                        frames.push(self.tool_call_chunk(&call_id, &name, &args));
                        frames.push(self.chunk(json!({}), Some("tool_calls")));
                    }
                }
            }
            "response.reasoning_summary_part.added" => {
                if matches!(self.compat, ReasoningCompat::ThinkTags | ReasoningCompat::O3) {
                    if self.saw_any_summary {
                        self.pending_summary_paragraph = true;
                    } else {
                        self.saw_any_summary = true;
                    }
                }
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                let is_summary = evt.kind == "response.reasoning_summary_text.delta";
                let delta = evt.delta.as_deref().unwrap_or_default();
                match self.compat {
                    ReasoningCompat::O3 => {
                        if is_summary && self.pending_summary_paragraph {
                            frames.push(self.chunk(
                                json!({ "reasoning": { "content": [{ "type": "text", "text": "\n" }] } }),
                                None,
                            ));
                            self.pending_summary_paragraph = false;
                        }
                        frames.push(self.chunk(
                            json!({ "reasoning": { "content": [{ "type": "text", "text": delta }] } }),
                            None,
                        ));
                    }
                    ReasoningCompat::ThinkTags => {
                        if !self.think_open && !self.think_closed {
                            frames.push(self.content_chunk("<think>"));
                            self.think_open = true;
                        }
                        if self.think_open && !self.think_closed {
                            if is_summary && self.pending_summary_paragraph {
                                frames.push(self.content_chunk("\n"));
                                self.pending_summary_paragraph = false;
                            }
                            frames.push(self.content_chunk(delta));
                        }
                    }
                    ReasoningCompat::Legacy => {
                        let delta_obj = if is_summary {
                            json!({ "reasoning_summary": delta, "reasoning": delta })
                        } else {
                            json!({ "reasoning": delta })
                        };
                        frames.push(self.chunk(delta_obj, None));
                    }
                }
            }
            "response.content_part.done" => {
                if let Some(part) = evt.part.as_ref().and_then(Value::as_object)
                    && part.get("type").and_then(Value::as_str) == Some("output_text")
                    && let Some(annotations @ Value::Array(items)) = part.get("annotations")
                    && !items.is_empty()
                {
                    frames.push(self.chunk(json!({ "annotations": annotations }), None));
                }
            }
            "response.output_text.done" => {
                frames.push(self.chunk(json!({}), Some("stop")));
                self.sent_stop = true;
            }
            "response.failed" => {
                let message = failure_message(evt.response.as_ref());
                frames.push(json!({ "error": { "message": message } }));
                return (frames, Disposition::Done);
            }
            "response.completed" => {
                if let Some(usage) = extract_usage(evt.response.as_ref()) {
                    self.usage = Some(usage);
                }
                if self.compat == ReasoningCompat::ThinkTags && self.think_open && !self.think_closed
                {
                    frames.push(self.content_chunk("</think>"));
                    self.think_open = false;
                    self.think_closed = true;
                }
                if !self.sent_stop {
                    frames.push(self.chunk(json!({}), Some("stop")));
                    self.sent_stop = true;
                }
                if self.include_usage
                    && let Some(usage) = self.usage
                {
                    let mut frame = self.chunk(json!({}), None);
                    frame["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
                    frames.push(frame);
                }
                return (frames, Disposition::Done);
            }
            other => {
                if !other.contains("web_search_call") && !other.ends_with(".done") {
                    debug!(kind = %other, "ignoring upstream event");
                }
            }
        }

        (frames, Disposition::Continue)
    }
}

pub fn failure_message(response: Option<&Value>) -> String {
    response
        .and_then(|r| r.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("response.failed")
        .to_string()
}

/// Translates upstream events into legacy text completion chunks.
pub struct TextTranslator {
    response_id: String,
    created: i64,
    model: String,
    include_usage: bool,
    usage: Option<UsageCounts>,
}

impl TextTranslator {
    pub fn new(model: String, created: i64, include_usage: bool) -> Self {
        Self {
            response_id: "cmpl-stream".to_string(),
            created,
            model,
            include_usage,
            usage: None,
        }
    }

    fn chunk(&self, text: &str, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.response_id,
            "object": "text_completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "text": text, "finish_reason": finish_reason }],
        })
    }

    pub fn handle(&mut self, evt: &UpstreamEvent) -> (Vec<Value>, Disposition) {
        if let Some(id) = evt.response_id() {
            self.response_id = id.to_string();
        }

        let mut frames = Vec::new();
        match evt.kind.as_str() {
            "response.output_text.delta" => {
                frames.push(self.chunk(evt.delta.as_deref().unwrap_or_default(), None));
            }
            "response.output_text.done" => {
                frames.push(self.chunk("", Some("stop")));
            }
            "response.failed" => {
                let message = failure_message(evt.response.as_ref());
                frames.push(json!({ "error": { "message": message } }));
                return (frames, Disposition::Done);
            }
            "response.completed" => {
                if let Some(usage) = extract_usage(evt.response.as_ref()) {
                    self.usage = Some(usage);
                }
                if self.include_usage
                    && let Some(usage) = self.usage
                {
                    let mut frame = self.chunk("", None);
                    frame["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
                    frames.push(frame);
                }
                return (frames, Disposition::Done);
            }
            _ => {}
        }
        (frames, Disposition::Continue)
    }
}

/// Stateful upstream-event to client-frame translation.
pub trait Translate: Send {
    fn handle(&mut self, evt: &UpstreamEvent) -> (Vec<Value>, Disposition);
}

impl Translate for ChatTranslator {
    fn handle(&mut self, evt: &UpstreamEvent) -> (Vec<Value>, Disposition) {
        ChatTranslator::handle(self, evt)
    }
}

impl Translate for TextTranslator {
    fn handle(&mut self, evt: &UpstreamEvent) -> (Vec<Value>, Disposition) {
        TextTranslator::handle(self, evt)
    }
}

/// Drives an upstream SSE body through a translator and into the client
/// channel. A closed channel means the client disconnected; the upstream
/// body is dropped and the task ends. The terminal `[DONE]` marker is
/// always attempted, including after a transport error.
pub async fn pump_translated_sse(
    upstream: reqwest::Response,
    mut translator: impl Translate,
    tx: mpsc::Sender<Event>,
) {
    let mut events = upstream.bytes_stream().eventsource();

    'outer: while let Some(next) = events.next().await {
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

        let (frames, disposition) = translator.handle(&evt);
        for frame in frames {
            if tx
                .send(Event::default().data(frame.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }
        if disposition == Disposition::Done {
            break 'outer;
        }
    }

    let _ = tx.send(Event::default().data("[DONE]")).await;
}

/// Chat completion aggregation for non-streaming clients.
pub struct ChatCollector {
    pub requested_model: String,
    pub compat: ReasoningCompat,
    pub strict_json_text: bool,
    response_id: String,
    created: i64,
    full_text: String,
    summary_text: String,
    reasoning_text: String,
    tool_calls: Vec<Value>,
    usage: Option<UsageCounts>,
    error_message: Option<String>,
}

impl ChatCollector {
    pub fn new(
        requested_model: String,
        created: i64,
        compat: ReasoningCompat,
        strict_json_text: bool,
    ) -> Self {
        Self {
            requested_model,
            compat,
            strict_json_text,
            response_id: "chatcmpl".to_string(),
            created,
            full_text: String::new(),
            summary_text: String::new(),
            reasoning_text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            error_message: None,
        }
    }

    fn absorb(&mut self, evt: &UpstreamEvent) -> Disposition {
        if let Some(id) = evt.response_id() {
            self.response_id = id.to_string();
        }
        if let Some(usage) = extract_usage(evt.response.as_ref()) {
            self.usage = Some(usage);
        }

        match evt.kind.as_str() {
            "response.output_text.delta" => {
                self.full_text.push_str(evt.delta.as_deref().unwrap_or_default());
            }
            "response.reasoning_summary_text.delta" => {
                self.summary_text.push_str(evt.delta.as_deref().unwrap_or_default());
            }
            "response.reasoning_text.delta" => {
                self.reasoning_text.push_str(evt.delta.as_deref().unwrap_or_default());
            }
            "response.output_item.done" => {
                if let Some(item) = evt.item.as_ref().and_then(Value::as_object)
                    && item.get("type").and_then(Value::as_str) == Some("function_call")
                {
                    let call_id = item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
                    let args = item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    self.tool_calls.push(json!({
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": args },
                    }));
                }
            }
            "response.failed" => {
                self.error_message = Some(failure_message(evt.response.as_ref()));
                return Disposition::Done;
            }
            "response.completed" => return Disposition::Done,
            _ => {}
        }
        Disposition::Continue
    }

    fn finish(self) -> Result<Value, AppError> {
        if let Some(message) = self.error_message {
            return Err(AppError::bad_gateway(message));
        }

        let mut message = Map::new();
        message.insert("role".into(), json!("assistant"));
        message.insert(
            "content".into(),
            if self.full_text.is_empty() {
                Value::Null
            } else {
                json!(self.full_text)
            },
        );
        if !self.tool_calls.is_empty() {
            message.insert("tool_calls".into(), json!(self.tool_calls));
        }
        apply_reasoning_to_message(
            &mut message,
            &self.summary_text,
            &self.reasoning_text,
            self.compat,
            self.strict_json_text,
        );

        let mut completion = json!({
            "id": self.response_id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.requested_model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": "stop",
            }],
        });
        if let Some(usage) = self.usage {
            completion["usage"] = serde_json::to_value(usage)
                .map_err(|e| AppError::bad_gateway(e.to_string()))?;
        }
        Ok(completion)
    }
}

/// Consumes the whole upstream stream and returns one chat completion.
pub async fn collect_chat_completion(
    upstream: reqwest::Response,
    mut collector: ChatCollector,
) -> Result<Value, AppError> {
    let mut events = upstream.bytes_stream().eventsource();
    while let Some(next) = events.next().await {
        let Ok(sse) = next else { break };
        if sse.data == "[DONE]" {
            break;
        }
        let Ok(evt) = serde_json::from_str::<UpstreamEvent>(&sse.data) else {
            continue;
        };
        if collector.absorb(&evt) == Disposition::Done {
            break;
        }
    }
    collector.finish()
}

/// Consumes the whole upstream stream and returns one text completion.
pub async fn collect_text_completion(
    upstream: reqwest::Response,
    requested_model: String,
    created: i64,
) -> Result<Value, AppError> {
    let mut response_id = "cmpl".to_string();
    let mut full_text = String::new();
    let mut usage: Option<UsageCounts> = None;
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
        if let Some(id) = evt.response_id() {
            response_id = id.to_string();
        }
        if let Some(counts) = extract_usage(evt.response.as_ref()) {
            usage = Some(counts);
        }
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

    let mut completion = json!({
        "id": response_id,
        "object": "text_completion",
        "created": created,
        "model": requested_model,
        "choices": [{ "index": 0, "text": full_text, "finish_reason": "stop" }],
    });
    if let Some(counts) = usage {
        completion["usage"] =
            serde_json::to_value(counts).map_err(|e| AppError::bad_gateway(e.to_string()))?;
    }
    Ok(completion)
}

/// Relays the upstream Responses stream to the client untranslated. A
/// transport error mid-stream is surfaced as a synthetic `response.failed`
/// event so the client sees a well-formed stream end.
pub async fn pump_responses_passthrough(upstream: reqwest::Response, tx: mpsc::Sender<Event>) {
    let mut events = upstream.bytes_stream().eventsource();

    while let Some(next) = events.next().await {
        match next {
            Ok(sse) => {
                let mut out = Event::default().data(sse.data.clone());
                if !sse.event.is_empty() && sse.event != "message" {
                    out = out.event(sse.event);
                }
                let done = sse.data == "[DONE]";
                if tx.send(out).await.is_err() {
                    return;
                }
                if done {
                    return;
                }
            }
            Err(err) => {
                let failed = json!({
                    "type": "response.failed",
                    "response": {
                        "status": "failed",
                        "error": { "message": format!("Upstream stream interrupted: {err}") },
                    },
                });
                let _ = tx.send(Event::default().data(failed.to_string())).await;
                break;
            }
        }
    }

    let _ = tx.send(Event::default().data("[DONE]")).await;
}

fn output_text_from_response(response: Option<&Value>) -> String {
    let Some(Value::Array(output)) = response.and_then(|r| r.get("output")) else {
        return String::new();
    };
    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(Value::Array(parts)) = item.get("content") else {
            continue;
        };
        for part in parts {
            if part.get("type").and_then(Value::as_str) == Some("output_text")
                && let Some(t) = part.get("text").and_then(Value::as_str)
            {
                text.push_str(t);
            }
        }
    }
    text
}

fn render_think_text(
    output_text: String,
    summary: &str,
    reasoning: &str,
    compat: ReasoningCompat,
    strict_json_text: bool,
) -> String {
    if strict_json_text || compat != ReasoningCompat::ThinkTags {
        return output_text;
    }
    let mut parts = Vec::new();
    if !summary.trim().is_empty() {
        parts.push(summary);
    }
    if !reasoning.trim().is_empty() {
        parts.push(reasoning);
    }
    if parts.is_empty() {
        return output_text;
    }
    format!("<think>{}</think>{output_text}", parts.join("\n\n"))
}

/// Consumes the whole upstream stream and rebuilds one Responses-format
/// response document for non-streaming passthrough clients.
pub async fn collect_responses_response(
    upstream: reqwest::Response,
    requested_model: String,
    compat: ReasoningCompat,
    request_text: Option<Value>,
) -> Result<Value, AppError> {
    let mut response_id = "resp".to_string();
    let mut created_at = json!(chrono::Utc::now().timestamp());
    let mut status = "completed".to_string();
    let mut final_response: Option<Value> = None;
    let mut full_text = String::new();
    let mut summary_text = String::new();
    let mut reasoning_text = String::new();
    let mut function_calls: Vec<Value> = Vec::new();
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

        if let Some(response) = evt.response.as_ref().and_then(Value::as_object) {
            if let Some(id) = response.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
                response_id = id.to_string();
            }
            if let Some(created) = response.get("created_at").filter(|v| v.is_number()) {
                created_at = created.clone();
            }
            if let Some(s) = response.get("status").and_then(Value::as_str).filter(|s| !s.is_empty())
            {
                status = s.to_string();
            }
        }

        match evt.kind.as_str() {
            "response.output_text.delta" => {
                full_text.push_str(evt.delta.as_deref().unwrap_or_default())
            }
            "response.reasoning_summary_text.delta" => {
                summary_text.push_str(evt.delta.as_deref().unwrap_or_default())
            }
            "response.reasoning_text.delta" => {
                reasoning_text.push_str(evt.delta.as_deref().unwrap_or_default())
            }
            "response.output_item.done" => {
                if let Some(item) = evt.item.as_ref().and_then(Value::as_object)
                    && item.get("type").and_then(Value::as_str) == Some("function_call")
                {
                    let mut fc = Map::new();
                    fc.insert("type".into(), json!("function_call"));
                    fc.insert(
                        "status".into(),
                        item.get("status")
                            .filter(|v| v.is_string())
                            .cloned()
                            .unwrap_or(json!("completed")),
                    );
                    for key in ["id", "call_id", "name", "arguments"] {
                        if let Some(v) = item.get(key).filter(|v| v.is_string()) {
                            fc.insert(key.into(), v.clone());
                        }
                    }
                    function_calls.push(Value::Object(fc));
                }
            }
            "response.completed" | "response.failed" => {
                final_response = evt.response.clone();
                if evt.kind == "response.failed" {
                    status = "failed".to_string();
                    error_message = Some(failure_message(evt.response.as_ref()));
                }
                break;
            }
            _ => {}
        }
    }

    if let Some(message) = error_message {
        return Err(AppError::bad_gateway(message));
    }

    if full_text.is_empty() {
        full_text = output_text_from_response(final_response.as_ref());
    }

    let strict_json_text = crate::reasoning::is_strict_json_text_format(request_text.as_ref());
    let rendered = render_think_text(
        full_text,
        &summary_text,
        &reasoning_text,
        compat,
        strict_json_text,
    );

    let mut output = vec![json!({
        "type": "message",
        "status": "completed",
        "role": "assistant",
        "content": [{ "type": "output_text", "text": rendered }],
    })];
    output.extend(function_calls);

    let mut response = json!({
        "id": response_id,
        "object": "response",
        "created_at": created_at,
        "status": status,
        "model": requested_model,
        "output": output,
    });

    if let Some(usage) = final_response.as_ref().and_then(|r| r.get("usage")).cloned() {
        response["usage"] = usage;
    }
    if let Some(text) = request_text {
        response["text"] = text;
    }

    if !strict_json_text {
        match compat {
            ReasoningCompat::Legacy => {
                if !summary_text.is_empty() {
                    response["reasoning_summary"] = json!(summary_text);
                }
                if !reasoning_text.is_empty() {
                    response["reasoning"] = json!(reasoning_text);
                }
            }
            ReasoningCompat::O3 => {
                let mut blocks = Vec::new();
                if !summary_text.is_empty() {
                    blocks.push(summary_text.as_str());
                }
                if !reasoning_text.is_empty() {
                    blocks.push(reasoning_text.as_str());
                }
                if !blocks.is_empty() {
                    response["reasoning"] = json!({
                        "content": [{ "type": "text", "text": blocks.join("\n\n") }],
                    });
                }
            }
            ReasoningCompat::ThinkTags => {}
        }
    }

    Ok(response)
}
