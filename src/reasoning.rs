use crate::error::AppError;
use serde_json::{Map, Value, json};

pub const EFFORT_SUFFIXES: [&str; 5] = ["minimal", "low", "medium", "high", "xhigh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningSummary {
    Auto,
    Concise,
    Detailed,
    None,
}

impl ReasoningSummary {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "concise" => Some(Self::Concise),
            "detailed" => Some(Self::Detailed),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Concise => "concise",
            Self::Detailed => "detailed",
            Self::None => "none",
        }
    }
}

/// How reasoning content is surfaced to clients whose protocol has no
/// native field for it. "current" is accepted as an alias for "legacy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningCompat {
    ThinkTags,
    O3,
    Legacy,
}

impl ReasoningCompat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "think-tags" => Some(Self::ThinkTags),
            "o3" => Some(Self::O3),
            "legacy" | "current" => Some(Self::Legacy),
            _ => None,
        }
    }
}

/// Strips a single trailing effort suffix (joined by `-` or `_`) from a
/// model name. Returns the remaining base and the stripped effort, if any.
pub fn strip_effort_suffix(name: &str) -> (String, Option<ReasoningEffort>) {
    let lowered = name.to_ascii_lowercase();
    for sep in ['-', '_'] {
        for effort in EFFORT_SUFFIXES {
            let suffix = format!("{sep}{effort}");
            if lowered.ends_with(&suffix) {
                let base = name[..name.len() - suffix.len()].to_string();
                return (base, ReasoningEffort::parse(effort));
            }
        }
    }
    (name.to_string(), None)
}

/// Effort encoded in the requested model name, e.g. `gpt-5-high`.
pub fn effort_from_model_name(name: Option<&str>) -> Option<ReasoningEffort> {
    let name = name?;
    let without_tag = name.split(':').next().unwrap_or(name).trim();
    strip_effort_suffix(without_tag).1
}

/// Builds the upstream `reasoning` parameter by merging three layers,
/// highest priority first: per-request override, effort encoded in the
/// model name, server-wide defaults. An explicitly requested effort the
/// resolved model does not support is a 400, never a silent clamp.
pub fn build_reasoning_param(
    default_effort: ReasoningEffort,
    default_summary: ReasoningSummary,
    overrides: Option<&Value>,
    model_effort: Option<ReasoningEffort>,
    allowed: &[ReasoningEffort],
) -> Result<Option<Value>, AppError> {
    let override_effort = match overrides
        .and_then(|v| v.get("effort"))
        .and_then(|v| v.as_str())
    {
        Some(s) => Some(ReasoningEffort::parse(s).ok_or_else(|| {
            AppError::bad_request(format!("Unknown reasoning effort '{s}'"))
        })?),
        None => None,
    };
    let override_summary = match overrides
        .and_then(|v| v.get("summary"))
        .and_then(|v| v.as_str())
    {
        Some(s) => Some(ReasoningSummary::parse(s).ok_or_else(|| {
            AppError::bad_request(format!("Unknown reasoning summary '{s}'"))
        })?),
        None => None,
    };

    let explicit = override_effort.or(model_effort);
    let effort = explicit.unwrap_or(default_effort);

    if allowed.is_empty() {
        // Model takes no reasoning controls at all.
        if explicit.is_some() {
            return Err(AppError::bad_request(format!(
                "Reasoning effort '{}' is not supported by this model",
                effort.as_str()
            )));
        }
        return Ok(None);
    }

    let effort = if allowed.contains(&effort) {
        effort
    } else if explicit.is_some() {
        return Err(AppError::bad_request(format!(
            "Reasoning effort '{}' is not supported by this model",
            effort.as_str()
        )));
    } else if allowed.contains(&ReasoningEffort::Medium) {
        ReasoningEffort::Medium
    } else {
        allowed[0]
    };

    let summary = override_summary.unwrap_or(default_summary);
    let mut param = Map::new();
    param.insert("effort".to_string(), json!(effort.as_str()));
    if summary != ReasoningSummary::None {
        param.insert("summary".to_string(), json!(summary.as_str()));
    }
    Ok(Some(Value::Object(param)))
}

/// Splices accumulated reasoning text into an aggregated assistant message
/// according to the configured compatibility mode. A strict-JSON text
/// format suppresses reasoning in client output entirely.
pub fn apply_reasoning_to_message(
    message: &mut Map<String, Value>,
    summary_text: &str,
    full_text: &str,
    compat: ReasoningCompat,
    strict_json_text: bool,
) {
    if strict_json_text {
        return;
    }
    let mut parts: Vec<&str> = Vec::new();
    if !summary_text.trim().is_empty() {
        parts.push(summary_text);
    }
    if !full_text.trim().is_empty() {
        parts.push(full_text);
    }
    if parts.is_empty() {
        return;
    }
    match compat {
        ReasoningCompat::ThinkTags => {
            let existing = message
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let combined = parts.join("\n\n");
            message.insert(
                "content".to_string(),
                json!(format!("<think>{combined}</think>{existing}")),
            );
        }
        ReasoningCompat::O3 => {
            message.insert(
                "reasoning".to_string(),
                json!({ "content": [{ "type": "text", "text": parts.join("\n\n") }] }),
            );
        }
        ReasoningCompat::Legacy => {
            if !summary_text.trim().is_empty() {
                message.insert("reasoning_summary".to_string(), json!(summary_text));
            }
            if !full_text.trim().is_empty() {
                message.insert("reasoning".to_string(), json!(full_text));
            }
        }
    }
}

/// True when the request asked for a strict structured-output text format,
/// in which case reasoning text must not leak into client output.
pub fn is_strict_json_text_format(text_obj: Option<&Value>) -> bool {
    matches!(
        text_obj
            .and_then(|v| v.get("format"))
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str()),
        Some("json_schema") | Some("json_object")
    )
}
