use crate::reasoning::{ReasoningEffort, strip_effort_suffix};
use crate::settings::Settings;
use serde_json::{Value, json};

use ReasoningEffort::{High, Low, Medium, Minimal, Xhigh};

/// Known model families and the reasoning efforts each one accepts.
/// Unknown names pass through untouched so new upstream models keep
/// working without a release.
const MODEL_GROUPS: [(&str, &[ReasoningEffort]); 9] = [
    ("gpt-5", &[High, Medium, Low, Minimal]),
    ("gpt-5.1", &[High, Medium, Low]),
    ("gpt-5.2", &[Xhigh, High, Medium, Low]),
    ("gpt-5-codex", &[High, Medium, Low]),
    ("gpt-5.2-codex", &[Xhigh, High, Medium, Low]),
    ("gpt-5.1-codex", &[High, Medium, Low]),
    ("gpt-5.1-codex-max", &[Xhigh, High, Medium, Low]),
    ("gpt-5.1-codex-mini", &[]),
    ("codex-mini", &[]),
];

const MODEL_ALIASES: [(&str, &str); 18] = [
    ("gpt5", "gpt-5"),
    ("gpt-5-latest", "gpt-5"),
    ("gpt-5", "gpt-5"),
    ("gpt-5.1", "gpt-5.1"),
    ("gpt5.2", "gpt-5.2"),
    ("gpt-5.2", "gpt-5.2"),
    ("gpt-5.2-latest", "gpt-5.2"),
    ("gpt5.2-codex", "gpt-5.2-codex"),
    ("gpt-5.2-codex", "gpt-5.2-codex"),
    ("gpt-5.2-codex-latest", "gpt-5.2-codex"),
    ("gpt5-codex", "gpt-5-codex"),
    ("gpt-5-codex", "gpt-5-codex"),
    ("gpt-5-codex-latest", "gpt-5-codex"),
    ("gpt-5.1-codex", "gpt-5.1-codex"),
    ("gpt-5.1-codex-max", "gpt-5.1-codex-max"),
    ("codex", "codex-mini-latest"),
    ("codex-mini", "codex-mini-latest"),
    ("codex-mini-latest", "codex-mini-latest"),
];

/// Resolves a requested model name to the upstream identifier. An operator
/// debug override always wins outright. A trailing `:tag` and a trailing
/// reasoning-effort suffix are stripped before alias lookup.
pub fn normalize_model_name(name: Option<&str>, debug_model: Option<&str>) -> String {
    if let Some(forced) = debug_model {
        let forced = forced.trim();
        if !forced.is_empty() {
            return forced.to_string();
        }
    }
    let name = match name {
        Some(n) if !n.trim().is_empty() => n,
        _ => return "gpt-5".to_string(),
    };
    let base = name.split(':').next().unwrap_or(name).trim();
    let (base, _) = strip_effort_suffix(base);
    for (alias, resolved) in MODEL_ALIASES {
        if alias == base {
            return resolved.to_string();
        }
    }
    base
}

/// Efforts the resolved model accepts. Unknown models accept every effort
/// so pass-through names are never rejected here.
pub fn allowed_efforts_for_model(model: &str) -> &'static [ReasoningEffort] {
    for (group, efforts) in MODEL_GROUPS {
        if model == group || (model == "codex-mini-latest" && group == "codex-mini") {
            return efforts;
        }
    }
    &[Xhigh, High, Medium, Low, Minimal]
}

/// The codex family carries its own instruction set when one is configured.
pub fn instructions_for_model<'a>(model: &str, settings: &'a Settings) -> &'a str {
    if model.starts_with("gpt-5-codex")
        || model.starts_with("gpt-5.1-codex")
        || model.starts_with("gpt-5.2-codex")
    {
        if let Some(codex) = settings.codex_instructions.as_deref() {
            if !codex.trim().is_empty() {
                return codex;
            }
        }
    }
    &settings.base_instructions
}

fn model_ids(expose_reasoning: bool) -> Vec<String> {
    let mut ids = Vec::new();
    for (base, efforts) in MODEL_GROUPS {
        ids.push(base.to_string());
        if expose_reasoning {
            ids.extend(efforts.iter().map(|e| format!("{base}-{}", e.as_str())));
        }
    }
    ids
}

pub fn openai_models(expose_reasoning: bool) -> Vec<Value> {
    model_ids(expose_reasoning)
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "owner" }))
        .collect()
}

pub fn ollama_models(expose_reasoning: bool) -> Vec<Value> {
    model_ids(expose_reasoning)
        .into_iter()
        .map(|id| {
            json!({
                "name": id,
                "model": id,
                "modified_at": "2023-10-01T00:00:00Z",
                "size": 815_319_791u64,
                "digest": "8648f39daa8fbf5b18c7b4e6a8fb4990c692751d49917417b8842ca5758e7ffc",
                "details": {
                    "parent_model": "",
                    "format": "gguf",
                    "family": "llama",
                    "families": ["llama"],
                    "parameter_size": "8.0B",
                    "quantization_level": "Q4_0"
                }
            })
        })
        .collect()
}

/// Fixed eval timings reported on Ollama final chunks; the upstream API
/// exposes no per-token timing, so these placate clients that render stats.
pub fn ollama_fake_eval() -> Value {
    json!({
        "total_duration": 8_497_226_791u64,
        "load_duration": 1_747_193_958u64,
        "prompt_eval_count": 24,
        "prompt_eval_duration": 269_219_750u64,
        "eval_count": 247,
        "eval_duration": 6_413_802_458u64
    })
}
