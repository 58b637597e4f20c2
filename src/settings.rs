use crate::reasoning::{ReasoningCompat, ReasoningEffort, ReasoningSummary};
use std::path::PathBuf;

pub const DEFAULT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const DEFAULT_ISSUER: &str = "https://auth.openai.com";
pub const DEFAULT_RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
pub const OAUTH_SCOPE: &str = "openid profile email offline_access";

const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful assistant. Answer the user as accurately and concisely as you can.";

/// Server-wide behavior knobs, resolved once at startup from `CHATBRIDGE_*`
/// environment variables. Immutable afterwards; shared read-only across
/// connections.
#[derive(Debug, Clone)]
pub struct Settings {
    pub reasoning_effort: ReasoningEffort,
    pub reasoning_summary: ReasoningSummary,
    pub reasoning_compat: ReasoningCompat,
    pub debug_model: Option<String>,
    pub expose_reasoning_models: bool,
    pub default_web_search: bool,
    pub base_instructions: String,
    pub codex_instructions: Option<String>,
    pub client_id: String,
    pub oauth_token_url: String,
    pub authorize_url: String,
    pub responses_url: String,
    pub home: PathBuf,
    pub ollama_version: String,
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// The credential home: `CHATBRIDGE_HOME`, then `CODEX_HOME`, then
/// `~/.chatbridge`.
pub fn resolve_home() -> PathBuf {
    if let Some(home) = env_trimmed("CHATBRIDGE_HOME") {
        return PathBuf::from(home);
    }
    if let Some(home) = env_trimmed("CODEX_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatbridge")
}

fn load_instructions_file(key: &str, fallback_name: &str) -> Option<String> {
    let candidates = [
        env_trimmed(key).map(PathBuf::from),
        Some(PathBuf::from(fallback_name)),
    ];
    for candidate in candidates.into_iter().flatten() {
        match std::fs::read_to_string(&candidate) {
            Ok(content) if !content.trim().is_empty() => return Some(content),
            Ok(_) => {}
            Err(_) => {}
        }
    }
    None
}

impl Settings {
    pub fn from_env() -> Self {
        let issuer = env_trimmed("CHATBRIDGE_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.to_string());
        let base_instructions = load_instructions_file("CHATBRIDGE_INSTRUCTIONS_FILE", "prompt.md")
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
        let codex_instructions =
            load_instructions_file("CHATBRIDGE_CODEX_INSTRUCTIONS_FILE", "prompt_codex.md");
        Self {
            reasoning_effort: env_trimmed("CHATBRIDGE_REASONING_EFFORT")
                .and_then(|v| ReasoningEffort::parse(&v))
                .unwrap_or(ReasoningEffort::Medium),
            reasoning_summary: env_trimmed("CHATBRIDGE_REASONING_SUMMARY")
                .and_then(|v| ReasoningSummary::parse(&v))
                .unwrap_or(ReasoningSummary::Auto),
            reasoning_compat: env_trimmed("CHATBRIDGE_REASONING_COMPAT")
                .and_then(|v| ReasoningCompat::parse(&v))
                .unwrap_or(ReasoningCompat::ThinkTags),
            debug_model: env_trimmed("CHATBRIDGE_DEBUG_MODEL"),
            expose_reasoning_models: env_flag("CHATBRIDGE_EXPOSE_REASONING_MODELS"),
            default_web_search: env_flag("CHATBRIDGE_ENABLE_WEB_SEARCH"),
            base_instructions,
            codex_instructions,
            client_id: env_trimmed("CHATBRIDGE_CLIENT_ID")
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            oauth_token_url: format!("{}/oauth/token", issuer.trim_end_matches('/')),
            authorize_url: format!("{}/oauth/authorize", issuer.trim_end_matches('/')),
            responses_url: env_trimmed("CHATBRIDGE_RESPONSES_URL")
                .unwrap_or_else(|| DEFAULT_RESPONSES_URL.to_string()),
            home: resolve_home(),
            ollama_version: env_trimmed("CHATBRIDGE_OLLAMA_VERSION")
                .unwrap_or_else(|| "0.12.10".to_string()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            reasoning_effort: ReasoningEffort::Medium,
            reasoning_summary: ReasoningSummary::Auto,
            reasoning_compat: ReasoningCompat::ThinkTags,
            debug_model: None,
            expose_reasoning_models: false,
            default_web_search: false,
            base_instructions: DEFAULT_INSTRUCTIONS.to_string(),
            codex_instructions: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            oauth_token_url: "https://auth.openai.com/oauth/token".to_string(),
            authorize_url: "https://auth.openai.com/oauth/authorize".to_string(),
            responses_url: DEFAULT_RESPONSES_URL.to_string(),
            home: std::env::temp_dir().join("chatbridge-tests"),
            ollama_version: "0.12.10".to_string(),
        }
    }
}
