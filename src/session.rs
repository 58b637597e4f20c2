use serde_json::Value;
use sha2::{Digest, Sha256};

/// Session id for prompt cache affinity. The client header wins when
/// present; otherwise the id is derived from the conversation content so
/// repeated turns of the same conversation land in the same cache slot.
pub fn ensure_session_id(
    instructions: Option<&str>,
    input_items: &Value,
    client_session: Option<&str>,
) -> String {
    if let Some(id) = client_session.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(instructions.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(
        serde_json::to_string(input_items)
            .unwrap_or_default()
            .as_bytes(),
    );
    let digest = hex::encode(hasher.finalize());
    format!("sess_{}", &digest[..32])
}
