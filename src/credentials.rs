use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

const AUTH_FILE: &str = "auth.json";
const ACCOUNT_CLAIM_NAMESPACE: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// The durable credential record mirrored to `auth.json`. Unknown fields
/// written by other tools sharing the file are preserved on rewrite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRecord {
    #[serde(default)]
    pub tokens: TokenBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Durable read/write of the credential record under the bridge home dir.
/// Reads that fail for any reason mean "no stored credential", never a
/// startup failure.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    home: PathBuf,
}

impl CredentialStore {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    pub fn path(&self) -> PathBuf {
        self.home.join(AUTH_FILE)
    }

    pub fn load(&self) -> Option<AuthRecord> {
        let raw = std::fs::read_to_string(self.path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Persists the record with owner-only permissions.
    pub fn save(&self, record: &AuthRecord) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        let path = self.path();
        let body = serde_json::to_string_pretty(record)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Decodes the payload segment of a JWT without verifying the signature.
/// The bridge only reads non-security-bearing claims (expiry, account id).
pub fn parse_jwt_claims(token: &str) -> Option<Value> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let _signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// The account id embedded in the identity token's auth claims.
pub fn account_id_from_id_token(id_token: Option<&str>) -> Option<String> {
    let claims = parse_jwt_claims(id_token?)?;
    claims
        .get(ACCOUNT_CLAIM_NAMESPACE)?
        .get("chatgpt_account_id")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Expiry claim (`exp`, seconds since epoch) of an access token, if the
/// token is a decodable JWT carrying one.
pub fn token_expiry_unix(token: &str) -> Option<i64> {
    parse_jwt_claims(token)?.get("exp")?.as_i64()
}

#[cfg(test)]
pub fn encode_test_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_record_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        assert!(store.load().is_none());

        let record = AuthRecord {
            tokens: TokenBundle {
                access_token: Some("at".to_string()),
                account_id: Some("acc".to_string()),
                ..Default::default()
            },
            last_refresh: Some("2026-01-01T00:00:00Z".to_string()),
            extra: Default::default(),
        };
        store.save(&record).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.tokens.access_token.as_deref(), Some("at"));
        assert_eq!(loaded.tokens.account_id.as_deref(), Some("acc"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_file_reads_as_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        std::fs::write(store.path(), "not json").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn parses_jwt_claims_and_account_id() {
        let token = encode_test_jwt(&json!({
            "exp": 1_900_000_000,
            "https://api.openai.com/auth": { "chatgpt_account_id": "acc_42" }
        }));
        assert_eq!(token_expiry_unix(&token), Some(1_900_000_000));
        assert_eq!(
            account_id_from_id_token(Some(&token)).as_deref(),
            Some("acc_42")
        );
        assert!(parse_jwt_claims("opaque-token").is_none());
        assert!(account_id_from_id_token(Some("a.b")).is_none());
    }
}
