use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::credentials::{
    AuthRecord, CredentialStore, account_id_from_id_token, token_expiry_unix,
};
use crate::error::AppError;
use crate::settings::OAUTH_SCOPE;

/// Access token considered stale this close to its `exp` claim.
const EXPIRY_SLACK_SECS: i64 = 5 * 60;
/// When the token carries no decodable expiry, refresh after this long
/// since the last successful refresh.
const REFRESH_INTERVAL_SECS: i64 = 55 * 60;

/// Hands out a usable (access token, account id) pair for upstream calls,
/// refreshing through the OAuth token endpoint when the stored access token
/// has gone stale.
#[derive(Debug, Clone)]
pub struct TokenManager {
    store: CredentialStore,
    client_id: String,
    token_url: String,
}

impl TokenManager {
    pub fn new(store: CredentialStore, client_id: String, token_url: String) -> Self {
        Self {
            store,
            client_id,
            token_url,
        }
    }

    /// Loads the stored credential, refreshing first if it looks stale.
    /// Refresh failure is non-fatal: the stored token is still returned and
    /// the upstream gets to decide whether it is actually expired.
    pub async fn get_valid_credential(
        &self,
        http: &reqwest::Client,
    ) -> Result<(String, String), AppError> {
        let mut record = self.store.load().unwrap_or_default();

        if needs_refresh(record.tokens.access_token.as_deref(), record.last_refresh.as_deref()) {
            if let Some(refreshed) = self.refresh(http, &record).await {
                record = refreshed;
            }
        }

        let access_token = record.tokens.access_token.clone();
        let account_id = record
            .tokens
            .account_id
            .clone()
            .or_else(|| account_id_from_id_token(record.tokens.id_token.as_deref()));

        match (access_token, account_id) {
            (Some(token), Some(account)) if !token.is_empty() && !account.is_empty() => {
                Ok((token, account))
            }
            _ => Err(AppError::new(
                axum::http::StatusCode::UNAUTHORIZED,
                "Missing credentials. Run 'chatbridge login' first.",
            )),
        }
    }

    /// Exchanges the stored refresh token for fresh tokens. Returns the
    /// updated record on success, `None` on any failure.
    async fn refresh(&self, http: &reqwest::Client, record: &AuthRecord) -> Option<AuthRecord> {
        let refresh_token = record.tokens.refresh_token.as_deref()?;
        debug!("refreshing access token");

        let resp = http
            .post(&self.token_url)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.client_id,
                "scope": OAUTH_SCOPE,
            }))
            .send()
            .await
            .map_err(|err| warn!(error = %err, "token refresh request failed"))
            .ok()?;

        if resp.status().as_u16() >= 400 {
            warn!(status = %resp.status(), "token endpoint rejected refresh");
            return None;
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| warn!(error = %err, "token refresh returned invalid JSON"))
            .ok()?;

        let access_token = body.get("access_token")?.as_str()?.to_string();
        let id_token = body.get("id_token")?.as_str()?.to_string();

        let mut updated = record.clone();
        updated.tokens.access_token = Some(access_token);
        updated.tokens.account_id =
            account_id_from_id_token(Some(&id_token)).or(updated.tokens.account_id);
        updated.tokens.id_token = Some(id_token);
        if let Some(rotated) = body.get("refresh_token").and_then(Value::as_str) {
            updated.tokens.refresh_token = Some(rotated.to_string());
        }
        updated.last_refresh = Some(Utc::now().to_rfc3339());

        if let Err(err) = self.store.save(&updated) {
            warn!(error = %err, "could not persist refreshed credentials");
        }
        Some(updated)
    }
}

/// Staleness check: expiry claim within the slack window when the token is
/// a decodable JWT, otherwise elapsed time since `last_refresh`.
pub fn needs_refresh(access_token: Option<&str>, last_refresh: Option<&str>) -> bool {
    let Some(token) = access_token.filter(|t| !t.is_empty()) else {
        return true;
    };

    if let Some(exp) = token_expiry_unix(token) {
        return exp <= Utc::now().timestamp() + EXPIRY_SLACK_SECS;
    }

    // No expiry claim and no refresh history: leave the token alone and let
    // the upstream reject it if it is actually dead.
    let Some(last_refresh) = last_refresh else {
        return false;
    };
    match DateTime::parse_from_rfc3339(last_refresh) {
        Ok(at) => Utc::now() - at.with_timezone(&Utc) >= Duration::seconds(REFRESH_INTERVAL_SECS),
        Err(_) => true,
    }
}
