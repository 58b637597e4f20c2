use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::RngCore;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::io::{BufRead, Write};
use tracing::info;

use crate::credentials::{AuthRecord, CredentialStore, account_id_from_id_token};
use crate::settings::{OAUTH_SCOPE, Settings};

pub const REDIRECT_URI: &str = "http://localhost:1455/auth/callback";

/// PKCE verifier/challenge pair plus the CSRF state for one login attempt.
pub struct PkceSession {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceSession {
    pub fn generate() -> Self {
        let verifier = random_hex(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
            state: random_hex(32),
        }
    }
}

const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn urlencode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE).to_string()
}

pub fn authorize_url(authorize_endpoint: &str, client_id: &str, session: &PkceSession) -> String {
    let params = [
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", REDIRECT_URI),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", &session.challenge),
        ("code_challenge_method", "S256"),
        ("state", &session.state),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{authorize_endpoint}?{query}")
}

/// Extracts the authorization code from a pasted redirect URL. A state
/// mismatch yields `None` rather than an error so a stray or replayed
/// redirect never completes a login.
pub fn parse_redirect(url: &str, expected_state: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);

    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("code", v)) => code = Some(v.to_string()),
            Some(("state", v)) => state = Some(v.to_string()),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return None;
    }
    code.filter(|c| !c.is_empty())
}

pub async fn exchange_code(
    http: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    code: &str,
    verifier: &str,
) -> anyhow::Result<Value> {
    let resp = http
        .post(token_url)
        .json(&json!({
            "grant_type": "authorization_code",
            "client_id": client_id,
            "code": code,
            "code_verifier": verifier,
            "redirect_uri": REDIRECT_URI,
        }))
        .send()
        .await?;

    let status = resp.status();
    let body: Value = resp.json().await?;
    if status.as_u16() >= 400 {
        anyhow::bail!("token endpoint returned {status}: {body}");
    }
    Ok(body)
}

/// Interactive login: prints the authorization URL, reads the pasted
/// redirect from stdin, exchanges the code, and persists the credential.
pub async fn login(settings: &Settings, http: &reqwest::Client) -> anyhow::Result<()> {
    let session = PkceSession::generate();
    let url = authorize_url(&settings.authorize_url, &settings.client_id, &session);

    println!("Open this URL in your browser and sign in:\n\n  {url}\n");
    println!("Then paste the full redirect URL here:");
    print!("> ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let code = parse_redirect(line.trim(), &session.state)
        .ok_or_else(|| anyhow::anyhow!("redirect URL missing code or state did not match"))?;

    let tokens = exchange_code(
        http,
        &settings.oauth_token_url,
        &settings.client_id,
        &code,
        &session.verifier,
    )
    .await?;

    let id_token = tokens
        .get("id_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut record = AuthRecord::default();
    record.tokens.access_token = tokens
        .get("access_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.tokens.refresh_token = tokens
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.tokens.account_id = account_id_from_id_token(id_token.as_deref());
    record.tokens.id_token = id_token;
    record.last_refresh = Some(chrono::Utc::now().to_rfc3339());

    let store = CredentialStore::new(settings.home.clone());
    store.save(&record)?;
    info!(path = %store.path().display(), "credentials saved");
    println!("Login complete.");
    Ok(())
}
