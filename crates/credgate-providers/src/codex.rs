use std::time::Duration;

use async_trait::async_trait;
use credgate_auth::record::AuthRecord;
use credgate_auth::{AuthError, Authenticator, LoginOptions};
use credgate_common::GlobalConfig;
use credgate_usage::{CodexQuotaSnapshot, parse_codex_quota_snapshot};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::http::{build_client, headers_from_response};
use crate::oauth::callback::{CALLBACK_WAIT, CallbackServer};
use crate::oauth::{decode_jwt_claims, generate_pkce, generate_state};

pub const PROVIDER_NAME: &str = "codex";
const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const DEFAULT_ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const OAUTH_SCOPE: &str = "openid profile email offline_access";
const OAUTH_ORIGINATOR: &str = "codex_cli_rs";
const CALLBACK_BASE_PORT: u16 = 1455;
const CALLBACK_PATH: &str = "/auth/callback";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    plan: Option<String>,
    account_id: Option<String>,
}

/// OpenAI Codex accounts, authenticated through the authorization-code flow
/// with PKCE against the ChatGPT issuer.
#[derive(Debug, Default)]
pub struct CodexAuthenticator;

impl CodexAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for CodexAuthenticator {
    fn provider(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(Duration::from_secs(300))
    }

    async fn login(
        &self,
        config: &GlobalConfig,
        options: &LoginOptions,
    ) -> Result<AuthRecord, AuthError> {
        let client = build_client(config.proxy.as_deref())?;
        let pkce = generate_pkce();
        let state = generate_state();

        let server = CallbackServer::bind(CALLBACK_BASE_PORT, CALLBACK_PATH).await?;
        let redirect_uri = server.redirect_uri();
        let auth_url = build_authorize_url(&redirect_uri, &pkce.challenge, &state);

        info!(provider = PROVIDER_NAME, "open this URL to authorize:");
        println!("\n  {auth_url}\n");
        if options.no_browser {
            println!("  (waiting for the callback on {redirect_uri})");
        }

        let callback = server.wait_for_callback(CALLBACK_WAIT).await?;
        if let Some(error) = callback.error {
            return Err(AuthError::denied(format!("authorization failed: {error}")));
        }
        if callback.state != state {
            return Err(AuthError::fatal("oauth state mismatch"));
        }
        if callback.code.is_empty() {
            return Err(AuthError::fatal("no authorization code received"));
        }

        let tokens =
            exchange_code(&client, &redirect_uri, &pkce.verifier, &callback.code).await?;
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::fatal("token response missing refresh_token"))?;
        let id_token = tokens
            .id_token
            .clone()
            .ok_or_else(|| AuthError::fatal("token response missing id_token"))?;

        let claims = parse_id_token_claims(&id_token);
        let account_id = claims
            .account_id
            .clone()
            .ok_or_else(|| AuthError::fatal("id token missing chatgpt account id"))?;

        let label = options
            .label
            .clone()
            .or_else(|| claims.email.clone())
            .unwrap_or_else(|| format!("codex-{account_id}"));
        let expires_at =
            OffsetDateTime::now_utc() + Duration::from_secs(tokens.expires_in.unwrap_or(3600));

        let mut record = AuthRecord::new(
            format!("{PROVIDER_NAME}-{}.json", sanitize_label(&label)),
            PROVIDER_NAME,
        );
        record.label = label;
        record.storage = json!({
            "access_token": tokens.access_token,
            "refresh_token": refresh_token,
            "id_token": id_token,
            "account_id": account_id,
        });
        record
            .metadata
            .insert("account_id".into(), json!(account_id));
        record
            .metadata
            .insert("expires_at".into(), json!(expires_at.unix_timestamp()));
        if let Some(email) = claims.email {
            record.metadata.insert("email".into(), json!(email));
        }
        if let Some(plan) = claims.plan {
            record.metadata.insert("plan_type".into(), json!(plan));
        }
        Ok(record)
    }

    async fn refresh(&self, record: &AuthRecord) -> Result<AuthRecord, AuthError> {
        let refresh_token = record
            .storage
            .get("refresh_token")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::fatal("record has no refresh token"))?;

        let client = build_client(None)?;
        let tokens = refresh_access_token(&client, refresh_token).await?;

        let mut refreshed = record.clone();
        let expires_at =
            OffsetDateTime::now_utc() + Duration::from_secs(tokens.expires_in.unwrap_or(3600));
        refreshed.storage["access_token"] = json!(tokens.access_token);
        if let Some(new_refresh) = tokens.refresh_token {
            refreshed.storage["refresh_token"] = json!(new_refresh);
        }
        if let Some(id_token) = tokens.id_token {
            let claims = parse_id_token_claims(&id_token);
            if refreshed.label.is_empty()
                && let Some(email) = claims.email
            {
                refreshed.label = email;
            }
            refreshed.storage["id_token"] = json!(id_token);
        }
        refreshed
            .metadata
            .insert("expires_at".into(), json!(expires_at.unix_timestamp()));
        debug!(id = %record.id, "codex token refreshed");
        Ok(refreshed)
    }
}

/// Probe the Codex usage endpoint and parse the `x-codex-*` headers.
pub async fn probe_codex_quota(
    client: &wreq::Client,
    record: &AuthRecord,
) -> Result<CodexQuotaSnapshot, AuthError> {
    let access_token = record
        .storage
        .get("access_token")
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::fatal("record has no access token"))?;
    let account_id = record
        .metadata_str("account_id")
        .or_else(|| record.storage.get("account_id").and_then(|v| v.as_str()))
        .unwrap_or_default();

    let base = record.base_url().unwrap_or(DEFAULT_BASE_URL);
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/codex").unwrap_or(base);
    let url = format!("{base}/wham/usage");

    let response = client
        .get(&url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Accept", "application/json")
        .header("chatgpt-account-id", account_id)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("codex usage probe: {err}")))?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(AuthError::denied(format!("codex usage probe: {status}")));
    }
    if !status.is_success() {
        return Err(AuthError::transient(format!("codex usage probe: {status}")));
    }

    let headers = headers_from_response(response.headers());
    parse_codex_quota_snapshot(&headers)
        .ok_or_else(|| AuthError::fatal("usage response carried no x-codex headers"))
}

fn build_authorize_url(redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    let query = [
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", redirect_uri),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("state", state),
        ("originator", OAUTH_ORIGINATOR),
    ]
    .into_iter()
    .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
    .collect::<Vec<_>>()
    .join("&");
    format!("{DEFAULT_ISSUER}/oauth/authorize?{query}")
}

async fn exchange_code(
    client: &wreq::Client,
    redirect_uri: &str,
    code_verifier: &str,
    code: &str,
) -> Result<TokenResponse, AuthError> {
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&code_verifier={}",
        urlencoding::encode(code),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(code_verifier),
    );
    post_token_request(client, body).await
}

async fn refresh_access_token(
    client: &wreq::Client,
    refresh_token: &str,
) -> Result<TokenResponse, AuthError> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(CLIENT_ID),
    );
    post_token_request(client, body).await
}

async fn post_token_request(
    client: &wreq::Client,
    body: String,
) -> Result<TokenResponse, AuthError> {
    let response = client
        .post(format!("{DEFAULT_ISSUER}/oauth/token"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("token endpoint: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read token response: {err}")))?;

    if status.as_u16() == 400 || status.as_u16() == 401 {
        let text = String::from_utf8_lossy(&bytes);
        return Err(AuthError::expired(format!("token endpoint {status}: {text}")));
    }
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(AuthError::transient(format!(
            "token endpoint {status}: {text}"
        )));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse token response: {err}")))
}

fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let Some(payload) = decode_jwt_claims(id_token) else {
        return claims;
    };

    claims.email = payload
        .get("email")
        .and_then(|value| value.as_str())
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(|value| value.as_str())
        })
        .map(String::from);

    if let Some(auth) = payload.get("https://api.openai.com/auth") {
        claims.plan = auth
            .get("chatgpt_plan_type")
            .and_then(|value| value.as_str())
            .map(String::from);
        claims.account_id = auth
            .get("chatgpt_account_id")
            .and_then(|value| value.as_str())
            .map(String::from);
    }
    claims
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn fake_id_token(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn id_token_claims_read_openai_namespaces() {
        let token = fake_id_token(json!({
            "https://api.openai.com/profile": {"email": "user@example.com"},
            "https://api.openai.com/auth": {
                "chatgpt_plan_type": "team",
                "chatgpt_account_id": "acct-123"
            }
        }));
        let claims = parse_id_token_claims(&token);
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
        assert_eq!(claims.plan.as_deref(), Some("team"));
        assert_eq!(claims.account_id.as_deref(), Some("acct-123"));
    }

    #[test]
    fn authorize_url_carries_pkce_and_state() {
        let url = build_authorize_url("http://127.0.0.1:1455/auth/callback", "challenge-x", "state-y");
        assert!(url.starts_with("https://auth.openai.com/oauth/authorize?"));
        assert!(url.contains("code_challenge=challenge-x"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=state-y"));
        assert!(url.contains(&format!("client_id={CLIENT_ID}")));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A1455%2Fauth%2Fcallback"));
    }

    #[test]
    fn labels_are_filesystem_safe() {
        assert_eq!(sanitize_label("user@example.com"), "user@example.com");
        assert_eq!(sanitize_label("we ird/label"), "we_ird_label");
    }
}
