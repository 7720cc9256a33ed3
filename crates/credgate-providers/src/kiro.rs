use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use credgate_auth::record::AuthRecord;
use credgate_auth::{AuthError, Authenticator, LoginOptions};
use credgate_common::GlobalConfig;
use credgate_usage::{KiroUsageSnapshot, parse_kiro_usage_snapshot};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::http::build_client;
use crate::oauth::callback::{CALLBACK_WAIT, CallbackServer};
use crate::oauth::{email_from_jwt, generate_pkce, generate_state};

pub const PROVIDER_NAME: &str = "kiro";
const AUTH_SERVICE_ENDPOINT: &str = "https://prod.us-east-1.auth.desktop.kiro.dev";
const DEFAULT_USAGE_BASE_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com";
const CALLBACK_BASE_PORT: u16 = 11123;
const CALLBACK_PATH: &str = "/oauth/callback";
const IDE_TOKEN_FILE: &str = "kiro-auth-token.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    profile_arn: String,
    #[serde(default)]
    expires_in: i64,
}

/// Token file written by the Kiro IDE under `~/.aws/sso/cache/`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdeTokenFile {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    profile_arn: String,
    #[serde(default)]
    expires_at: String,
    #[serde(default)]
    auth_method: String,
    #[serde(default)]
    provider: String,
}

/// Kiro accounts: social login (Google/GitHub) through the Kiro auth
/// service with PKCE, or import of the IDE's cached token file.
#[derive(Debug, Default)]
pub struct KiroAuthenticator;

impl KiroAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for KiroAuthenticator {
    fn provider(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn refresh_lead(&self) -> Option<Duration> {
        Some(Duration::from_secs(600))
    }

    async fn login(
        &self,
        config: &GlobalConfig,
        options: &LoginOptions,
    ) -> Result<AuthRecord, AuthError> {
        if let Some(path) = &options.import_path {
            return import_token_file(path, options);
        }

        let idp = match options.idp.as_deref().unwrap_or("Google") {
            idp if idp.eq_ignore_ascii_case("github") => "Github",
            _ => "Google",
        };

        let client = build_client(config.proxy.as_deref())?;
        let pkce = generate_pkce();
        let state = generate_state();

        let server = CallbackServer::bind(CALLBACK_BASE_PORT, CALLBACK_PATH).await?;
        let redirect_uri = server.redirect_uri();
        let login_url = build_login_url(idp, &redirect_uri, &pkce.challenge, &state);

        info!(provider = PROVIDER_NAME, idp, "open this URL to authorize:");
        println!("\n  {login_url}\n");
        if options.no_browser {
            println!("  (waiting for the callback on {redirect_uri})");
        }

        let callback = server.wait_for_callback(CALLBACK_WAIT).await?;
        if let Some(error) = callback.error {
            return Err(AuthError::denied(format!("authentication error: {error}")));
        }
        if callback.state != state {
            return Err(AuthError::fatal("oauth state validation failed"));
        }
        if callback.code.is_empty() {
            return Err(AuthError::fatal("no authorization code received"));
        }

        let tokens = create_token(&client, &callback.code, &pkce.verifier, &redirect_uri).await?;
        let expires_in = if tokens.expires_in > 0 {
            tokens.expires_in
        } else {
            3600
        };
        let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(expires_in as u64);

        let email = email_from_jwt(&tokens.access_token);
        let label = options
            .label
            .clone()
            .or_else(|| email.clone())
            .unwrap_or_else(|| format!("{}-account", idp.to_ascii_lowercase()));

        let mut record = AuthRecord::new(
            format!("{PROVIDER_NAME}-{}.json", sanitize_label(&label)),
            PROVIDER_NAME,
        );
        record.label = label;
        record.storage = json!({
            "access_token": tokens.access_token,
            "refresh_token": tokens.refresh_token,
            "profile_arn": tokens.profile_arn,
        });
        record.metadata.insert("auth_method".into(), json!("social"));
        record.metadata.insert("idp".into(), json!(idp));
        record
            .metadata
            .insert("expires_at".into(), json!(expires_at.unix_timestamp()));
        if !tokens.profile_arn.is_empty() {
            record
                .metadata
                .insert("profile_arn".into(), json!(tokens.profile_arn));
        }
        if let Some(email) = email {
            record.metadata.insert("email".into(), json!(email));
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
        let response = client
            .post(format!("{AUTH_SERVICE_ENDPOINT}/refreshToken"))
            .header("Content-Type", "application/json")
            .body(
                serde_json::to_vec(&json!({"refreshToken": refresh_token}))
                    .map_err(|err| AuthError::fatal(format!("encode refresh request: {err}")))?,
            )
            .send()
            .await
            .map_err(|err| AuthError::transient(format!("refresh request: {err}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| AuthError::transient(format!("read refresh response: {err}")))?;
        if status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AuthError::expired(format!("token refresh failed ({status})")));
        }
        if !status.is_success() {
            return Err(AuthError::transient(format!(
                "token refresh failed ({status})"
            )));
        }
        let tokens: SocialTokenResponse = serde_json::from_slice(&bytes)
            .map_err(|err| AuthError::fatal(format!("parse refresh response: {err}")))?;

        let expires_in = if tokens.expires_in > 0 {
            tokens.expires_in
        } else {
            3600
        };
        let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(expires_in as u64);

        let mut refreshed = record.clone();
        refreshed.storage["access_token"] = json!(tokens.access_token);
        if !tokens.refresh_token.is_empty() {
            refreshed.storage["refresh_token"] = json!(tokens.refresh_token);
        }
        if !tokens.profile_arn.is_empty() {
            refreshed.storage["profile_arn"] = json!(tokens.profile_arn);
            refreshed
                .metadata
                .insert("profile_arn".into(), json!(tokens.profile_arn));
        }
        refreshed
            .metadata
            .insert("expires_at".into(), json!(expires_at.unix_timestamp()));
        debug!(id = %record.id, "kiro token refreshed");
        Ok(refreshed)
    }
}

/// Build a record from a Kiro IDE token cache file without running a flow.
pub fn import_token_file(path: &Path, options: &LoginOptions) -> Result<AuthRecord, AuthError> {
    let raw = std::fs::read(path)
        .map_err(|err| AuthError::fatal(format!("read {}: {err}", path.display())))?;
    let token: IdeTokenFile = serde_json::from_slice(&raw)
        .map_err(|err| AuthError::fatal(format!("parse {}: {err}", path.display())))?;

    if token.access_token.trim().is_empty() || token.refresh_token.trim().is_empty() {
        return Err(AuthError::fatal(format!(
            "{} is missing accessToken/refreshToken",
            path.display()
        )));
    }

    let email = email_from_jwt(&token.access_token);
    let label = options
        .label
        .clone()
        .or_else(|| email.clone())
        .unwrap_or_else(|| "imported".to_string());

    let mut record = AuthRecord::new(
        format!("{PROVIDER_NAME}-{}.json", sanitize_label(&label)),
        PROVIDER_NAME,
    );
    record.label = label;
    record.storage = json!({
        "access_token": token.access_token,
        "refresh_token": token.refresh_token,
        "profile_arn": token.profile_arn,
    });
    let auth_method = if token.auth_method.is_empty() {
        "social".to_string()
    } else {
        token.auth_method
    };
    record
        .metadata
        .insert("auth_method".into(), json!(auth_method));
    record.metadata.insert("imported".into(), json!(true));
    if !token.provider.is_empty() {
        record.metadata.insert("idp".into(), json!(token.provider));
    }
    if !token.profile_arn.is_empty() {
        record
            .metadata
            .insert("profile_arn".into(), json!(token.profile_arn));
    }
    if let Some(email) = email {
        record.metadata.insert("email".into(), json!(email));
    }
    if !token.expires_at.is_empty()
        && let Ok(expires_at) = OffsetDateTime::parse(
            &token.expires_at,
            &time::format_description::well_known::Rfc3339,
        )
    {
        record
            .metadata
            .insert("expires_at".into(), json!(expires_at.unix_timestamp()));
    }
    Ok(record)
}

/// Candidate IDE token files: the native cache plus, under WSL, the
/// Windows-side caches of every user profile.
pub fn ide_token_candidates(home: &Path) -> Vec<PathBuf> {
    let mut out = vec![
        home.join(".aws")
            .join("sso")
            .join("cache")
            .join(IDE_TOKEN_FILE),
    ];
    out.extend(wsl_token_files(Path::new("/mnt/c/Users")));
    out
}

fn wsl_token_files(users_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(users_root) else {
        return Vec::new();
    };
    let mut matches = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let candidate = entry
            .path()
            .join(".aws")
            .join("sso")
            .join("cache")
            .join(IDE_TOKEN_FILE);
        if candidate.is_file() {
            matches.push(candidate);
        }
    }
    matches.sort();
    matches
}

/// Body-level ban signal: CodeWhisperer responses carry a `reason` field
/// when an account is suspended. The executor maps this onto the Banned
/// outcome, which invalidates the record permanently.
pub fn ban_reason(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let reason = value.get("reason")?.as_str()?.trim();
    if reason.is_empty() {
        return None;
    }
    Some(reason.to_string())
}

/// Probe CodeWhisperer `/getUsageLimits` for the record's quota snapshot.
pub async fn probe_kiro_usage(
    client: &wreq::Client,
    record: &AuthRecord,
) -> Result<KiroUsageSnapshot, AuthError> {
    let access_token = record
        .storage
        .get("access_token")
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::fatal("record has no access token"))?;

    let base = record
        .attributes
        .get("usage_base_url")
        .map(String::as_str)
        .or_else(|| record.base_url())
        .unwrap_or(DEFAULT_USAGE_BASE_URL);
    let base = base.trim_end_matches('/');

    let mut query = vec![
        ("isEmailRequired".to_string(), "true".to_string()),
        ("origin".to_string(), "AI_EDITOR".to_string()),
    ];
    let auth_method = record.metadata_str("auth_method").unwrap_or_default();
    if auth_method == "social" {
        let profile_arn = record
            .metadata_str("profile_arn")
            .or_else(|| record.storage.get("profile_arn").and_then(|v| v.as_str()))
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::fatal("social auth record has no profile arn"))?;
        query.push(("profileArn".to_string(), profile_arn.to_string()));
    } else {
        let resource_type = record
            .attributes
            .get("agent_task_type")
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("AGENTIC_REQUEST");
        query.push(("resourceType".to_string(), resource_type.to_string()));
    }

    let query = query
        .into_iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
        .collect::<Vec<_>>()
        .join("&");
    let url = format!("{base}/getUsageLimits?{query}");

    let response = client
        .get(&url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("kiro usage probe: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read usage response: {err}")))?;
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(AuthError::denied(format!("kiro usage probe: {status}")));
    }
    if !status.is_success() {
        return Err(AuthError::transient(format!("kiro usage probe: {status}")));
    }

    parse_kiro_usage_snapshot(&bytes)
        .ok_or_else(|| AuthError::fatal("usage response carried no recognized fields"))
}

fn build_login_url(idp: &str, redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    format!(
        "{AUTH_SERVICE_ENDPOINT}/login?idp={idp}&redirect_uri={}&code_challenge={code_challenge}&code_challenge_method=S256&state={state}&prompt=select_account",
        urlencoding::encode(redirect_uri),
    )
}

async fn create_token(
    client: &wreq::Client,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
) -> Result<SocialTokenResponse, AuthError> {
    let body = serde_json::to_vec(&json!({
        "code": code,
        "code_verifier": code_verifier,
        "redirect_uri": redirect_uri,
    }))
    .map_err(|err| AuthError::fatal(format!("encode token request: {err}")))?;

    let response = client
        .post(format!("{AUTH_SERVICE_ENDPOINT}/oauth/token"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("token request: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read token response: {err}")))?;
    if !status.is_success() {
        debug!(status = %status, "kiro token exchange failed");
        return Err(AuthError::fatal(format!("token exchange failed ({status})")));
    }

    let tokens: SocialTokenResponse = serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse token response: {err}")))?;
    if tokens.access_token.is_empty() {
        return Err(AuthError::fatal("token response missing accessToken"));
    }
    Ok(tokens)
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

    #[test]
    fn login_url_carries_pkce_and_prompt() {
        let url = build_login_url(
            "Google",
            "http://127.0.0.1:11123/oauth/callback",
            "ch",
            "st",
        );
        assert!(url.starts_with(AUTH_SERVICE_ENDPOINT));
        assert!(url.contains("idp=Google"));
        assert!(url.contains("code_challenge=ch"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=st"));
        assert!(url.contains("prompt=select_account"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A11123%2Foauth%2Fcallback"));
    }

    #[test]
    fn import_requires_both_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDE_TOKEN_FILE);

        std::fs::write(&path, br#"{"accessToken":"at"}"#).unwrap();
        assert!(import_token_file(&path, &LoginOptions::default()).is_err());

        std::fs::write(
            &path,
            br#"{"accessToken":"at","refreshToken":"rt","profileArn":"arn:aws:x","expiresAt":"2026-09-01T00:00:00Z","authMethod":"social","provider":"Google"}"#,
        )
        .unwrap();
        let record = import_token_file(&path, &LoginOptions::default()).unwrap();
        assert_eq!(record.provider, PROVIDER_NAME);
        assert_eq!(record.storage["access_token"], "at");
        assert_eq!(record.storage["refresh_token"], "rt");
        assert_eq!(record.metadata["auth_method"], "social");
        assert_eq!(record.metadata["imported"], true);
        assert!(record.metadata_i64("expires_at").is_some());
    }

    #[test]
    fn import_label_prefers_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDE_TOKEN_FILE);
        std::fs::write(&path, br#"{"accessToken":"at","refreshToken":"rt"}"#).unwrap();
        let record = import_token_file(
            &path,
            &LoginOptions {
                label: Some("work-account".into()),
                ..LoginOptions::default()
            },
        )
        .unwrap();
        assert_eq!(record.id, "kiro-work-account.json");
        assert_eq!(record.label, "work-account");
    }

    #[test]
    fn wsl_discovery_finds_per_user_caches() {
        let dir = tempfile::tempdir().unwrap();
        let users = dir.path();
        let cache = users.join("alice").join(".aws").join("sso").join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(IDE_TOKEN_FILE), b"{}").unwrap();
        std::fs::create_dir_all(users.join("bob")).unwrap();

        let found = wsl_token_files(users);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("alice/.aws/sso/cache/kiro-auth-token.json"));
    }

    #[test]
    fn ban_reason_reads_body_field() {
        assert_eq!(
            ban_reason(br#"{"reason":"ACCOUNT_SUSPENDED"}"#).as_deref(),
            Some("ACCOUNT_SUSPENDED")
        );
        assert!(ban_reason(br#"{"reason":""}"#).is_none());
        assert!(ban_reason(br#"{"message":"ok"}"#).is_none());
        assert!(ban_reason(b"not json").is_none());
    }
}
