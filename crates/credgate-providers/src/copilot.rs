use std::time::Duration;

use async_trait::async_trait;
use credgate_auth::record::AuthRecord;
use credgate_auth::{AuthError, Authenticator, LoginOptions};
use credgate_common::GlobalConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::http::build_client;
use crate::oauth::device::{DeviceCodeResponse, classify_oauth_error, poll_interval};

pub const PROVIDER_NAME: &str = "github-copilot";
const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_INFO_URL: &str = "https://api.github.com/user";
const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const USER_AGENT: &str = "credgate/0.4";

#[derive(Debug, Deserialize)]
struct OAuthPollResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CopilotApiToken {
    token: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// GitHub Copilot accounts via the OAuth device-code flow.
///
/// The stored GitHub OAuth token does not expire, so no refresh is
/// scheduled; a forced refresh exchanges it for a fresh Copilot API bearer
/// token instead.
#[derive(Debug, Default)]
pub struct CopilotAuthenticator;

impl CopilotAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for CopilotAuthenticator {
    fn provider(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn refresh_lead(&self) -> Option<Duration> {
        None
    }

    async fn login(
        &self,
        config: &GlobalConfig,
        options: &LoginOptions,
    ) -> Result<AuthRecord, AuthError> {
        let client = build_client(config.proxy.as_deref())?;

        let device = request_device_code(&client).await?;
        println!("\n  Open {}", device.verification_uri);
        println!("  and enter code: {}\n", device.user_code);

        let token = poll_for_token(&client, &device).await?;

        let login = fetch_user_login(&client, &token.0).await.unwrap_or_default();
        let label = options
            .label
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                if login.is_empty() {
                    "copilot".to_string()
                } else {
                    login.clone()
                }
            });

        let mut record = AuthRecord::new(format!("{PROVIDER_NAME}-{label}.json"), PROVIDER_NAME);
        record.label = label;
        record.storage = json!({
            "access_token": token.0,
            "token_type": token.1,
            "scope": token.2,
        });
        if !login.is_empty() {
            record.metadata.insert("login".into(), json!(login));
        }

        // Best-effort: prime the Copilot API bearer token right away.
        match exchange_copilot_token(&client, &token.0).await {
            Ok(api_token) => apply_api_token(&mut record, api_token),
            Err(err) => warn!(error = %err, "copilot api token exchange deferred"),
        }
        Ok(record)
    }

    async fn refresh(&self, record: &AuthRecord) -> Result<AuthRecord, AuthError> {
        let github_token = record
            .storage
            .get("access_token")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::fatal("record has no github token"))?;

        let client = build_client(None)?;
        let api_token = exchange_copilot_token(&client, github_token).await?;

        let mut refreshed = record.clone();
        apply_api_token(&mut refreshed, api_token);
        debug!(id = %record.id, "copilot api token refreshed");
        Ok(refreshed)
    }
}

fn apply_api_token(record: &mut AuthRecord, api_token: CopilotApiToken) {
    record.storage["api_token"] = json!(api_token.token);
    if let Some(expires_at) = api_token.expires_at {
        record
            .metadata
            .insert("api_token_expires_at".into(), json!(expires_at));
    }
}

async fn request_device_code(client: &wreq::Client) -> Result<DeviceCodeResponse, AuthError> {
    let response = client
        .post(DEVICE_CODE_URL)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .body(format!(
            "client_id={}&scope=user%3Aemail",
            urlencoding::encode(CLIENT_ID)
        ))
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("device code request: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read device code response: {err}")))?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(AuthError::transient(format!(
            "device code request {status}: {text}"
        )));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse device code response: {err}")))
}

/// Poll the token endpoint until the user authorizes or the device code
/// expires. `slow_down` stretches the interval by 5 s each time.
async fn poll_for_token(
    client: &wreq::Client,
    device: &DeviceCodeResponse,
) -> Result<(String, String, String), AuthError> {
    let mut interval = poll_interval(device.interval);
    let deadline = device.poll_deadline();

    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(AuthError::expired("device authorization timed out"));
        }

        match exchange_device_code(client, &device.device_code).await {
            Ok(token) => return Ok(token),
            Err(err) => match err.kind {
                credgate_auth::AuthErrorKind::AuthorizationPending => continue,
                credgate_auth::AuthErrorKind::SlowDown => {
                    interval += Duration::from_secs(5);
                    continue;
                }
                _ => return Err(err),
            },
        }
    }
}

async fn exchange_device_code(
    client: &wreq::Client,
    device_code: &str,
) -> Result<(String, String, String), AuthError> {
    let body = format!(
        "client_id={}&device_code={}&grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(device_code),
    );
    let response = client
        .post(TOKEN_URL)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("token exchange: {err}")))?;

    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read token response: {err}")))?;

    // GitHub returns 200 for both success and error cases in the device flow.
    let parsed: OAuthPollResponse = serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse token response: {err}")))?;

    if let Some(error) = parsed.error {
        return Err(classify_oauth_error(
            &error,
            parsed.error_description.as_deref(),
        ));
    }
    let access_token = parsed
        .access_token
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::fatal("empty access token"))?;
    Ok((
        access_token,
        parsed.token_type.unwrap_or_default(),
        parsed.scope.unwrap_or_default(),
    ))
}

async fn fetch_user_login(client: &wreq::Client, access_token: &str) -> Result<String, AuthError> {
    #[derive(Debug, Deserialize)]
    struct UserInfo {
        #[serde(default)]
        login: String,
    }

    let response = client
        .get(USER_INFO_URL)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Accept", "application/json")
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("user info: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read user info: {err}")))?;
    if !status.is_success() {
        return Err(AuthError::transient(format!("user info {status}")));
    }
    let info: UserInfo = serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse user info: {err}")))?;
    if info.login.is_empty() {
        return Err(AuthError::fatal("empty github login"));
    }
    Ok(info.login)
}

async fn exchange_copilot_token(
    client: &wreq::Client,
    github_token: &str,
) -> Result<CopilotApiToken, AuthError> {
    let response = client
        .get(COPILOT_TOKEN_URL)
        .header("Authorization", format!("token {github_token}"))
        .header("Accept", "application/json")
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("copilot token exchange: {err}")))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read copilot token: {err}")))?;
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(AuthError::denied(format!("copilot token exchange {status}")));
    }
    if !status.is_success() {
        return Err(AuthError::transient(format!(
            "copilot token exchange {status}"
        )));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::fatal(format!("parse copilot token: {err}")))
}
