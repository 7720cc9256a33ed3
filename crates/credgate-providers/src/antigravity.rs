use credgate_auth::AuthError;
use credgate_auth::record::AuthRecord;
use credgate_usage::{AntigravityQuotaSnapshot, parse_antigravity_quota_snapshot};
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "antigravity";
const DEFAULT_BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const USER_AGENT: &str = "antigravity/1.0";

/// Probe the Antigravity models endpoint for per-model quota info. A 403 is
/// a meaningful observation (the account lost access) and is reported as a
/// forbidden snapshot rather than an error.
pub async fn probe_antigravity_quota(
    client: &wreq::Client,
    record: &AuthRecord,
) -> Result<AntigravityQuotaSnapshot, AuthError> {
    let access_token = record
        .storage
        .get("access_token")
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::fatal("record has no access token"))?;

    let base = record.base_url().unwrap_or(DEFAULT_BASE_URL);
    let url = format!(
        "{}/v1internal:fetchAvailableModels",
        base.trim_end_matches('/')
    );

    let response = client
        .post(&url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .header("User-Agent", USER_AGENT)
        .header("requestid", Uuid::new_v4().to_string())
        .body(b"{}".to_vec())
        .send()
        .await
        .map_err(|err| AuthError::transient(format!("antigravity probe: {err}")))?;

    let status = response.status();
    if status.as_u16() == 403 {
        return Ok(AntigravityQuotaSnapshot::forbidden());
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| AuthError::transient(format!("read models response: {err}")))?;
    if !status.is_success() {
        return Err(AuthError::transient(format!("antigravity probe: {status}")));
    }

    parse_antigravity_quota_snapshot(&bytes)
        .ok_or_else(|| AuthError::fatal("models response carried no quota info"))
}
