use std::time::Duration;

use credgate_auth::AuthError;
use serde::Deserialize;

/// Floor for the polling interval regardless of what the server suggests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Absolute cap on how long a device-code flow may poll.
pub const MAX_POLL_DURATION: Duration = Duration::from_secs(900);

/// Device authorization response, as returned by the device-code endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub interval: u64,
}

impl DeviceCodeResponse {
    /// Polling deadline: `min(expires_in, 15 min)` from now.
    pub fn poll_deadline(&self) -> tokio::time::Instant {
        let mut window = MAX_POLL_DURATION;
        if self.expires_in > 0 {
            window = window.min(Duration::from_secs(self.expires_in));
        }
        tokio::time::Instant::now() + window
    }
}

/// Effective polling interval: `max(server interval, 5 s)`.
pub fn poll_interval(interval_secs: u64) -> Duration {
    Duration::from_secs(interval_secs).max(DEFAULT_POLL_INTERVAL)
}

/// Map an OAuth error code from a token-poll response onto the shared
/// classification. Pending and slow-down keep the poll loop alive; the rest
/// terminate it.
pub fn classify_oauth_error(error: &str, description: Option<&str>) -> AuthError {
    match error {
        "authorization_pending" => AuthError::pending(),
        "slow_down" => AuthError::slow_down(),
        "expired_token" => AuthError::expired("device code expired"),
        "access_denied" => AuthError::denied("user denied the authorization request"),
        other => AuthError::fatal(format!(
            "oauth error {other}: {}",
            description.unwrap_or("no description")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credgate_auth::AuthErrorKind;

    #[test]
    fn interval_is_floored_at_five_seconds() {
        assert_eq!(poll_interval(0), Duration::from_secs(5));
        assert_eq!(poll_interval(3), Duration::from_secs(5));
        assert_eq!(poll_interval(10), Duration::from_secs(10));
    }

    #[test]
    fn oauth_errors_classify() {
        assert_eq!(
            classify_oauth_error("authorization_pending", None).kind,
            AuthErrorKind::AuthorizationPending
        );
        assert_eq!(
            classify_oauth_error("slow_down", None).kind,
            AuthErrorKind::SlowDown
        );
        assert_eq!(
            classify_oauth_error("expired_token", None).kind,
            AuthErrorKind::Expired
        );
        assert_eq!(
            classify_oauth_error("access_denied", None).kind,
            AuthErrorKind::Denied
        );
        assert_eq!(
            classify_oauth_error("server_error", Some("boom")).kind,
            AuthErrorKind::Fatal
        );
    }

    #[test]
    fn deadline_respects_short_expiry() {
        let device = DeviceCodeResponse {
            device_code: "d".into(),
            user_code: "u".into(),
            verification_uri: "https://example.com/device".into(),
            expires_in: 60,
            interval: 5,
        };
        let deadline = device.poll_deadline();
        let now = tokio::time::Instant::now();
        assert!(deadline <= now + Duration::from_secs(61));
        assert!(deadline >= now + Duration::from_secs(55));
    }
}
