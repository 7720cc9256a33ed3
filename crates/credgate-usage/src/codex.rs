use credgate_auth::{Headers, header_get};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Codex team quota information emitted via `x-codex-*` response headers.
/// Best-effort observability; never persisted and never used for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodexQuotaSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_used_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_reset_after_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_window_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_used_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_reset_after_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_window_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_over_secondary_percent: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_reset_at_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_reset_at_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_has_credits: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_balance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_unlimited: Option<bool>,

    #[serde(
        default = "OffsetDateTime::now_utc",
        with = "time::serde::rfc3339"
    )]
    pub updated_at: OffsetDateTime,
}

impl Default for CodexQuotaSnapshot {
    fn default() -> Self {
        Self {
            plan_type: String::new(),
            primary_used_percent: None,
            primary_reset_after_seconds: None,
            primary_window_minutes: None,
            secondary_used_percent: None,
            secondary_reset_after_seconds: None,
            secondary_window_minutes: None,
            primary_over_secondary_percent: None,
            primary_reset_at_seconds: None,
            secondary_reset_at_seconds: None,
            credits_has_credits: None,
            credits_balance: None,
            credits_unlimited: None,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

/// Parse Codex quota headers into a snapshot. Returns `None` when no
/// relevant header is present.
pub fn parse_codex_quota_snapshot(headers: &Headers) -> Option<CodexQuotaSnapshot> {
    let mut snapshot = CodexQuotaSnapshot {
        updated_at: OffsetDateTime::now_utc(),
        ..CodexQuotaSnapshot::default()
    };
    let mut has_data = false;

    let float = |key: &str| -> Option<f64> {
        header_get(headers, key)?.trim().parse::<f64>().ok()
    };
    let int = |key: &str| -> Option<i64> {
        header_get(headers, key)?.trim().parse::<i64>().ok()
    };
    let boolean = |key: &str| -> Option<bool> {
        match header_get(headers, key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    };
    let string = |key: &str| -> Option<String> {
        let value = header_get(headers, key)?;
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    };

    if let Some(value) = header_get(headers, "x-codex-plan-type") {
        let value = value.trim();
        if !value.is_empty() {
            snapshot.plan_type = value.to_string();
            has_data = true;
        }
    }

    if let Some(value) = float("x-codex-primary-used-percent") {
        snapshot.primary_used_percent = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-primary-reset-after-seconds") {
        snapshot.primary_reset_after_seconds = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-primary-window-minutes") {
        snapshot.primary_window_minutes = Some(value);
        has_data = true;
    }
    if let Some(value) = float("x-codex-secondary-used-percent") {
        snapshot.secondary_used_percent = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-secondary-reset-after-seconds") {
        snapshot.secondary_reset_after_seconds = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-secondary-window-minutes") {
        snapshot.secondary_window_minutes = Some(value);
        has_data = true;
    }
    if let Some(value) = float("x-codex-primary-over-secondary-limit-percent") {
        snapshot.primary_over_secondary_percent = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-primary-reset-at") {
        snapshot.primary_reset_at_seconds = Some(value);
        has_data = true;
    }
    if let Some(value) = int("x-codex-secondary-reset-at") {
        snapshot.secondary_reset_at_seconds = Some(value);
        has_data = true;
    }
    if let Some(value) = boolean("x-codex-credits-has-credits") {
        snapshot.credits_has_credits = Some(value);
        has_data = true;
    }
    if let Some(value) = string("x-codex-credits-balance") {
        snapshot.credits_balance = Some(value);
        has_data = true;
    }
    if let Some(value) = boolean("x-codex-credits-unlimited") {
        snapshot.credits_unlimited = Some(value);
        has_data = true;
    }

    if !has_data {
        return None;
    }
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotRegistry;
    use credgate_auth::header_set;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut out = Headers::new();
        for (name, value) in pairs {
            header_set(&mut out, *name, *value);
        }
        out
    }

    #[test]
    fn parses_team_plan_headers() {
        let snapshot = parse_codex_quota_snapshot(&headers(&[
            ("x-codex-plan-type", "team"),
            ("x-codex-primary-used-percent", "12.5"),
            ("x-codex-credits-has-credits", "False"),
        ]))
        .unwrap();
        assert_eq!(snapshot.plan_type, "team");
        assert_eq!(snapshot.primary_used_percent, Some(12.5));
        assert_eq!(snapshot.credits_has_credits, Some(false));
        assert!(snapshot.secondary_used_percent.is_none());
    }

    #[test]
    fn no_relevant_headers_yields_none() {
        assert!(parse_codex_quota_snapshot(&headers(&[("content-type", "application/json")])).is_none());
        assert!(parse_codex_quota_snapshot(&Headers::new()).is_none());
    }

    #[test]
    fn malformed_numbers_are_skipped() {
        let snapshot = parse_codex_quota_snapshot(&headers(&[
            ("x-codex-primary-used-percent", "a-lot"),
            ("x-codex-primary-reset-after-seconds", "60"),
        ]))
        .unwrap();
        assert!(snapshot.primary_used_percent.is_none());
        assert_eq!(snapshot.primary_reset_after_seconds, Some(60));
    }

    #[test]
    fn store_and_reload_round_trips_by_auth_id() {
        let registry: SnapshotRegistry<CodexQuotaSnapshot> = SnapshotRegistry::new();
        let snapshot = parse_codex_quota_snapshot(&headers(&[
            ("x-codex-plan-type", "team"),
            ("x-codex-primary-used-percent", "12.5"),
            ("x-codex-credits-has-credits", "False"),
        ]))
        .unwrap();
        registry.update("auth-1", snapshot.clone());

        let reloaded = registry.get("auth-1").unwrap();
        assert_eq!(reloaded, snapshot);
        assert!(registry.get("auth-2").is_none());
    }
}
