use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// CodeWhisperer (Kiro IDE) usage limits returned by `/getUsageLimits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KiroUsageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_until_reset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_date_reset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<KiroSubscriptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<KiroUserInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakdowns: Vec<KiroUsageBreakdown>,
    #[serde(
        default = "OffsetDateTime::now_utc",
        with = "time::serde::rfc3339"
    )]
    pub updated_at: OffsetDateTime,
}

impl Default for KiroUsageSnapshot {
    fn default() -> Self {
        Self {
            days_until_reset: None,
            next_date_reset: None,
            subscription: None,
            user_info: None,
            breakdowns: Vec::new(),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KiroUserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KiroSubscriptionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KiroUsageBreakdown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<i64>,
}

/// Parse a `/getUsageLimits` response body. Returns `None` when the body
/// carries none of the recognized fields.
pub fn parse_kiro_usage_snapshot(body: &[u8]) -> Option<KiroUsageSnapshot> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    let mut snapshot = KiroUsageSnapshot {
        updated_at: OffsetDateTime::now_utc(),
        ..KiroUsageSnapshot::default()
    };
    let mut has_data = false;

    if let Some(days) = value.get("daysUntilReset").and_then(|v| v.as_i64()) {
        snapshot.days_until_reset = Some(days);
        has_data = true;
    }
    if let Some(next) = value.get("nextDateReset").and_then(|v| v.as_f64()) {
        snapshot.next_date_reset = Some(next);
        has_data = true;
    }
    if let Some(info) = value.get("userInfo").and_then(|v| v.as_object()) {
        let email = info.get("email").and_then(|v| v.as_str()).map(String::from);
        let user_id = info.get("userId").and_then(|v| v.as_str()).map(String::from);
        if email.is_some() || user_id.is_some() {
            snapshot.user_info = Some(KiroUserInfo { email, user_id });
            has_data = true;
        }
    }
    if let Some(info) = value.get("subscriptionInfo").and_then(|v| v.as_object()) {
        let title = info
            .get("subscriptionTitle")
            .and_then(|v| v.as_str())
            .map(String::from);
        let kind = info.get("type").and_then(|v| v.as_str()).map(String::from);
        if title.is_some() || kind.is_some() {
            snapshot.subscription = Some(KiroSubscriptionInfo { title, kind });
            has_data = true;
        }
    }
    if let Some(rows) = value.get("usageBreakdownList").and_then(|v| v.as_array()) {
        for row in rows {
            let breakdown = KiroUsageBreakdown {
                resource_type: row
                    .get("resourceType")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                unit: row.get("unit").and_then(|v| v.as_str()).map(String::from),
                usage_limit: row.get("usageLimit").and_then(|v| v.as_i64()),
                current_usage: row.get("currentUsage").and_then(|v| v.as_i64()),
            };
            if breakdown != KiroUsageBreakdown::default() {
                snapshot.breakdowns.push(breakdown);
                has_data = true;
            }
        }
    }

    if !has_data {
        return None;
    }
    Some(snapshot)
}
