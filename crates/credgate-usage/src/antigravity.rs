use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AntigravityModelQuota {
    pub name: String,
    /// 0-100, rounded from the upstream `remainingFraction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reset_time: String,
}

/// Antigravity quota information returned by `fetchAvailableModels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntigravityQuotaSnapshot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<AntigravityModelQuota>,
    #[serde(default)]
    pub forbidden: bool,
    #[serde(
        default = "OffsetDateTime::now_utc",
        with = "time::serde::rfc3339"
    )]
    pub updated_at: OffsetDateTime,
}

impl Default for AntigravityQuotaSnapshot {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            forbidden: false,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

impl AntigravityQuotaSnapshot {
    /// Snapshot representing a 403 from the probe endpoint.
    pub fn forbidden() -> Self {
        Self {
            forbidden: true,
            updated_at: OffsetDateTime::now_utc(),
            ..Self::default()
        }
    }
}

/// Parse a `fetchAvailableModels` response body. Only gemini/claude models
/// with a `quotaInfo` object contribute; returns `None` when nothing does.
pub fn parse_antigravity_quota_snapshot(body: &[u8]) -> Option<AntigravityQuotaSnapshot> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let models = value.get("models")?.as_object()?;

    let mut out = AntigravityQuotaSnapshot {
        updated_at: OffsetDateTime::now_utc(),
        ..AntigravityQuotaSnapshot::default()
    };

    for (model_name, model_info) in models {
        let lower = model_name.to_ascii_lowercase();
        if !lower.contains("gemini") && !lower.contains("claude") {
            continue;
        }
        let Some(quota) = model_info.get("quotaInfo").and_then(|v| v.as_object()) else {
            continue;
        };

        let remaining_percent = quota
            .get("remainingFraction")
            .and_then(|v| v.as_f64())
            .map(|fraction| ((fraction * 100.0).round() as i64).clamp(0, 100));
        let reset_time = quota
            .get("resetTime")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        if remaining_percent.is_none() && reset_time.is_empty() {
            continue;
        }

        out.models.push(AntigravityModelQuota {
            name: model_name.clone(),
            remaining_percent,
            reset_time,
        });
    }

    if out.models.is_empty() {
        return None;
    }
    out.models
        .sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    Some(out)
}
