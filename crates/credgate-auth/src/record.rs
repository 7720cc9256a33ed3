use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

pub const DEFAULT_PRIORITY: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Active,
    Disabled,
    Invalid,
    Pending,
}

/// Global quota cooldown embedded in a record (and per model state).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    #[serde(default)]
    pub exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_recover_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub backoff_level: u8,
}

impl QuotaState {
    /// Whether this quota state blocks selection at `now`.
    ///
    /// An exceeded state without a recovery time does not gate: a record is
    /// only held back while `next_recover_at` lies in the future.
    pub fn forbids(&self, now: OffsetDateTime) -> bool {
        self.exceeded && self.next_recover_at.map_or(false, |at| at > now)
    }

    pub fn clear(&mut self) {
        self.exceeded = false;
        self.reason = None;
        self.next_recover_at = None;
        self.backoff_level = self.backoff_level.saturating_sub(1);
    }
}

/// Per-model availability. A record can be hot for model A while cooled off
/// for model B.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    #[serde(default)]
    pub unavailable: bool,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_retry_after: Option<OffsetDateTime>,
    #[serde(default)]
    pub quota: QuotaState,
}

impl ModelState {
    /// Selection is blocked until `min(next_retry_after, quota.next_recover_at)`.
    pub fn forbids(&self, now: OffsetDateTime) -> bool {
        if !self.unavailable && !self.quota.exceeded {
            return false;
        }
        let mut gate: Option<OffsetDateTime> = None;
        if self.unavailable
            && let Some(at) = self.next_retry_after
        {
            gate = Some(at);
        }
        if self.quota.exceeded
            && let Some(at) = self.quota.next_recover_at
        {
            gate = Some(match gate {
                Some(current) => current.min(at),
                None => at,
            });
        }
        match gate {
            Some(at) => at > now,
            // Unavailable with no deadline stays out until explicitly cleared.
            None => self.unavailable,
        }
    }
}

/// The unit of selection: one authenticated upstream account.
///
/// The persisted form is the serde serialization of this envelope; `storage`
/// is an opaque blob owned by the authenticator that produced the record.
/// Cooldown and scheduling state is runtime-only and never hits disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRecord {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_status")]
    pub status: AuthStatus,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub storage: JsonValue,
    #[serde(skip)]
    pub quota: QuotaState,
    #[serde(skip)]
    pub model_states: HashMap<String, ModelState>,
    #[serde(skip)]
    pub next_refresh_after: Option<OffsetDateTime>,
    #[serde(skip)]
    pub refresh_failures: u32,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

fn default_status() -> AuthStatus {
    AuthStatus::Active
}

impl AuthRecord {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            provider: provider.into(),
            label: String::new(),
            status: AuthStatus::Active,
            disabled: false,
            metadata: HashMap::new(),
            attributes: HashMap::new(),
            storage: JsonValue::Null,
            quota: QuotaState::default(),
            model_states: HashMap::new(),
            next_refresh_after: None,
            refresh_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record may serve `model` at `now`.
    pub fn is_selectable(&self, model: &str, now: OffsetDateTime) -> bool {
        if self.disabled || self.status != AuthStatus::Active {
            return false;
        }
        if self.quota.forbids(now) {
            return false;
        }
        match self.model_states.get(model) {
            Some(state) => !state.forbids(now),
            None => true,
        }
    }

    /// Routing priority: lower wins. Read from `metadata.priority` (int,
    /// float truncated, or numeric string), then `attributes.priority`,
    /// defaulting to 50.
    pub fn priority(&self) -> i32 {
        if let Some(value) = self.metadata.get("priority")
            && let Some(parsed) = priority_from_value(value)
        {
            return parsed;
        }
        if let Some(raw) = self.attributes.get("priority") {
            let raw = raw.trim();
            if !raw.is_empty()
                && let Ok(parsed) = raw.parse::<i32>()
            {
                return parsed;
            }
        }
        DEFAULT_PRIORITY
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        match self.metadata.get(key)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Upstream base URL override, when the operator set one.
    pub fn base_url(&self) -> Option<&str> {
        self.attributes
            .get("base_url")
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.updated_at = now;
    }
}

pub fn priority_from_value(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => {
            if let Some(v) = n.as_i64() {
                return i32::try_from(v).ok();
            }
            n.as_f64().map(|v| v as i32)
        }
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(parsed) = s.parse::<i32>() {
                return Some(parsed);
            }
            s.parse::<f64>().ok().map(|v| v as i32)
        }
        _ => None,
    }
}

/// Exponential cooldown schedule: 60s * 2^(level-1), level capped by the
/// caller (default cap 5, so 1..16 minutes).
pub fn backoff_delay(level: u8) -> Duration {
    let exponent = level.saturating_sub(1).min(4);
    Duration::from_secs(60) * 2u32.pow(u32::from(exponent))
}
