use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use credgate_common::GlobalConfig;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::authenticator::{AuthenticatorRegistry, LoginOptions};
use crate::error::{ManagerError, PickError};
use crate::outcome::CallOutcome;
use crate::record::{AuthRecord, AuthStatus, backoff_delay};
use crate::selector::{SessionBindingStatus, StickyConfig, StickySelector};
use crate::session::RequestContext;
use crate::store::TokenStore;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub sticky: StickyConfig,
    pub backoff_cap_level: u8,
    pub refresh_default_lead: Duration,
    /// Consecutive transient refresh failures before a record goes Invalid.
    pub refresh_failure_threshold: u32,
    /// Consecutive transient call failures within the window that cool a
    /// (record, model) pair off.
    pub transient_failure_threshold: u32,
    pub transient_failure_window: Duration,
    pub transient_retry_cooldown: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sticky: StickyConfig::default(),
            backoff_cap_level: 5,
            refresh_default_lead: Duration::from_secs(300),
            refresh_failure_threshold: 5,
            transient_failure_threshold: 3,
            transient_failure_window: Duration::from_secs(60),
            transient_retry_cooldown: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            sticky: StickyConfig {
                session_ttl: config.sticky_session_ttl(),
                gc_interval: config.sticky_gc_interval(),
                gc_min_entries: config.sticky_gc_min_entries,
            },
            backoff_cap_level: config.backoff_cap_level,
            refresh_default_lead: config.refresh_default_lead(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TransientWindow {
    count: u32,
    started_at: OffsetDateTime,
}

/// Owner of every credential record and of the sticky selector.
///
/// The record index lock is only ever held for in-memory reads and writes;
/// refresh copies the record out, performs network IO, then re-acquires the
/// lock to apply the result. Mutations persist to the token store before the
/// in-memory commit, so a failed write leaves memory untouched.
pub struct Manager {
    store: TokenStore,
    registry: AuthenticatorRegistry,
    config: ManagerConfig,
    records: RwLock<HashMap<String, AuthRecord>>,
    selector: StickySelector,
    transient: Mutex<HashMap<(String, String), TransientWindow>>,
}

impl Manager {
    pub fn new(store: TokenStore, registry: AuthenticatorRegistry, config: ManagerConfig) -> Self {
        let selector = StickySelector::new(config.sticky.clone());
        Self {
            store,
            registry,
            config,
            records: RwLock::new(HashMap::new()),
            selector,
            transient: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn registry(&self) -> &AuthenticatorRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &StickySelector {
        &self.selector
    }

    /// Load every persisted record from the auth directory. Undecodable
    /// files are skipped with a warning; they are never deleted.
    pub async fn load(&self) -> Result<usize, ManagerError> {
        let now = OffsetDateTime::now_utc();
        let ids = self.store.list().await?;
        let mut loaded = 0usize;
        for id in ids {
            let Some(blob) = self.store.read(&id).await? else {
                continue;
            };
            let mut record: AuthRecord = match serde_json::from_slice(&blob) {
                Ok(record) => record,
                Err(err) => {
                    warn!(id = %id, error = %err, "skipping undecodable auth file");
                    continue;
                }
            };
            record.id = id;
            if record.disabled {
                record.status = AuthStatus::Disabled;
            } else if record.status == AuthStatus::Disabled {
                record.status = AuthStatus::Active;
            }
            self.init_refresh_schedule(&mut record, now);

            let mut records = self.records.write().await;
            if !records.contains_key(&record.id) {
                records.insert(record.id.clone(), record);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Register a record, keyed by id. Registration is idempotent: an
    /// existing record is returned unchanged.
    pub async fn register(&self, mut record: AuthRecord) -> Result<AuthRecord, ManagerError> {
        {
            let records = self.records.read().await;
            if let Some(existing) = records.get(&record.id) {
                return Ok(existing.clone());
            }
        }

        let now = OffsetDateTime::now_utc();
        if record.disabled {
            record.status = AuthStatus::Disabled;
        }
        self.init_refresh_schedule(&mut record, now);
        self.persist(&record).await?;

        let mut records = self.records.write().await;
        let entry = records.entry(record.id.clone()).or_insert(record);
        Ok(entry.clone())
    }

    /// Run a provider login flow and register the resulting record.
    pub async fn login(
        &self,
        config: &GlobalConfig,
        provider: &str,
        options: &LoginOptions,
    ) -> Result<AuthRecord, ManagerError> {
        let authenticator =
            self.registry
                .get(provider)
                .ok_or_else(|| ManagerError::UnknownProvider {
                    provider: provider.to_string(),
                })?;
        let record = authenticator.login(config, options).await?;
        self.register(record).await
    }

    /// Select a credential for `(provider, model)` given the request context.
    pub async fn pick(
        &self,
        provider: &str,
        model: &str,
        ctx: &RequestContext,
    ) -> Result<AuthRecord, PickError> {
        let candidates: Vec<AuthRecord> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|record| record.provider == provider)
                .cloned()
                .collect()
        };
        self.selector.pick(provider, model, ctx, &candidates)
    }

    /// Apply the outcome of an upstream call to the record's state machines.
    pub async fn observe_outcome(&self, id: &str, model: &str, outcome: CallOutcome) {
        let now = OffsetDateTime::now_utc();
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            debug!(id = %id, "outcome for unknown credential dropped");
            return;
        };

        match outcome {
            CallOutcome::Ok => {
                self.reset_transient(id, model);
            }
            CallOutcome::RateLimited { retry_after } => {
                let level = record
                    .quota
                    .backoff_level
                    .saturating_add(1)
                    .min(self.config.backoff_cap_level);
                record.quota.exceeded = true;
                record.quota.backoff_level = level;
                record.quota.reason = Some("rate_limited".to_string());
                // Retry-After wins over the computed backoff, verbatim.
                let delay = retry_after.unwrap_or_else(|| backoff_delay(level));
                record.quota.next_recover_at = Some(now + delay);
            }
            CallOutcome::QuotaExceeded { reason } => {
                let level = record
                    .quota
                    .backoff_level
                    .saturating_add(1)
                    .min(self.config.backoff_cap_level);
                record.quota.exceeded = true;
                record.quota.backoff_level = level;
                record.quota.reason = reason.or_else(|| Some("quota_exceeded".to_string()));
                record.quota.next_recover_at = Some(now + backoff_delay(level));
            }
            CallOutcome::TransientFailure { reason } => {
                if self.record_transient(id, model, now) {
                    debug!(id = %id, model = %model, reason = ?reason, "model cooled off after repeated transient failures");
                    let state = record.model_states.entry(model.to_string()).or_default();
                    state.unavailable = true;
                    state.next_retry_after = Some(now + self.config.transient_retry_cooldown);
                }
            }
            CallOutcome::AuthInvalid { reason } => {
                record.status = AuthStatus::Invalid;
                record.next_refresh_after = Some(now);
                if let Some(reason) = reason {
                    record
                        .metadata
                        .insert("last_error".to_string(), reason.into());
                }
            }
            CallOutcome::Banned { reason } => {
                record.status = AuthStatus::Invalid;
                record.next_refresh_after = None;
                record.metadata.insert("banned".to_string(), true.into());
                if let Some(reason) = reason {
                    record
                        .metadata
                        .insert("last_error".to_string(), reason.into());
                }
            }
        }
        record.touch(now);
    }

    pub async fn set_disabled(
        &self,
        id: &str,
        disabled: bool,
    ) -> Result<AuthRecord, ManagerError> {
        let now = OffsetDateTime::now_utc();
        let mut updated = self.get(id).await.ok_or_else(|| ManagerError::NotFound {
            id: id.to_string(),
        })?;
        updated.disabled = disabled;
        if disabled {
            updated.status = AuthStatus::Disabled;
        } else if updated.status == AuthStatus::Disabled {
            updated.status = AuthStatus::Active;
        }
        updated.touch(now);
        self.persist(&updated).await?;

        let mut records = self.records.write().await;
        records.insert(updated.id.clone(), updated.clone());
        drop(records);

        if disabled {
            self.selector.purge_auth(id);
        }
        Ok(updated)
    }

    pub async fn set_priority(&self, id: &str, priority: i32) -> Result<AuthRecord, ManagerError> {
        let now = OffsetDateTime::now_utc();
        let mut updated = self.get(id).await.ok_or_else(|| ManagerError::NotFound {
            id: id.to_string(),
        })?;
        updated
            .metadata
            .insert("priority".to_string(), priority.into());
        updated.touch(now);
        self.persist(&updated).await?;

        let mut records = self.records.write().await;
        records.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    /// Force an immediate refresh through the record's authenticator.
    pub async fn force_refresh(&self, id: &str) -> Result<AuthRecord, ManagerError> {
        let record = self.get(id).await.ok_or_else(|| ManagerError::NotFound {
            id: id.to_string(),
        })?;
        self.refresh_record(record).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        {
            let records = self.records.read().await;
            if !records.contains_key(id) {
                return Err(ManagerError::NotFound { id: id.to_string() });
            }
        }
        self.store.delete(id).await?;
        let mut records = self.records.write().await;
        records.remove(id);
        drop(records);
        self.selector.purge_auth(id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<AuthRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<AuthRecord> {
        let records = self.records.read().await;
        let mut out: Vec<AuthRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn session_bindings(&self) -> Vec<SessionBindingStatus> {
        self.selector.session_binding_statuses()
    }

    /// One refresh pass: every record whose schedule is due is refreshed.
    /// Called by the background worker each tick; errors are absorbed here
    /// (transient ones reschedule with backoff, terminal ones invalidate).
    pub async fn refresh_due(&self, now: OffsetDateTime) {
        let due: Vec<AuthRecord> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|record| {
                    !record.disabled
                        && record.status != AuthStatus::Disabled
                        && record.next_refresh_after.is_some_and(|at| at <= now)
                        && self
                            .registry
                            .get(&record.provider)
                            .is_some_and(|auth| auth.refresh_lead().is_some())
                })
                .cloned()
                .collect()
        };

        for record in due {
            let id = record.id.clone();
            if let Err(err) = self.refresh_record(record).await {
                warn!(id = %id, error = %err, "scheduled refresh failed");
            }
        }
    }

    /// One recovery pass: clear expired global quota cooldowns and drop
    /// per-model states whose gates have elapsed.
    pub async fn recover_due(&self, now: OffsetDateTime) {
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            if record.quota.exceeded
                && record.quota.next_recover_at.is_some_and(|at| at <= now)
            {
                record.quota.clear();
                record.touch(now);
            }
            let before = record.model_states.len();
            record.model_states.retain(|_, state| state.forbids(now));
            if record.model_states.len() != before {
                record.touch(now);
            }
        }
    }

    async fn refresh_record(&self, record: AuthRecord) -> Result<AuthRecord, ManagerError> {
        let authenticator = self.registry.get(&record.provider).ok_or_else(|| {
            ManagerError::UnknownProvider {
                provider: record.provider.clone(),
            }
        })?;

        let id = record.id.clone();
        match authenticator.refresh(&record).await {
            Ok(refreshed) => {
                let now = OffsetDateTime::now_utc();
                let merged = {
                    let records = self.records.read().await;
                    let current = records.get(&id).unwrap_or(&record);
                    let mut merged = current.clone();
                    // Refresh never mutates the id; everything the
                    // authenticator owns is replaced, runtime cooldown
                    // state is preserved.
                    merged.label = refreshed.label;
                    merged.metadata = refreshed.metadata;
                    merged.attributes = refreshed.attributes;
                    merged.storage = refreshed.storage;
                    merged.status = AuthStatus::Active;
                    merged.refresh_failures = 0;
                    merged.touch(now);
                    merged
                };
                let mut merged = merged;
                self.init_refresh_schedule(&mut merged, now);
                self.persist(&merged).await?;

                let mut records = self.records.write().await;
                records.insert(id, merged.clone());
                Ok(merged)
            }
            Err(err) => {
                let now = OffsetDateTime::now_utc();
                let mut records = self.records.write().await;
                if let Some(current) = records.get_mut(&id) {
                    if err.is_transient() {
                        current.refresh_failures = current.refresh_failures.saturating_add(1);
                        if current.refresh_failures >= self.config.refresh_failure_threshold {
                            current.status = AuthStatus::Invalid;
                            current.next_refresh_after = None;
                        } else {
                            let level = u8::try_from(current.refresh_failures)
                                .unwrap_or(u8::MAX)
                                .min(self.config.backoff_cap_level);
                            current.next_refresh_after = Some(now + backoff_delay(level));
                        }
                    } else {
                        current.status = AuthStatus::Invalid;
                        current.next_refresh_after = None;
                    }
                    current.touch(now);
                }
                Err(err.into())
            }
        }
    }

    fn init_refresh_schedule(&self, record: &mut AuthRecord, now: OffsetDateTime) {
        let lead = self
            .registry
            .get(&record.provider)
            .and_then(|auth| auth.refresh_lead());
        let Some(lead) = lead else {
            record.next_refresh_after = None;
            return;
        };

        record.next_refresh_after = match record
            .metadata_i64("expires_at")
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        {
            Some(expires_at) => {
                let due = expires_at - lead;
                Some(if due <= now { now } else { due })
            }
            // Unknown expiry: re-check in an hour rather than hot-looping.
            None => Some(now + Duration::from_secs(3600)),
        };
    }

    fn record_transient(&self, id: &str, model: &str, now: OffsetDateTime) -> bool {
        let key = (id.to_string(), model.to_string());
        let mut windows = self.transient.lock().expect("transient lock");
        let window = windows.entry(key.clone()).or_insert(TransientWindow {
            count: 0,
            started_at: now,
        });
        if now >= window.started_at + self.config.transient_failure_window {
            window.count = 0;
            window.started_at = now;
        }
        window.count += 1;
        if window.count >= self.config.transient_failure_threshold {
            windows.remove(&key);
            return true;
        }
        false
    }

    fn reset_transient(&self, id: &str, model: &str) {
        let mut windows = self.transient.lock().expect("transient lock");
        windows.remove(&(id.to_string(), model.to_string()));
    }

    async fn persist(&self, record: &AuthRecord) -> Result<(), ManagerError> {
        let blob = serde_json::to_vec_pretty(record).map_err(|source| ManagerError::Encode {
            id: record.id.clone(),
            source,
        })?;
        self.store.write(&record.id, &blob).await?;
        Ok(())
    }
}
