use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::PickError;
use crate::record::AuthRecord;
use crate::session::{RequestContext, extract_session_key};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_GC_MIN_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
pub struct StickyConfig {
    pub session_ttl: Duration,
    pub gc_interval: Duration,
    pub gc_min_entries: usize,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            gc_interval: DEFAULT_GC_INTERVAL,
            gc_min_entries: DEFAULT_GC_MIN_ENTRIES,
        }
    }
}

#[derive(Debug, Clone)]
struct StickyBinding {
    auth_id: String,
    expires_at: OffsetDateTime,
    last_used_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionBindingStatus {
    pub auth_id: String,
    pub session_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct SelectorState {
    bindings: HashMap<String, StickyBinding>,
    last_gc: Option<OffsetDateTime>,
    round_robin: HashMap<String, usize>,
}

/// Sticky-session routing over a candidate set.
///
/// A session key extracted from the request binds to one record id for the
/// TTL; bindings survive until the record becomes ineligible or the binding
/// expires. New sessions land on the minimum-priority, least-loaded record,
/// with rendezvous hashing as the deterministic tie-break. Requests with no
/// derivable session key fall back to round-robin.
///
/// The selector stores ids, never record handles; records stay owned by the
/// manager and failover is a pure id-set computation.
pub struct StickySelector {
    config: StickyConfig,
    state: Mutex<SelectorState>,
}

impl Default for StickySelector {
    fn default() -> Self {
        Self::new(StickyConfig::default())
    }
}

impl StickySelector {
    pub fn new(config: StickyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SelectorState::default()),
        }
    }

    /// Pick a record for `(provider, model)` at `now`.
    ///
    /// Fails with `auth_not_found` when no candidate is eligible; no binding
    /// is created in that case. Holds the selector lock only across the
    /// in-memory decision.
    pub fn pick(
        &self,
        provider: &str,
        model: &str,
        ctx: &RequestContext,
        candidates: &[AuthRecord],
    ) -> Result<AuthRecord, PickError> {
        let now = OffsetDateTime::now_utc();
        self.pick_at(provider, model, ctx, candidates, now)
    }

    pub fn pick_at(
        &self,
        provider: &str,
        model: &str,
        ctx: &RequestContext,
        candidates: &[AuthRecord],
        now: OffsetDateTime,
    ) -> Result<AuthRecord, PickError> {
        let available: Vec<&AuthRecord> = candidates
            .iter()
            .filter(|record| !record.id.is_empty() && record.is_selectable(model, now))
            .collect();
        if available.is_empty() {
            return Err(PickError::AuthNotFound {
                provider: provider.to_string(),
            });
        }

        let session_key = extract_session_key(ctx);

        let mut state = self.state.lock().expect("selector lock");

        if session_key.is_empty() {
            let counter = state.round_robin.entry(provider.to_string()).or_insert(0);
            let index = *counter % available.len();
            *counter = counter.wrapping_add(1);
            return Ok(available[index].clone());
        }

        let binding_key = format!("{provider}:{session_key}");

        if !state.bindings.is_empty()
            && (state.bindings.len() >= self.config.gc_min_entries
                || state.last_gc.is_none()
                || state
                    .last_gc
                    .is_some_and(|last| now >= last + self.config.gc_interval))
        {
            gc_locked(&mut state, now);
        }

        if let Some(existing) = state.bindings.get(&binding_key).cloned() {
            if !existing.auth_id.is_empty() && now < existing.expires_at {
                if let Some(bound) = available
                    .iter()
                    .find(|record| record.id == existing.auth_id)
                {
                    let chosen = (*bound).clone();
                    state.bindings.insert(
                        binding_key,
                        StickyBinding {
                            auth_id: chosen.id.clone(),
                            expires_at: now + self.config.session_ttl,
                            last_used_at: now,
                        },
                    );
                    return Ok(chosen);
                }
            }
            // Expired, empty, or bound to a record that is no longer
            // eligible: unbind and fall through to a fresh selection.
            state.bindings.remove(&binding_key);
        }

        let min_priority = available
            .iter()
            .map(|record| record.priority())
            .min()
            .unwrap_or(i32::MAX);
        let filtered: Vec<&AuthRecord> = available
            .iter()
            .copied()
            .filter(|record| record.priority() == min_priority)
            .collect();

        // New sessions prefer the least-loaded record (live bindings for this
        // provider), then rendezvous hashing as a deterministic tie-break.
        let provider_prefix = format!("{provider}:");
        let mut load_by_auth: HashMap<&str, usize> = HashMap::new();
        for (key, binding) in &state.bindings {
            if !key.starts_with(&provider_prefix) {
                continue;
            }
            if binding.auth_id.is_empty() || now >= binding.expires_at {
                continue;
            }
            *load_by_auth.entry(binding.auth_id.as_str()).or_insert(0) += 1;
        }

        let min_load = filtered
            .iter()
            .map(|record| load_by_auth.get(record.id.as_str()).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        let load_filtered: Vec<&AuthRecord> = filtered
            .iter()
            .copied()
            .filter(|record| {
                load_by_auth.get(record.id.as_str()).copied().unwrap_or(0) == min_load
            })
            .collect();

        let mut selected: Option<&AuthRecord> = None;
        let mut best_score = 0u64;
        for record in load_filtered {
            let score = rendezvous_score(&session_key, &record.id);
            let better = match selected {
                None => true,
                Some(current) => {
                    score > best_score || (score == best_score && record.id < current.id)
                }
            };
            if better {
                selected = Some(record);
                best_score = score;
            }
        }

        let Some(selected) = selected else {
            return Err(PickError::AuthNotFound {
                provider: provider.to_string(),
            });
        };
        let chosen = selected.clone();
        state.bindings.insert(
            binding_key,
            StickyBinding {
                auth_id: chosen.id.clone(),
                expires_at: now + self.config.session_ttl,
                last_used_at: now,
            },
        );
        Ok(chosen)
    }

    /// Per-record counts of unexpired bindings, with the most recent use.
    pub fn session_binding_statuses(&self) -> Vec<SessionBindingStatus> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().expect("selector lock");
        if state.bindings.is_empty() {
            return Vec::new();
        }
        if state.bindings.len() >= self.config.gc_min_entries
            || state.last_gc.is_none()
            || state
                .last_gc
                .is_some_and(|last| now >= last + self.config.gc_interval)
        {
            gc_locked(&mut state, now);
        }

        let mut stats: HashMap<&str, SessionBindingStatus> = HashMap::new();
        for binding in state.bindings.values() {
            if binding.auth_id.is_empty() || now >= binding.expires_at {
                continue;
            }
            let entry = stats
                .entry(binding.auth_id.as_str())
                .or_insert_with(|| SessionBindingStatus {
                    auth_id: binding.auth_id.clone(),
                    session_count: 0,
                    last_used_at: binding.last_used_at,
                });
            entry.session_count += 1;
            if binding.last_used_at > entry.last_used_at {
                entry.last_used_at = binding.last_used_at;
            }
        }

        let mut out: Vec<SessionBindingStatus> = stats.into_values().collect();
        out.sort_by(|a, b| a.auth_id.cmp(&b.auth_id));
        out
    }

    /// Number of unexpired bindings referencing `auth_id`.
    pub fn session_count(&self, auth_id: &str) -> usize {
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().expect("selector lock");
        state
            .bindings
            .values()
            .filter(|binding| binding.auth_id == auth_id && now < binding.expires_at)
            .count()
    }

    /// Drop every binding referencing `auth_id` (disable / delete paths).
    pub fn purge_auth(&self, auth_id: &str) {
        let mut state = self.state.lock().expect("selector lock");
        state
            .bindings
            .retain(|_, binding| binding.auth_id != auth_id);
    }

    /// Test/bootstrap hook: install a binding directly.
    pub fn seed_binding(
        &self,
        binding_key: impl Into<String>,
        auth_id: impl Into<String>,
        expires_at: OffsetDateTime,
        last_used_at: OffsetDateTime,
    ) {
        let mut state = self.state.lock().expect("selector lock");
        state.bindings.insert(
            binding_key.into(),
            StickyBinding {
                auth_id: auth_id.into(),
                expires_at,
                last_used_at,
            },
        );
    }

    /// Test hook: force the GC clock.
    pub fn set_last_gc(&self, at: OffsetDateTime) {
        let mut state = self.state.lock().expect("selector lock");
        state.last_gc = Some(at);
    }

    pub fn contains_binding(&self, binding_key: &str) -> bool {
        let state = self.state.lock().expect("selector lock");
        state.bindings.contains_key(binding_key)
    }
}

fn gc_locked(state: &mut SelectorState, now: OffsetDateTime) {
    state
        .bindings
        .retain(|_, binding| !binding.auth_id.is_empty() && binding.expires_at > now);
    state.last_gc = Some(now);
}

/// Rendezvous score: big-endian u64 of the first 8 bytes of
/// `SHA-256(session_key || 0x00 || auth_id)`. Pure, so the mapping is stable
/// across processes when load is equal.
pub fn rendezvous_score(session_key: &str, auth_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(session_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(auth_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::header_set;

    fn record(id: &str, provider: &str) -> AuthRecord {
        AuthRecord::new(id, provider)
    }

    fn session_ctx(session_id: &str) -> RequestContext {
        let mut headers = Vec::new();
        header_set(&mut headers, "session_id", session_id);
        RequestContext::new(headers, b"{}".to_vec())
    }

    #[test]
    fn gc_removes_expired_bindings_only() {
        let selector = StickySelector::default();
        let now = OffsetDateTime::now_utc();
        selector.seed_binding(
            "codex:codex:dead",
            "a",
            now - Duration::from_secs(60),
            now - Duration::from_secs(120),
        );
        selector.seed_binding(
            "codex:codex:live",
            "b",
            now + Duration::from_secs(60),
            now,
        );
        selector.set_last_gc(now - Duration::from_secs(3600));

        let auths = vec![record("a", "codex")];
        let _ = selector.pick("codex", "gpt-test", &session_ctx("s123"), &auths);

        assert!(!selector.contains_binding("codex:codex:dead"));
        assert!(selector.contains_binding("codex:codex:live"));
    }

    #[test]
    fn round_robin_when_no_session_key() {
        let selector = StickySelector::default();
        let auths = vec![record("a", "codex"), record("b", "codex")];
        let ctx = RequestContext::default();

        let first = selector.pick("codex", "gpt-test", &ctx, &auths).unwrap();
        let second = selector.pick("codex", "gpt-test", &ctx, &auths).unwrap();
        let third = selector.pick("codex", "gpt-test", &ctx, &auths).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.id, third.id);
    }

    #[test]
    fn no_binding_is_created_when_nothing_is_eligible() {
        let selector = StickySelector::default();
        let mut cooled = record("a", "codex");
        cooled.disabled = true;

        let err = selector
            .pick("codex", "gpt-test", &session_ctx("s123"), &[cooled])
            .unwrap_err();
        assert!(matches!(err, PickError::AuthNotFound { .. }));
        assert!(selector.session_binding_statuses().is_empty());
    }

    #[test]
    fn rendezvous_is_deterministic_and_orders_by_id_on_tie() {
        let score_a = rendezvous_score("codex:abc", "a");
        assert_eq!(score_a, rendezvous_score("codex:abc", "a"));
        assert_ne!(score_a, rendezvous_score("codex:abc", "b"));
    }

    #[test]
    fn session_counts_match_unexpired_bindings() {
        let selector = StickySelector::default();
        let now = OffsetDateTime::now_utc();
        selector.seed_binding("codex:codex:k1", "a", now + Duration::from_secs(60), now);
        selector.seed_binding("codex:codex:k2", "a", now + Duration::from_secs(60), now);
        selector.seed_binding("codex:codex:k3", "a", now - Duration::from_secs(60), now);
        selector.seed_binding("codex:codex:k4", "b", now + Duration::from_secs(60), now);

        assert_eq!(selector.session_count("a"), 2);
        assert_eq!(selector.session_count("b"), 1);

        let statuses = selector.session_binding_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].auth_id, "a");
        assert_eq!(statuses[0].session_count, 2);
        assert_eq!(statuses[1].auth_id, "b");
        assert_eq!(statuses[1].session_count, 1);
    }

    #[test]
    fn purge_drops_only_that_record() {
        let selector = StickySelector::default();
        let now = OffsetDateTime::now_utc();
        selector.seed_binding("codex:codex:k1", "a", now + Duration::from_secs(60), now);
        selector.seed_binding("codex:codex:k2", "b", now + Duration::from_secs(60), now);

        selector.purge_auth("a");
        assert_eq!(selector.session_count("a"), 0);
        assert_eq!(selector.session_count("b"), 1);
    }
}
