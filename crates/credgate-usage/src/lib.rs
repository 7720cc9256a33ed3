//! Advisory quota observations, per provider family.
//!
//! Snapshots are written by the request executor (response headers, probe
//! bodies) and by the management quota actions; they are read back only by
//! the management surface and never feed routing decisions.

pub mod antigravity;
pub mod codex;
pub mod kiro;
pub mod registry;

pub use antigravity::{
    AntigravityModelQuota, AntigravityQuotaSnapshot, parse_antigravity_quota_snapshot,
};
pub use codex::{CodexQuotaSnapshot, parse_codex_quota_snapshot};
pub use kiro::{
    KiroSubscriptionInfo, KiroUsageBreakdown, KiroUsageSnapshot, KiroUserInfo,
    parse_kiro_usage_snapshot,
};
pub use registry::SnapshotRegistry;

use std::sync::Arc;

/// All snapshot registries the process carries, one per provider family.
/// Constructed once at bootstrap and shared; tests build their own to stay
/// isolated.
#[derive(Clone, Default)]
pub struct UsageHub {
    pub codex: Arc<SnapshotRegistry<CodexQuotaSnapshot>>,
    pub kiro: Arc<SnapshotRegistry<KiroUsageSnapshot>>,
    pub antigravity: Arc<SnapshotRegistry<AntigravityQuotaSnapshot>>,
}

impl UsageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every snapshot referencing `auth_id` (record deletion path).
    pub fn forget(&self, auth_id: &str) {
        self.codex.delete(auth_id);
        self.kiro.delete(auth_id);
        self.antigravity.delete(auth_id);
    }
}
