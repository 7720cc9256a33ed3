use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use credgate_common::GlobalConfig;

use crate::record::AuthRecord;

/// Classification of authenticator failures. The manager retries `Transient`
/// refreshes with backoff; `Denied`/`Expired`/`Fatal` invalidate the record;
/// the pending/slow-down kinds only occur inside device-code polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Transient,
    AuthorizationPending,
    SlowDown,
    Denied,
    Expired,
    Fatal,
}

impl AuthErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorKind::Transient => "transient",
            AuthErrorKind::AuthorizationPending => "authorization_pending",
            AuthErrorKind::SlowDown => "slow_down",
            AuthErrorKind::Denied => "denied",
            AuthErrorKind::Expired => "expired",
            AuthErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Transient, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Denied, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Expired, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Fatal, message)
    }

    pub fn pending() -> Self {
        Self::new(AuthErrorKind::AuthorizationPending, "authorization pending")
    }

    pub fn slow_down() -> Self {
        Self::new(AuthErrorKind::SlowDown, "slow down")
    }

    pub fn is_transient(&self) -> bool {
        self.kind == AuthErrorKind::Transient
    }
}

/// Knobs for a login run.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Preferred human-readable label when the provider yields none.
    pub label: Option<String>,
    /// Print the auth URL instead of spawning a browser.
    pub no_browser: bool,
    /// Token-import flows: path to a sibling tool's token file.
    pub import_path: Option<PathBuf>,
    /// Identity-provider choice for flows that support several (Kiro social).
    pub idp: Option<String>,
}

/// Provider-specific credential lifecycle.
///
/// Implementations own their wire formats and token endpoints; the manager
/// only sees the resulting record envelope.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Stable provider key, e.g. "codex".
    fn provider(&self) -> &'static str;

    /// Lead time before expiry at which a scheduled refresh should run.
    /// `None` means tokens never expire and the worker skips the record.
    fn refresh_lead(&self) -> Option<Duration>;

    /// Run the provider flow and return a fully populated record
    /// (storage, metadata, label).
    async fn login(&self, config: &GlobalConfig, options: &LoginOptions)
    -> Result<AuthRecord, AuthError>;

    /// Produce an updated record from the current one. Must not change the id.
    async fn refresh(&self, record: &AuthRecord) -> Result<AuthRecord, AuthError>;
}

#[derive(Default)]
pub struct AuthenticatorRegistry {
    inner: HashMap<String, Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.inner
            .insert(authenticator.provider().to_string(), authenticator);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Authenticator>> {
        self.inner.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}
