//! Concrete provider authenticators and quota probes.
//!
//! Each provider implements the `Authenticator` contract from
//! `credgate-auth` and owns its wire formats end to end: OAuth endpoints,
//! token persistence blobs, and the quota probe the management plane calls.

pub mod antigravity;
pub mod codex;
pub mod copilot;
pub mod http;
pub mod kiro;
pub mod oauth;

pub use codex::CodexAuthenticator;
pub use copilot::CopilotAuthenticator;
pub use kiro::KiroAuthenticator;

use std::sync::Arc;

use credgate_auth::AuthenticatorRegistry;

/// Registry with every built-in provider registered.
pub fn builtin_registry() -> AuthenticatorRegistry {
    let mut registry = AuthenticatorRegistry::new();
    registry.register(Arc::new(CodexAuthenticator::new()));
    registry.register(Arc::new(CopilotAuthenticator::new()));
    registry.register(Arc::new(KiroAuthenticator::new()));
    registry
}
