//! Credential lifecycle and sticky routing core for credgate.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. Authenticator implementations live in `credgate-providers` and
//! perform their own upstream IO; everything here is in-memory state plus
//! token-file persistence.

pub mod authenticator;
pub mod error;
pub mod headers;
pub mod manager;
pub mod outcome;
pub mod record;
pub mod refresh;
pub mod selector;
pub mod session;
pub mod store;

pub use authenticator::{
    AuthError, AuthErrorKind, Authenticator, AuthenticatorRegistry, LoginOptions,
};
pub use error::{ManagerError, PickError};
pub use headers::{Headers, header_get, header_set};
pub use manager::{Manager, ManagerConfig};
pub use outcome::CallOutcome;
pub use record::{AuthRecord, AuthStatus, ModelState, QuotaState, backoff_delay};
pub use refresh::spawn_refresh_worker;
pub use selector::{SessionBindingStatus, StickyConfig, StickySelector, rendezvous_score};
pub use session::{RequestContext, extract_session_key, stable_hash};
pub use store::{StoreError, TokenStore};
