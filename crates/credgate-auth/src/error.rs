use crate::authenticator::AuthError;
use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PickError {
    #[error("auth_not_found: no credential available for provider {provider}")]
    AuthNotFound { provider: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("credential not found: {id}")]
    NotFound { id: String },
    #[error("no authenticator registered for provider {provider}")]
    UnknownProvider { provider: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Authenticator(#[from] AuthError),
    #[error("encode credential {id}: {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },
}
