//! Shared OAuth plumbing: PKCE material, the loopback callback server, and
//! device-code error classification.

pub mod callback;
pub mod device;
pub mod pkce;

pub use callback::{CallbackResult, CallbackServer, parse_callback_input, parse_query_value};
pub use device::{DEFAULT_POLL_INTERVAL, MAX_POLL_DURATION, classify_oauth_error, poll_interval};
pub use pkce::{PkcePair, generate_pkce, generate_state};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Decode a JWT payload segment without verifying the signature. Claims are
/// only mined for display metadata (e-mail, account id, plan), never trusted
/// for authorization.
pub fn decode_jwt_claims(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (header, payload, signature) = (parts.next()?, parts.next()?, parts.next()?);
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Best-effort e-mail claim from a JWT access or id token.
pub fn email_from_jwt(token: &str) -> Option<String> {
    let claims = decode_jwt_claims(token)?;
    claims
        .get("email")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(payload: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn email_claim_is_extracted() {
        let token = fake_jwt(&serde_json::json!({"email": "user@example.com"}));
        assert_eq!(email_from_jwt(&token).as_deref(), Some("user@example.com"));
    }

    #[test]
    fn malformed_tokens_yield_none() {
        assert!(decode_jwt_claims("").is_none());
        assert!(decode_jwt_claims("one.two").is_none());
        assert!(decode_jwt_claims("a.!!!.c").is_none());
        assert!(email_from_jwt("..").is_none());
    }
}
