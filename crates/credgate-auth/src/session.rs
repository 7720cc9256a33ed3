use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::headers::{Headers, header_get};

/// Request-scoped inputs the selector derives a session key from: inbound
/// headers plus the untranslated request payload.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: Headers,
    pub original_request: Vec<u8>,
}

impl RequestContext {
    pub fn new(headers: Headers, original_request: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            original_request: original_request.into(),
        }
    }
}

fn claude_session_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"session_([a-f0-9-]{36})").expect("static regex"))
}

/// Hex of the first 16 bytes of SHA-256. Empty input hashes to the empty
/// string so callers can chain `if !hashed.is_empty()` checks.
pub fn stable_hash(input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn extract_bearer_token(header: &str) -> &str {
    let header = header.trim();
    if header.is_empty() {
        return header;
    }
    match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => header,
    }
}

/// Derive the sticky session key for a request, in priority order:
///
/// 1. `session_id` header (Codex surface) -> `codex:<hash>`
/// 2. body `metadata.user_id` containing `session_<uuid>` -> `claude:<uuid>`
/// 3. bearer Authorization / `x-api-key` / `x-goog-api-key` -> `apikey:<hash>`
/// 4. `User-Agent` -> `ua:<hash>`
///
/// Returns the empty string when none apply; the selector then falls back to
/// round-robin.
pub fn extract_session_key(ctx: &RequestContext) -> String {
    if let Some(sid) = header_get(&ctx.headers, "session_id") {
        let hashed = stable_hash(sid);
        if !hashed.is_empty() {
            return format!("codex:{hashed}");
        }
    }

    if !ctx.original_request.is_empty()
        && let Ok(body) = serde_json::from_slice::<serde_json::Value>(&ctx.original_request)
        && let Some(user_id) = body
            .pointer("/metadata/user_id")
            .and_then(|value| value.as_str())
    {
        let user_id = user_id.trim().to_ascii_lowercase();
        if let Some(captures) = claude_session_regex().captures(&user_id)
            && let Some(uuid) = captures.get(1)
        {
            return format!("claude:{}", uuid.as_str());
        }
    }

    for (name, prefix) in [
        ("authorization", true),
        ("x-api-key", false),
        ("x-goog-api-key", false),
    ] {
        if let Some(raw) = header_get(&ctx.headers, name) {
            let token = if prefix {
                extract_bearer_token(raw)
            } else {
                raw.trim()
            };
            let hashed = stable_hash(token);
            if !hashed.is_empty() {
                return format!("apikey:{hashed}");
            }
        }
    }

    if let Some(ua) = header_get(&ctx.headers, "user-agent") {
        let hashed = stable_hash(ua);
        if !hashed.is_empty() {
            return format!("ua:{hashed}");
        }
    }

    String::new()
}
