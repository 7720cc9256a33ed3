use std::time::Duration;

use credgate_auth::AuthError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Ports tried for the loopback callback listener: base, base+1, .. base+4.
pub const PORT_RANGE: u16 = 4;
/// Hard cap on how long a login waits for the browser callback.
pub const CALLBACK_WAIT: Duration = Duration::from_secs(600);

const SUCCESS_PAGE: &str = "<html><body><h2>Authentication complete.</h2>\
<p>You can close this window and return to the terminal.</p></body></html>";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
    pub error: Option<String>,
}

/// Minimal single-shot HTTP listener for OAuth redirects.
///
/// Binds the first free port in the range, serves exactly one matching
/// request, and returns its `code`/`state`/`error` query parameters. The
/// listener is dropped as soon as the wait finishes or times out.
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
    path: String,
}

impl CallbackServer {
    pub async fn bind(base_port: u16, path: &str) -> Result<Self, AuthError> {
        for port in base_port..=base_port.saturating_add(PORT_RANGE) {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    return Ok(Self {
                        listener,
                        port,
                        path: path.to_string(),
                    });
                }
                Err(err) => {
                    debug!(port, error = %err, "callback port unavailable, trying next");
                }
            }
        }
        Err(AuthError::fatal(format!(
            "no free loopback port in {base_port}..={}",
            base_port.saturating_add(PORT_RANGE)
        )))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.path)
    }

    /// Wait for the OAuth redirect, bounded by `timeout`.
    pub async fn wait_for_callback(self, timeout: Duration) -> Result<CallbackResult, AuthError> {
        match tokio::time::timeout(timeout, self.accept_callback()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::expired("timed out waiting for oauth callback")),
        }
    }

    async fn accept_callback(self) -> Result<CallbackResult, AuthError> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|err| AuthError::transient(format!("callback accept: {err}")))?;
            if let Some(result) = handle_connection(stream, &self.path).await {
                return Ok(result);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, expected_path: &str) -> Option<CallbackResult> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await.ok()?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next()?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" {
        respond(&mut stream, 405, "method not allowed").await;
        return None;
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    if path != expected_path {
        respond(&mut stream, 404, "not found").await;
        return None;
    }

    let result = CallbackResult {
        code: parse_query_value(query, "code").unwrap_or_default(),
        state: parse_query_value(query, "state").unwrap_or_default(),
        error: parse_query_value(query, "error"),
    };
    respond(&mut stream, 200, SUCCESS_PAGE).await;
    Some(result)
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Extract a single decoded value from a raw query string.
pub fn parse_query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };
        if name != key {
            continue;
        }
        let value = value.replace('+', " ");
        return match urlencoding::decode(&value) {
            Ok(decoded) => Some(decoded.into_owned()),
            Err(_) => Some(value),
        };
    }
    None
}

/// Parse an OAuth callback value pasted by the operator: a full http(s) URL,
/// a custom-scheme URL (e.g. `kiro://.../authenticate-success?...`), or a
/// bare query string. Returns the code/state/error triple.
pub fn parse_callback_input(raw: &str) -> Result<CallbackResult, AuthError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(AuthError::fatal("empty callback input"));
    }

    let query = match input.split_once("://") {
        Some((_scheme, rest)) => match rest.split_once('?') {
            Some((_, query)) => query,
            None => return Err(AuthError::fatal("callback URL carries no query")),
        },
        None => input,
    };

    let result = CallbackResult {
        code: parse_query_value(query, "code").unwrap_or_default(),
        state: parse_query_value(query, "state").unwrap_or_default(),
        error: parse_query_value(query, "error"),
    };
    if result.error.is_none() && result.code.is_empty() {
        return Err(AuthError::fatal("missing code in callback"));
    }
    if result.error.is_none() && result.state.is_empty() {
        return Err(AuthError::fatal("missing state in callback"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_exactly_one_matching_request() {
        let server = CallbackServer::bind(39451, "/auth/callback").await.unwrap();
        let uri = server.redirect_uri();
        let port = server.port();

        let client = tokio::spawn(async move {
            // A non-matching path first, then the real callback.
            for target in [
                "/favicon.ico".to_string(),
                "/auth/callback?code=abc&state=xyz".to_string(),
            ] {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = Vec::new();
                let _ = stream.read_to_end(&mut response).await;
            }
        });

        let result = server
            .wait_for_callback(Duration::from_secs(5))
            .await
            .unwrap();
        client.await.unwrap();

        assert!(uri.ends_with("/auth/callback"));
        assert_eq!(result.code, "abc");
        assert_eq!(result.state, "xyz");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn bind_skips_occupied_ports() {
        let first = CallbackServer::bind(39461, "/cb").await.unwrap();
        let second = CallbackServer::bind(39461, "/cb").await.unwrap();
        assert_ne!(first.port(), second.port());
        assert!(second.port() <= 39461 + PORT_RANGE);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let server = CallbackServer::bind(39471, "/cb").await.unwrap();
        let err = server
            .wait_for_callback(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, credgate_auth::AuthErrorKind::Expired);
    }

    #[test]
    fn callback_input_accepts_urls_and_queries() {
        let from_url =
            parse_callback_input("http://127.0.0.1:11123/oauth/callback?code=c1&state=s1").unwrap();
        assert_eq!(from_url.code, "c1");
        assert_eq!(from_url.state, "s1");

        let from_scheme =
            parse_callback_input("kiro://kiro.kiroAgent/authenticate-success?code=c2&state=s2")
                .unwrap();
        assert_eq!(from_scheme.code, "c2");

        let from_query = parse_callback_input("code=c3&state=s3").unwrap();
        assert_eq!(from_query.code, "c3");
        assert_eq!(from_query.state, "s3");

        let with_error = parse_callback_input("error=access_denied&state=s4").unwrap();
        assert_eq!(with_error.error.as_deref(), Some("access_denied"));

        assert!(parse_callback_input("").is_err());
        assert!(parse_callback_input("state=only").is_err());
    }

    #[test]
    fn query_values_are_decoded() {
        assert_eq!(
            parse_query_value("a=1&code=x%20y&b=2", "code").as_deref(),
            Some("x y")
        );
        assert_eq!(parse_query_value("code=a+b", "code").as_deref(), Some("a b"));
        assert!(parse_query_value("a=1", "code").is_none());
    }
}
