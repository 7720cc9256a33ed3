use std::time::Duration;

use credgate_auth::{AuthError, Headers};

/// Shared upstream HTTP client for OAuth and probe traffic.
pub fn build_client(proxy: Option<&str>) -> Result<wreq::Client, AuthError> {
    let proxy = proxy.map(str::trim).filter(|value| !value.is_empty());

    let mut builder = wreq::Client::builder().timeout(Duration::from_secs(30));
    if let Some(proxy) = proxy {
        let parsed = wreq::Proxy::all(proxy)
            .map_err(|err| AuthError::fatal(format!("invalid proxy {proxy}: {err}")))?;
        builder = builder.proxy(parsed);
    }
    builder
        .build()
        .map_err(|err| AuthError::fatal(format!("build http client: {err}")))
}

/// Flatten a response header map into the selector-friendly header list.
pub fn headers_from_response(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
