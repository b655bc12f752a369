//! Shared plumbing for the outbound HTTP clients

use std::time::Duration;

use reqwest::{Response, Url};

use crate::Error;

/// Timeout applied to every outbound request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client with the default timeout
pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Append percent-encoded path segments to `base`.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url, Error> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::internal(format!("invalid base URL '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::internal(format!("base URL '{}' cannot take a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Best-effort error text from a failed response: the JSON `message` field
/// when present, else the raw body.
pub(crate) async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
    format!("{} {}", status, message.trim())
}
