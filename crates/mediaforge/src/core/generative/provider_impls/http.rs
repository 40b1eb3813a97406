//! Shared HTTP plumbing for provider adapters.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::warn;

use crate::core::{CoreError, CoreResult};

/// Base delay for exponential backoff (milliseconds)
pub(crate) const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Maximum allowed download size (500 MB)
pub(crate) const MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

pub(crate) fn build_client(timeout: Duration) -> CoreResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Whether an error is likely transient and worth retrying
pub(crate) fn is_retryable_error(error: &CoreError) -> bool {
    let message = match error {
        CoreError::Internal(msg) => msg,
        CoreError::Timeout { .. } => return true,
        _ => return false,
    };

    let lowered = message.to_ascii_lowercase();
    lowered.contains("429")
        || lowered.contains("502")
        || lowered.contains("503")
        || lowered.contains("504")
        || lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("temporarily unavailable")
}

/// Runs `f` up to `max_attempts` times with exponential backoff on
/// transient errors
pub(crate) async fn execute_with_retry<F, Fut, T>(
    label: &str,
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    f: F,
) -> CoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if !is_retryable_error(&e) || attempt >= attempts {
                    return Err(e);
                }

                let delay = base_delay * 2u32.pow(attempt - 1);
                warn!(
                    "{} {} attempt {} failed, retrying in {}ms: {}",
                    label,
                    operation,
                    attempt,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Internal(format!("Request timeout: {}", e))
    } else {
        CoreError::Internal(format!("Network error: {}", e))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Builds an error from a non-success response.
///
/// 5xx and 429 statuses are reported as `Internal` so they stay retryable;
/// the rest are `InvalidInput` carrying the service message.
pub(crate) fn parse_api_error(label: &str, status: StatusCode, body: &str) -> CoreError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| {
            let from_value = |v: serde_json::Value| match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Object(ref map) => map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| v.to_string()),
                other => other.to_string(),
            };
            env.detail
                .map(from_value)
                .or_else(|| env.error.map(from_value))
                .or(env.message)
        })
        .unwrap_or_else(|| body.chars().take(500).collect());

    let text = format!("{} API error ({}): {}", label, status, message);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CoreError::Internal(text)
    } else {
        CoreError::InvalidInput(text)
    }
}

/// `numInferenceSteps` -> `num_inference_steps`
pub(crate) fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Validates that a download URL is http(s)
pub(crate) fn validate_download_url(url: &str) -> CoreResult<reqwest::Url> {
    let parsed = reqwest::Url::parse(url).map_err(|e| {
        CoreError::ValidationError(format!("Invalid download URL '{}': {}", url, e))
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(CoreError::ValidationError(format!(
            "Unsupported download URL scheme '{}'. Only http/https are allowed.",
            scheme
        ))),
    }
}

/// Downloads a URL into memory, refusing bodies over [`MAX_DOWNLOAD_BYTES`].
///
/// Returns the bytes and the response content type.
pub(crate) async fn download(
    client: &reqwest::Client,
    url: &str,
) -> CoreResult<(Vec<u8>, Option<String>)> {
    let url = validate_download_url(url)?;
    let response = client.get(url).send().await.map_err(network_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(parse_api_error("Download", status, &body));
    }
    if response
        .content_length()
        .is_some_and(|len| len > MAX_DOWNLOAD_BYTES)
    {
        return Err(CoreError::ValidationError(format!(
            "Download exceeds {} bytes",
            MAX_DOWNLOAD_BYTES
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let bytes = response.bytes().await.map_err(network_error)?;
    if bytes.len() as u64 > MAX_DOWNLOAD_BYTES {
        return Err(CoreError::ValidationError(format!(
            "Download exceeds {} bytes",
            MAX_DOWNLOAD_BYTES
        )));
    }
    Ok((bytes.to_vec(), content_type))
}
