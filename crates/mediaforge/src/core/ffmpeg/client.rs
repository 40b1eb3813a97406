//! FFmpeg Microservice Client
//!
//! Typed HTTP client for the FFmpeg service. Binary responses carry their
//! metadata in `X-*` headers; failures come back as
//! `{success: false, error, timestamp}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::fs::validate_local_input_path;
use crate::core::media::VideoFormat;
use crate::core::{CoreError, CoreResult, Options};

/// Default URL of the FFmpeg service
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Multipart field for the single upload of `/video/extractAudio`
const EXTRACT_FIELD: &str = "video";

/// Multipart field repeated for each upload of `/video/filter`
const FILTER_FIELD: &str = "videos";

// =============================================================================
// Request / Response Types
// =============================================================================

/// Options for `/video/extractAudio`; unset fields use the service defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractAudioOptions {
    pub output_format: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bitrate: Option<String>,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub volume: Option<f64>,
    pub normalize: bool,
}

impl Default for ExtractAudioOptions {
    fn default() -> Self {
        Self {
            output_format: "wav".to_string(),
            sample_rate: None,
            channels: None,
            bitrate: None,
            start_time: None,
            duration: None,
            volume: None,
            normalize: false,
        }
    }
}

impl ExtractAudioOptions {
    /// Reads resolved model options; unknown keys are ignored
    pub fn from_options(options: &Options) -> CoreResult<Self> {
        serde_json::from_value(Value::Object(options.clone())).map_err(|e| {
            CoreError::InvalidInput(format!("Invalid audio extraction options: {}", e))
        })
    }

    fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("outputFormat", self.output_format.clone())];
        if let Some(v) = self.sample_rate {
            fields.push(("sampleRate", v.to_string()));
        }
        if let Some(v) = self.channels {
            fields.push(("channels", v.to_string()));
        }
        if let Some(v) = &self.bitrate {
            fields.push(("bitrate", v.clone()));
        }
        if let Some(v) = self.start_time {
            fields.push(("startTime", v.to_string()));
        }
        if let Some(v) = self.duration {
            fields.push(("duration", v.to_string()));
        }
        if let Some(v) = self.volume {
            fields.push(("volume", v.to_string()));
        }
        if self.normalize {
            fields.push(("normalize", "true".to_string()));
        }
        fields
    }
}

/// Binary service response
#[derive(Debug, Clone)]
pub struct ServiceOutput {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    /// `X-*` headers, camelCased (`X-Sample-Rate` -> `sampleRate`)
    pub metadata: Options,
}

/// `GET /health`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: String,
    pub ffmpeg_version: Option<String>,
    pub active_jobs: u64,
    pub total_jobs: u64,
    pub uptime: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Client for the FFmpeg service
#[derive(Debug, Clone)]
pub struct FFmpegServiceClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl FFmpegServiceClient {
    /// Every request is bounded by `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CoreError::Configuration(
                "FFmpeg service requires a base URL".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request_error(&self, operation: &str, e: reqwest::Error) -> CoreError {
        if e.is_timeout() {
            CoreError::Timeout {
                operation: format!("ffmpeg {}", operation),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            CoreError::FFmpegService(format!("{} request failed: {}", operation, e))
        }
    }

    /// Extracts the audio track of a local video file
    pub async fn extract_audio(
        &self,
        video: &Path,
        options: &ExtractAudioOptions,
    ) -> CoreResult<ServiceOutput> {
        let mut form = Form::new().part(EXTRACT_FIELD, file_part(video).await?);
        for (name, value) in options.form_fields() {
            form = form.text(name, value);
        }

        info!("Extracting audio from {}", video.display());
        self.post_form("/video/extractAudio", form).await
    }

    /// Runs an FFmpeg `-filter_complex` graph over one or more videos
    pub async fn filter_video(
        &self,
        filter_complex: &str,
        videos: &[PathBuf],
    ) -> CoreResult<ServiceOutput> {
        if filter_complex.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "filterComplex must not be empty".to_string(),
            ));
        }
        if videos.is_empty() {
            return Err(CoreError::InvalidInput(
                "filter requires at least one video".to_string(),
            ));
        }

        let mut form = Form::new().text("filterComplex", filter_complex.to_string());
        for video in videos {
            form = form.part(FILTER_FIELD, file_part(video).await?);
        }

        info!("Filtering {} video(s)", videos.len());
        self.post_form("/video/filter", form).await
    }

    pub async fn health(&self) -> CoreResult<ServiceHealth> {
        let value = self.get_json("/health").await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Raw `/health/detailed` document
    pub async fn health_detailed(&self) -> CoreResult<Value> {
        self.get_json("/health/detailed").await
    }

    async fn get_json(&self, path: &str) -> CoreResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.request_error(path, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.request_error(path, e))?;
        if !status.is_success() {
            return Err(service_error(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_form(&self, path: &str, form: Form) -> CoreResult<ServiceOutput> {
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_error(path, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let data = response
            .bytes()
            .await
            .map_err(|e| self.request_error(path, e))?;

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        if !status.is_success() || content_type.as_deref() == Some("application/json") {
            return Err(service_error(status, &String::from_utf8_lossy(&data)));
        }

        let metadata = header_metadata(&headers);
        debug!("{} returned {} bytes", path, data.len());
        Ok(ServiceOutput {
            data: data.to_vec(),
            content_type,
            metadata,
        })
    }
}

async fn file_part(path: &Path) -> CoreResult<Part> {
    let path = validate_local_input_path(&path.to_string_lossy(), "video").await?;
    let data = tokio::fs::read(&path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "input.mp4".to_string());
    let mime = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(VideoFormat::parse)
        .unwrap_or_default()
        .mime_type();

    Part::bytes(data)
        .file_name(name)
        .mime_str(mime)
        .map_err(|e| CoreError::Internal(format!("Failed to create form part: {}", e)))
}

/// Error from a failed or JSON-enveloped response
fn service_error(status: reqwest::StatusCode, body: &str) -> CoreError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.error.or(env.message))
        .unwrap_or_else(|| body.chars().take(500).collect());
    CoreError::FFmpegService(format!("({}) {}", status, message))
}

/// `X-Sample-Rate: 44100` -> `{"sampleRate": 44100}`
fn header_metadata(headers: &HeaderMap) -> Options {
    let mut metadata = Options::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix("x-") else {
            continue;
        };
        let Ok(raw) = value.to_str() else {
            continue;
        };
        metadata.insert(camel_case(key), typed_header_value(raw));
    }
    metadata
}

fn camel_case(kebab: &str) -> String {
    let mut out = String::with_capacity(kebab.len());
    let mut upper = false;
    for c in kebab.chars() {
        if c == '-' {
            upper = !out.is_empty();
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn typed_header_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};
    use serde_json::json;

    #[test]
    fn test_extract_options_from_resolved_options() {
        let options = crate::core::options_from(json!({
            "outputFormat": "mp3",
            "sampleRate": 44100,
            "normalize": true,
            "ignored": "x"
        }));
        let parsed = ExtractAudioOptions::from_options(&options).unwrap();

        assert_eq!(parsed.output_format, "mp3");
        assert_eq!(parsed.sample_rate, Some(44100));
        assert!(parsed.normalize);

        let fields = parsed.form_fields();
        assert!(fields.contains(&("sampleRate", "44100".to_string())));
        assert!(fields.contains(&("normalize", "true".to_string())));
        assert!(!fields.iter().any(|(k, _)| *k == "channels"));
    }

    #[test]
    fn test_invalid_extract_options() {
        let options = crate::core::options_from(json!({"sampleRate": "fast"}));
        let err = ExtractAudioOptions::from_options(&options).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_header_metadata() {
        let mut headers = HeaderMap::new();
        for (k, v) in [
            ("x-sample-rate", "44100"),
            ("x-duration", "12.5"),
            ("x-codec", "pcm_s16le"),
            ("x-has-audio", "true"),
            ("content-length", "10"),
        ] {
            headers.insert(
                HeaderName::from_static(k),
                HeaderValue::from_static(v),
            );
        }

        let metadata = header_metadata(&headers);
        assert_eq!(metadata["sampleRate"], json!(44100));
        assert_eq!(metadata["duration"], json!(12.5));
        assert_eq!(metadata["codec"], json!("pcm_s16le"));
        assert_eq!(metadata["hasAudio"], json!(true));
        assert!(!metadata.contains_key("contentLength"));
    }

    #[test]
    fn test_service_error_envelope() {
        let err = service_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"success":false,"error":"No video stream","timestamp":"2024-01-01T00:00:00Z"}"#,
        );
        assert_eq!(err.kind(), "ffmpeg_service");
        assert!(err.to_string().contains("No video stream"));
    }

    #[test]
    fn test_requires_base_url() {
        assert!(FFmpegServiceClient::new("  ", Duration::from_secs(1)).is_err());
        let client = FFmpegServiceClient::new("http://svc:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://svc:8080");
    }

    #[tokio::test]
    async fn test_filter_validates_before_upload() {
        let client = FFmpegServiceClient::new(DEFAULT_BASE_URL, Duration::from_secs(1)).unwrap();
        assert!(client.filter_video("", &[PathBuf::from("a.mp4")]).await.is_err());
        assert!(client.filter_video("[0:v]hflip", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let client = FFmpegServiceClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        assert!(client.health().await.is_err());
    }
}
