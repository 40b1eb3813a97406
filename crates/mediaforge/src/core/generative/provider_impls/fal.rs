//! FAL.ai Provider
//!
//! Remote provider backed by the FAL queue API. Jobs are submitted, polled
//! until they settle, and the first output file is downloaded.
//!
//! Features:
//! - Queue submit + poll pattern
//! - Automatic retry with exponential backoff on transient errors
//! - Cancellation of in-flight queue requests by job id

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::http::{
    build_client, download, execute_with_retry, network_error, parse_api_error, to_snake_case,
    BASE_RETRY_DELAY_MS,
};
use crate::core::generative::jobs::{current_job, JobStatus, JobTracker};
use crate::core::JobId;
use crate::core::generative::models::{Model, ModelLimits, ParameterSpec, Pricing, ProviderModel};
use crate::core::generative::providers::{
    MediaProvider, ProviderCapability, ProviderConfig, ProviderType,
};
use crate::core::media::{MediaKind, MediaValue, RawMedia};
use crate::core::settings::TimeoutSettings;
use crate::core::{CoreError, CoreResult, Options};

// =============================================================================
// Constants
// =============================================================================

/// Default FAL queue endpoint
pub const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

const PROVIDER_ID: &str = "fal";

const LABEL: &str = "FAL";

pub const FLUX_SCHNELL: &str = "fal-ai/flux/schnell";
pub const KLING_IMAGE_TO_VIDEO: &str = "fal-ai/kling-video/image-to-video";
pub const KOKORO: &str = "fal-ai/kokoro";

// =============================================================================
// API Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
    #[serde(default)]
    cancel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    queue_position: Option<u64>,
}

/// Queue endpoints for one submitted request
#[derive(Debug, Clone, PartialEq)]
struct QueueRequest {
    request_id: String,
    status_url: String,
    response_url: String,
    cancel_url: String,
}

// =============================================================================
// Client
// =============================================================================

struct FalClient {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    poll_interval: Duration,
    /// Submitted requests that have not settled yet, by job id
    in_flight: Mutex<HashMap<JobId, QueueRequest>>,
}

impl FalClient {
    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }

    fn request_urls(&self, model_id: &str, submit: SubmitResponse) -> QueueRequest {
        let base = format!("{}/{}/requests/{}", self.base_url, model_id, submit.request_id);
        QueueRequest {
            status_url: submit
                .status_url
                .unwrap_or_else(|| format!("{}/status", base)),
            response_url: submit.response_url.unwrap_or_else(|| base.clone()),
            cancel_url: submit
                .cancel_url
                .unwrap_or_else(|| format!("{}/cancel", base)),
            request_id: submit.request_id,
        }
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> CoreResult<Value> {
        let response = builder
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(parse_api_error(LABEL, status, &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            CoreError::Internal(format!("Failed to parse {} response: {}", LABEL, e))
        })
    }

    async fn submit(&self, model_id: &str, body: &Value) -> CoreResult<QueueRequest> {
        let url = format!("{}/{}", self.base_url, model_id);
        let value = execute_with_retry(
            LABEL,
            "submit",
            self.max_retries,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            || self.send_json(self.client.post(&url).json(body)),
        )
        .await?;
        let submit: SubmitResponse = serde_json::from_value(value)?;
        Ok(self.request_urls(model_id, submit))
    }

    async fn status(&self, request: &QueueRequest) -> CoreResult<StatusResponse> {
        let value = execute_with_retry(
            LABEL,
            "poll",
            self.max_retries,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            || self.send_json(self.client.get(&request.status_url)),
        )
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn result(&self, request: &QueueRequest) -> CoreResult<Value> {
        execute_with_retry(
            LABEL,
            "result",
            self.max_retries,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            || self.send_json(self.client.get(&request.response_url)),
        )
        .await
    }

    /// Polls until the request completes; the caller's timeout bounds the wait.
    ///
    /// Stops with `Cancelled` once `key` has been untracked by a cancel.
    async fn wait(&self, key: &str, request: &QueueRequest) -> CoreResult<()> {
        loop {
            if !self.is_tracked(key) {
                return Err(CoreError::Cancelled(format!(
                    "{} request {} was cancelled",
                    LABEL, request.request_id
                )));
            }
            let status = self.status(request).await?;
            debug!(
                "{} request {}: status={} position={:?}",
                LABEL, request.request_id, status.status, status.queue_position
            );
            match status.status.as_str() {
                "COMPLETED" => return Ok(()),
                "IN_QUEUE" | "IN_PROGRESS" => tokio::time::sleep(self.poll_interval).await,
                other => {
                    return Err(CoreError::Internal(format!(
                        "{} request {} ended with status {}",
                        LABEL, request.request_id, other
                    )))
                }
            }
        }
    }

    async fn cancel(&self, request: &QueueRequest) -> CoreResult<()> {
        self.send_json(self.client.put(&request.cancel_url)).await?;
        Ok(())
    }

    fn track(&self, key: &str, request: &QueueRequest) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.insert(key.to_string(), request.clone());
        }
    }

    fn untrack(&self, key: &str) -> Option<QueueRequest> {
        self.in_flight.lock().ok().and_then(|mut map| map.remove(key))
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    fn tracked(&self, key: &str) -> Option<QueueRequest> {
        self.in_flight.lock().ok().and_then(|map| map.get(key).cloned())
    }
}

/// Removes a request from the in-flight table when the invocation ends,
/// including when it is dropped by a timeout
struct InFlightGuard<'a> {
    client: &'a FalClient,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.client.untrack(&self.key);
    }
}

// =============================================================================
// Request building
// =============================================================================

fn data_uri(mime: &str, data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Request body for a capability; resolved options are passed through with
/// snake_case keys, unset (null) options are left out
fn build_body(
    capability: ProviderCapability,
    input: &MediaValue,
    options: &Options,
) -> CoreResult<Value> {
    let mut body = serde_json::Map::new();
    for (key, value) in options.iter().filter(|(_, v)| !v.is_null()) {
        body.insert(to_snake_case(key), value.clone());
    }

    match (capability, input) {
        (ProviderCapability::ImageToVideo, MediaValue::Image(image)) => {
            body.insert(
                "image_url".to_string(),
                json!(data_uri(image.format().mime_type(), image.data())),
            );
            // Kling rejects a missing or null prompt
            body.entry("prompt").or_insert_with(|| json!(""));
            // Kling takes the duration as a string of whole seconds
            if let Some(seconds) = body.get("duration").and_then(Value::as_f64) {
                body.insert("duration".to_string(), json!(format!("{}", seconds.round() as u64)));
            }
        }
        (ProviderCapability::TextToImage, MediaValue::Text(text)) => {
            body.insert("prompt".to_string(), json!(text.content()));
            // only the first image of a batch is returned
            body.insert("num_images".to_string(), json!(1));
        }
        (_, MediaValue::Text(text)) => {
            body.insert("prompt".to_string(), json!(text.content()));
        }
        (capability, other) => {
            return Err(CoreError::InvalidInput(format!(
                "{} cannot accept {} input for {}",
                LABEL,
                other.kind(),
                capability
            )))
        }
    }

    Ok(Value::Object(body))
}

/// First output file in a result payload, with any reported content type
fn first_output(result: &Value) -> Option<(String, Option<String>, Options)> {
    let file = result
        .get("images")
        .and_then(|images| images.get(0))
        .or_else(|| result.get("image"))
        .or_else(|| result.get("video"))
        .or_else(|| result.get("audio"))
        .or_else(|| result.get("audio_file"))
        .or_else(|| result.get("audio_url"))?;

    let url = match file {
        Value::String(url) => url.clone(),
        other => other.get("url")?.as_str()?.to_string(),
    };
    let content_type = file
        .get("content_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut metadata = Options::new();
    for key in ["width", "height", "duration"] {
        if let Some(v) = file.get(key).filter(|v| v.is_number()) {
            metadata.insert(key.to_string(), v.clone());
        }
    }
    if let Some(seed) = result.get("seed") {
        metadata.insert("seed".to_string(), seed.clone());
    }

    Some((url, content_type, metadata))
}

/// Format tag for a download: content type, else the URL extension
fn format_hint(url: &str, content_type: Option<String>) -> Option<String> {
    content_type.filter(|c| !c.is_empty()).or_else(|| {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    })
}

// =============================================================================
// Catalog
// =============================================================================

fn static_catalog() -> Vec<ProviderModel> {
    vec![
        ProviderModel::new(
            FLUX_SCHNELL,
            "FLUX.1 [schnell]",
            vec![ProviderCapability::TextToImage],
        )
        .with_description("Fast text-to-image generation")
        .with_parameter(
            "imageSize",
            ParameterSpec::enumeration([
                "square_hd",
                "square",
                "portrait_4_3",
                "portrait_16_9",
                "landscape_4_3",
                "landscape_16_9",
            ])
            .with_default("landscape_4_3"),
        )
        .with_parameter(
            "numInferenceSteps",
            ParameterSpec::integer().with_default(4).with_range(1.0, 12.0),
        )
        .with_parameter("seed", ParameterSpec::seed())
        .with_pricing(Pricing::flat(0.003))
        .with_limits(ModelLimits {
            max_input_chars: Some(2000),
            ..ModelLimits::default()
        }),
        ProviderModel::new(
            KLING_IMAGE_TO_VIDEO,
            "Kling Image to Video",
            vec![ProviderCapability::ImageToVideo],
        )
        .with_description("Animates a still image into a short clip")
        .with_parameter("prompt", ParameterSpec::string())
        .with_parameter(
            "duration",
            ParameterSpec::number()
                .with_default(5.0)
                .with_range(5.0, 10.0)
                .with_description("Clip length in seconds"),
        )
        .with_parameter(
            "aspectRatio",
            ParameterSpec::enumeration(["16:9", "9:16", "1:1"]).with_default("16:9"),
        )
        .with_pricing(Pricing::linear(0.15, "duration", 5.0)),
        ProviderModel::new(KOKORO, "Kokoro TTS", vec![ProviderCapability::TextToSpeech])
            .with_description("Multi-voice text-to-speech")
            .with_parameter("voice", ParameterSpec::string().with_default("af_heart"))
            .with_parameter(
                "speed",
                ParameterSpec::number().with_default(1.0).with_range(0.5, 2.0),
            )
            .with_pricing(Pricing::flat(0.02))
            .with_limits(ModelLimits {
                max_input_chars: Some(5000),
                ..ModelLimits::default()
            }),
    ]
}

// =============================================================================
// Model
// =============================================================================

struct FalModel {
    descriptor: ProviderModel,
    capability: ProviderCapability,
    client: Arc<FalClient>,
    timeout: Duration,
}

#[async_trait]
impl Model for FalModel {
    fn descriptor(&self) -> &ProviderModel {
        &self.descriptor
    }

    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn capability(&self) -> ProviderCapability {
        self.capability
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(&self, input: &MediaValue, options: &Options) -> CoreResult<RawMedia> {
        let body = build_body(self.capability, input, options)?;
        let request = self.client.submit(&self.descriptor.id, &body).await?;
        info!(
            "{} request {} submitted for {}",
            LABEL, request.request_id, self.descriptor.id
        );

        let key = current_job().unwrap_or_else(|| request.request_id.clone());
        self.client.track(&key, &request);
        let _guard = InFlightGuard {
            client: &self.client,
            key: key.clone(),
        };

        self.client.wait(&key, &request).await?;
        let result = self.client.result(&request).await?;
        let (url, content_type, metadata) = first_output(&result).ok_or_else(|| {
            CoreError::Internal(format!(
                "{} request {} returned no output file",
                LABEL, request.request_id
            ))
        })?;

        let (data, downloaded_type) = download(&self.client.client, &url).await?;
        let format = format_hint(&url, content_type.or(downloaded_type)).unwrap_or_else(|| {
            match self.capability.output_kind() {
                MediaKind::Video => "mp4",
                MediaKind::Audio => "wav",
                _ => "png",
            }
            .to_string()
        });

        Ok(RawMedia::bytes(data, format).with_metadata(metadata))
    }
}

// =============================================================================
// FalProvider
// =============================================================================

/// Remote provider backed by the FAL queue API
pub struct FalProvider {
    client: Arc<FalClient>,
    models: Vec<Arc<dyn Model>>,
    timeouts: TimeoutSettings,
    jobs: JobTracker,
}

impl std::fmt::Debug for FalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalProvider")
            .field("base_url", &self.client.base_url)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl FalProvider {
    /// Creates a provider; fails without an API key
    pub fn from_config(config: ProviderConfig, timeouts: &TimeoutSettings) -> CoreResult<Self> {
        let api_key = config.require_api_key(LABEL)?.to_string();
        let base_url = config
            .require_base_url(LABEL)
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let client = Arc::new(FalClient {
            client: build_client(Duration::from_secs(config.timeout_sec.max(1)))?,
            probe_client: build_client(Duration::from_millis(timeouts.health_check_ms))?,
            base_url,
            api_key,
            max_retries: config.max_retries,
            poll_interval: Duration::from_millis(timeouts.poll_interval_ms),
            in_flight: Mutex::new(HashMap::new()),
        });
        let generation_timeout = Duration::from_millis(timeouts.generation_ms);

        let models = static_catalog()
            .into_iter()
            .map(|descriptor| {
                let capability = descriptor
                    .capabilities
                    .first()
                    .copied()
                    .unwrap_or(ProviderCapability::TextToImage);
                Arc::new(FalModel {
                    descriptor,
                    capability,
                    client: client.clone(),
                    timeout: generation_timeout,
                }) as Arc<dyn Model>
            })
            .collect();

        Ok(Self {
            client,
            models,
            timeouts: timeouts.clone(),
            jobs: JobTracker::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.client.base_url
    }

    /// Jobs whose queue requests have been submitted and not yet settled
    pub fn in_flight_jobs(&self) -> Vec<JobId> {
        self.client
            .in_flight
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaProvider for FalProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "FAL.ai"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Remote
    }

    fn capabilities(&self) -> Vec<ProviderCapability> {
        vec![
            ProviderCapability::TextToImage,
            ProviderCapability::ImageToVideo,
            ProviderCapability::TextToSpeech,
        ]
    }

    fn models(&self) -> Vec<Arc<dyn Model>> {
        self.models.clone()
    }

    fn configure(&mut self, config: ProviderConfig) -> CoreResult<()> {
        let rebuilt = Self::from_config(config, &self.timeouts)?;
        let jobs = std::mem::take(&mut self.jobs);
        *self = Self { jobs, ..rebuilt };
        Ok(())
    }

    async fn is_available(&self) -> bool {
        // The queue host answers any authenticated request; only transport
        // failures and auth rejections count as unavailable
        let result = self
            .client
            .probe_client
            .get(&self.client.base_url)
            .header(reqwest::header::AUTHORIZATION, self.client.auth_header())
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                status != reqwest::StatusCode::UNAUTHORIZED
                    && status != reqwest::StatusCode::FORBIDDEN
                    && !status.is_server_error()
            }
            Err(e) => {
                warn!("{} health check failed: {}", LABEL, e);
                false
            }
        }
    }

    fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Cancels the queue request behind a running job
    async fn cancel_job(&self, job_id: &str) -> bool {
        let Some(request) = self.client.tracked(job_id) else {
            return false;
        };

        match self.client.cancel(&request).await {
            Ok(()) => {
                info!(
                    "{} request {} for job {} cancelled",
                    LABEL, request.request_id, job_id
                );
                self.jobs
                    .set_external_id(job_id, request.request_id.as_str())
                    .await;
                if let Err(e) = self.jobs.transition(job_id, JobStatus::Cancelled).await {
                    warn!("{} job {}: {}", LABEL, job_id, e);
                }
                self.client.untrack(job_id);
                true
            }
            Err(e) => {
                warn!("{} cancel of {} failed: {}", LABEL, job_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generative::provider_impls::stub_server::{StubResponse, StubServer};
    use crate::core::generative::GenerationRequest;
    use crate::core::media::{Image, ImageFormat, Text};
    use crate::core::options_from;

    fn provider() -> FalProvider {
        FalProvider::from_config(
            ProviderConfig::with_api_key("test-key"),
            &TimeoutSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_api_key() {
        let err = FalProvider::from_config(ProviderConfig::default(), &TimeoutSettings::default())
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");

        let blank = ProviderConfig::with_api_key("   ");
        assert!(FalProvider::from_config(blank, &TimeoutSettings::default()).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("test-key"));
        assert!(debug.contains(DEFAULT_BASE_URL));
    }

    #[test]
    fn test_catalog_pricing() {
        let provider = provider();
        let kling = provider.get_model(KLING_IMAGE_TO_VIDEO).unwrap();

        assert_eq!(kling.cost(&options_from(json!({"duration": 5.0}))), Some(0.15));
        assert_eq!(kling.cost(&options_from(json!({"duration": 10.0}))), Some(0.30));

        let flux = provider.get_model(FLUX_SCHNELL).unwrap();
        assert_eq!(flux.cost(&Options::new()), Some(0.003));
        assert_eq!(flux.currency(), Some("USD"));
        assert!(!flux.descriptor().parameters.contains_key("numImages"));

        let kokoro = provider.get_model(KOKORO).unwrap();
        let resolved = kokoro.descriptor().resolve_options(&Options::new()).unwrap();
        assert_eq!(resolved["speed"], json!(1.0));
    }

    #[test]
    fn test_request_urls_prefer_reported_endpoints() {
        let provider = provider();
        let submit: SubmitResponse = serde_json::from_value(json!({
            "request_id": "abc",
            "status_url": "https://queue.fal.run/fal-ai/flux/requests/abc/status"
        }))
        .unwrap();
        let request = provider.client.request_urls(FLUX_SCHNELL, submit);

        assert_eq!(
            request.status_url,
            "https://queue.fal.run/fal-ai/flux/requests/abc/status"
        );
        assert_eq!(
            request.response_url,
            "https://queue.fal.run/fal-ai/flux/schnell/requests/abc"
        );
        assert_eq!(
            request.cancel_url,
            "https://queue.fal.run/fal-ai/flux/schnell/requests/abc/cancel"
        );
    }

    #[test]
    fn test_build_body() {
        let prompt = MediaValue::from(Text::new("a dragon"));
        let body = build_body(
            ProviderCapability::TextToImage,
            &prompt,
            &options_from(json!({"numImages": 1, "seed": 42})),
        )
        .unwrap();
        assert_eq!(body["prompt"], json!("a dragon"));
        assert_eq!(body["num_images"], json!(1));
        assert_eq!(body["seed"], json!(42));

        // a batch request still yields one image, billed once
        let body = build_body(
            ProviderCapability::TextToImage,
            &prompt,
            &options_from(json!({"numImages": 4})),
        )
        .unwrap();
        assert_eq!(body["num_images"], json!(1));

        let image = MediaValue::from(Image::new(vec![1, 2, 3], ImageFormat::Png));
        let body = build_body(
            ProviderCapability::ImageToVideo,
            &image,
            &options_from(json!({"duration": 10.0})),
        )
        .unwrap();
        assert_eq!(body["duration"], json!("10"));
        assert!(body["image_url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));

        assert!(build_body(ProviderCapability::ImageToVideo, &prompt, &Options::new()).is_err());
    }

    #[test]
    fn test_kling_body_from_defaults() {
        let provider = provider();
        let kling = provider.get_model(KLING_IMAGE_TO_VIDEO).unwrap();
        let resolved = kling.descriptor().resolve_options(&Options::new()).unwrap();
        assert_eq!(resolved["prompt"], Value::Null);

        let image = MediaValue::from(Image::new(vec![1, 2, 3], ImageFormat::Png));
        let body = build_body(ProviderCapability::ImageToVideo, &image, &resolved).unwrap();
        assert_eq!(body["prompt"], json!(""));
        assert_eq!(body["duration"], json!("5"));
        assert_eq!(body["aspect_ratio"], json!("16:9"));
        assert!(body.as_object().unwrap().values().all(|v| !v.is_null()));

        let body = build_body(
            ProviderCapability::ImageToVideo,
            &image,
            &options_from(json!({"prompt": "slow pan"})),
        )
        .unwrap();
        assert_eq!(body["prompt"], json!("slow pan"));
    }

    #[test]
    fn test_first_output_shapes() {
        let images = json!({
            "images": [{"url": "https://cdn/x.jpg", "width": 1024, "height": 768, "content_type": "image/jpeg"}],
            "seed": 7
        });
        let (url, content_type, metadata) = first_output(&images).unwrap();
        assert_eq!(url, "https://cdn/x.jpg");
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(metadata["width"], json!(1024));
        assert_eq!(metadata["seed"], json!(7));

        let video = json!({"video": {"url": "https://cdn/v.mp4"}});
        assert_eq!(first_output(&video).unwrap().0, "https://cdn/v.mp4");

        assert!(first_output(&json!({"nothing": true})).is_none());
    }

    #[test]
    fn test_format_hint() {
        assert_eq!(
            format_hint("https://cdn/a.WAV?sig=1", None).as_deref(),
            Some("wav")
        );
        assert_eq!(
            format_hint("https://cdn/a", Some("video/mp4".to_string())).as_deref(),
            Some("video/mp4")
        );
        assert_eq!(format_hint("https://cdn/noext", None), None);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let provider = provider();
        assert!(provider.in_flight_jobs().is_empty());
        assert!(!provider.cancel_job("missing").await);
    }

    #[tokio::test]
    async fn test_configure_keeps_timeouts_and_jobs() {
        let timeouts = TimeoutSettings {
            health_check_ms: 123,
            generation_ms: 9_000,
            poll_interval_ms: 50,
        };
        let mut provider =
            FalProvider::from_config(ProviderConfig::with_api_key("first"), &timeouts).unwrap();
        let job_id = provider.jobs().create(KOKORO).await;

        provider
            .configure(ProviderConfig::with_api_key("second"))
            .unwrap();

        assert_eq!(provider.timeouts, timeouts);
        assert_eq!(provider.client.api_key, "second");
        assert_eq!(provider.client.poll_interval, Duration::from_millis(50));
        assert_eq!(
            provider.get_model(KOKORO).unwrap().timeout(),
            Duration::from_millis(9_000)
        );
        assert!(provider.jobs().get(&job_id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let server = StubServer::start(vec![
            ("POST", "/fal-ai/kokoro", StubResponse::json(json!({"request_id": "r1"}))),
            (
                "GET",
                "/fal-ai/kokoro/requests/r1/status",
                StubResponse::json(json!({"status": "IN_PROGRESS"})),
            ),
            (
                "PUT",
                "/fal-ai/kokoro/requests/r1/cancel",
                StubResponse::json(json!({"status": "CANCELLATION_REQUESTED"})),
            ),
        ])
        .await;
        let config = ProviderConfig {
            api_key: Some("test-key".to_string()),
            base_url: Some(server.base_url.clone()),
            ..ProviderConfig::default()
        };
        let timeouts = TimeoutSettings {
            poll_interval_ms: 20,
            ..TimeoutSettings::default()
        };
        let provider = Arc::new(FalProvider::from_config(config, &timeouts).unwrap());

        let running = tokio::spawn({
            let provider = provider.clone();
            async move {
                provider
                    .generate(GenerationRequest::new(KOKORO, Text::new("hello there")))
                    .await
            }
        });

        let job_id = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job_id) = provider.in_flight_jobs().pop() {
                    break job_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            provider.get_job_status(&job_id).await.status,
            JobStatus::Running
        );

        assert!(provider.cancel_job(&job_id).await);

        let result = running.await.unwrap();
        assert_eq!(result.job_id, job_id);
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
        assert_eq!(
            provider.get_job_status(&job_id).await.status,
            JobStatus::Cancelled
        );
        assert!(provider.in_flight_jobs().is_empty());
        assert!(server.saw("PUT /fal-ai/kokoro/requests/r1/cancel"));
        let record = provider.jobs().get(&job_id).await.unwrap();
        assert_eq!(record.external_id.as_deref(), Some("r1"));
        assert!(!provider.cancel_job(&job_id).await);
    }
}
