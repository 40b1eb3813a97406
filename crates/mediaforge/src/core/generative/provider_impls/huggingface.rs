//! HuggingFace Local Service Provider
//!
//! Adapter for the Docker-hosted HuggingFace inference service. The service
//! loads models on demand and returns results as base64 payloads.
//!
//! Endpoints:
//! - `GET /health`, `GET /models` (catalog discovery)
//! - `POST /generate` (text-to-image, PNG)
//! - `POST /generate/audio` (text-to-speech)

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::http::{build_client, execute_with_retry, network_error, parse_api_error};
use crate::core::generative::jobs::JobTracker;
use crate::core::generative::models::{Model, ParameterSpec, ProviderModel};
use crate::core::generative::providers::{
    MediaProvider, ProviderCapability, ProviderConfig, ProviderType,
};
use crate::core::media::{MediaValue, RawMedia};
use crate::core::settings::TimeoutSettings;
use crate::core::{CoreError, CoreResult, Options};

// =============================================================================
// Constants
// =============================================================================

/// Default URL of the local service
pub const DEFAULT_BASE_URL: &str = "http://localhost:8007";

const PROVIDER_ID: &str = "huggingface";

const LABEL: &str = "HuggingFace";

// =============================================================================
// API Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest<'a> {
    model_id: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    width: u64,
    height: u64,
    num_inference_steps: u64,
    guidance_scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduler: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioRequest<'a> {
    model_id: &'a str,
    prompt: &'a str,
    voice: &'a str,
    speed: f64,
    pitch: f64,
    volume: f64,
    sample_rate: u64,
    format: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationResponse {
    success: bool,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    audio_base64: Option<String>,
    #[serde(default)]
    metadata: Options,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    #[serde(default)]
    loaded_models: Vec<String>,
}

/// Model entry reported by `GET /models`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceModelInfo {
    pub model_id: String,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// =============================================================================
// Client
// =============================================================================

/// HTTP client for the local service, shared by the provider and its models
struct HfClient {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl HfClient {
    fn new(config: &ProviderConfig, timeouts: &TimeoutSettings) -> CoreResult<Self> {
        let base_url = config
            .require_base_url(LABEL)
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_sec.max(1)))?,
            probe_client: build_client(Duration::from_millis(timeouts.health_check_ms))?,
            base_url,
            max_retries: config.max_retries,
        })
    }

    async fn health(&self) -> CoreResult<HealthResponse> {
        let response = self
            .probe_client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(parse_api_error(LABEL, status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn list_models(&self) -> CoreResult<Vec<ServiceModelInfo>> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(parse_api_error(LABEL, status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_generation<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> CoreResult<GenerationResponse> {
        let url = format!("{}{}", self.base_url, path);
        execute_with_retry(
            LABEL,
            path,
            self.max_retries,
            Duration::from_millis(super::http::BASE_RETRY_DELAY_MS),
            || async {
                let response = self
                    .client
                    .post(&url)
                    .json(body)
                    .send()
                    .await
                    .map_err(network_error)?;
                let status = response.status();
                let text = response.text().await.map_err(network_error)?;
                if !status.is_success() {
                    return Err(parse_api_error(LABEL, status, &text));
                }
                let parsed: GenerationResponse = serde_json::from_str(&text)?;
                if !parsed.success {
                    return Err(CoreError::Internal(format!(
                        "{} generation failed: {}",
                        LABEL,
                        parsed.error.as_deref().unwrap_or("unknown error")
                    )));
                }
                Ok(parsed)
            },
        )
        .await
    }
}

fn decode_base64(payload: Option<String>, what: &str) -> CoreResult<Vec<u8>> {
    let encoded = payload.ok_or_else(|| {
        CoreError::Internal(format!("{} response is missing {}", LABEL, what))
    })?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| CoreError::Internal(format!("Invalid base64 {}: {}", what, e)))
}

// =============================================================================
// Catalog
// =============================================================================

fn image_descriptor(id: &str, name: &str) -> ProviderModel {
    ProviderModel::new(id, name, vec![ProviderCapability::TextToImage])
        .with_description("Diffusion model served by the local HuggingFace service")
        .with_parameter("width", ParameterSpec::integer().with_default(512).with_range(64.0, 2048.0))
        .with_parameter("height", ParameterSpec::integer().with_default(512).with_range(64.0, 2048.0))
        .with_parameter(
            "numInferenceSteps",
            ParameterSpec::integer().with_default(20).with_range(1.0, 150.0),
        )
        .with_parameter(
            "guidanceScale",
            ParameterSpec::number().with_default(7.5).with_range(0.0, 30.0),
        )
        .with_parameter("negativePrompt", ParameterSpec::string())
        .with_parameter("scheduler", ParameterSpec::string())
        .with_parameter("seed", ParameterSpec::seed())
}

fn audio_descriptor(id: &str, name: &str, capabilities: Vec<ProviderCapability>) -> ProviderModel {
    ProviderModel::new(id, name, capabilities)
        .with_description("Speech model served by the local HuggingFace service")
        .with_parameter("voice", ParameterSpec::string().with_default("default"))
        .with_parameter("speed", ParameterSpec::number().with_default(1.0).with_range(0.5, 2.0))
        .with_parameter("pitch", ParameterSpec::number().with_default(0.0).with_range(-1.0, 1.0))
        .with_parameter("volume", ParameterSpec::number().with_default(1.0).with_range(0.0, 1.0))
        .with_parameter(
            "sampleRate",
            ParameterSpec::integer().with_default(22050).with_range(8000.0, 48000.0),
        )
        .with_parameter(
            "format",
            ParameterSpec::enumeration(["wav", "mp3", "flac", "ogg"]).with_default("wav"),
        )
        .with_parameter("language", ParameterSpec::string().with_default("en"))
        .with_parameter("seed", ParameterSpec::seed())
}

fn static_catalog() -> Vec<ProviderModel> {
    vec![
        image_descriptor("sd15", "Stable Diffusion 1.5"),
        image_descriptor("sdxl", "Stable Diffusion XL"),
        image_descriptor("flux-schnell", "FLUX.1 schnell"),
        audio_descriptor(
            "hexgrad/Kokoro-82M",
            "Kokoro 82M",
            vec![ProviderCapability::TextToSpeech],
        ),
    ]
}

/// Descriptor for a model reported by the service; unknown capabilities
/// are ignored and a model with none left is skipped
fn descriptor_for(info: &ServiceModelInfo) -> Option<ProviderModel> {
    let capabilities: Vec<ProviderCapability> = info
        .capabilities
        .iter()
        .filter_map(|c| c.parse().ok())
        .filter(|c| {
            matches!(
                c,
                ProviderCapability::TextToImage
                    | ProviderCapability::TextToSpeech
                    | ProviderCapability::TextToAudio
            )
        })
        .collect();

    if capabilities.contains(&ProviderCapability::TextToImage) {
        Some(image_descriptor(&info.model_id, &info.model_id))
    } else if capabilities.is_empty() {
        None
    } else {
        Some(audio_descriptor(&info.model_id, &info.model_id, capabilities))
    }
}

// =============================================================================
// Model
// =============================================================================

struct HfModel {
    descriptor: ProviderModel,
    capability: ProviderCapability,
    client: Arc<HfClient>,
    timeout: Duration,
}

impl HfModel {
    fn new(descriptor: ProviderModel, client: Arc<HfClient>, timeout: Duration) -> Self {
        let capability = descriptor
            .capabilities
            .first()
            .copied()
            .unwrap_or(ProviderCapability::TextToImage);
        Self {
            descriptor,
            capability,
            client,
            timeout,
        }
    }

    async fn generate_image(&self, prompt: &str, options: &Options) -> CoreResult<RawMedia> {
        let request = ImageRequest {
            model_id: &self.descriptor.id,
            prompt,
            negative_prompt: options.get("negativePrompt").and_then(Value::as_str),
            width: opt_u64(options, "width", 512),
            height: opt_u64(options, "height", 512),
            num_inference_steps: opt_u64(options, "numInferenceSteps", 20),
            guidance_scale: opt_f64(options, "guidanceScale", 7.5),
            seed: options.get("seed").and_then(Value::as_u64),
            scheduler: options.get("scheduler").and_then(Value::as_str),
        };
        debug!("{} image request: {}x{}", LABEL, request.width, request.height);

        let response = self.client.post_generation("/generate", &request).await?;
        let data = decode_base64(response.image_base64, "imageBase64")?;

        let mut metadata = response.metadata;
        metadata.insert("width".to_string(), json!(request.width));
        metadata.insert("height".to_string(), json!(request.height));
        Ok(RawMedia::bytes(data, "png").with_metadata(metadata))
    }

    async fn generate_audio(&self, prompt: &str, options: &Options) -> CoreResult<RawMedia> {
        let request = AudioRequest {
            model_id: &self.descriptor.id,
            prompt,
            voice: opt_str(options, "voice", "default"),
            speed: opt_f64(options, "speed", 1.0),
            pitch: opt_f64(options, "pitch", 0.0),
            volume: opt_f64(options, "volume", 1.0),
            sample_rate: opt_u64(options, "sampleRate", 22050),
            format: opt_str(options, "format", "wav"),
            language: opt_str(options, "language", "en"),
            seed: options.get("seed").and_then(Value::as_u64),
        };

        let response = self.client.post_generation("/generate/audio", &request).await?;
        let data = decode_base64(response.audio_base64, "audioBase64")?;

        let mut metadata = response.metadata;
        metadata
            .entry("sampleRate")
            .or_insert_with(|| json!(request.sample_rate));
        Ok(RawMedia::bytes(data, request.format).with_metadata(metadata))
    }
}

fn opt_u64(options: &Options, key: &str, default: u64) -> u64 {
    options.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn opt_f64(options: &Options, key: &str, default: f64) -> f64 {
    options.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn opt_str<'a>(options: &'a Options, key: &str, default: &'a str) -> &'a str {
    options.get(key).and_then(Value::as_str).unwrap_or(default)
}

#[async_trait]
impl Model for HfModel {
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
        let prompt = input
            .as_text()
            .map(|t| t.content())
            .ok_or_else(|| CoreError::InvalidInput("Prompt must be text".to_string()))?;

        match self.capability {
            ProviderCapability::TextToImage => self.generate_image(prompt, options).await,
            _ => self.generate_audio(prompt, options).await,
        }
    }
}

// =============================================================================
// HuggingFaceProvider
// =============================================================================

/// Provider backed by the local HuggingFace service
pub struct HuggingFaceProvider {
    client: Arc<HfClient>,
    timeouts: TimeoutSettings,
    models: RwLock<Vec<Arc<dyn Model>>>,
    jobs: JobTracker,
}

impl std::fmt::Debug for HuggingFaceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HuggingFaceProvider")
            .field("base_url", &self.client.base_url)
            .finish_non_exhaustive()
    }
}

impl HuggingFaceProvider {
    /// Creates a provider with the static catalog; the base URL defaults to
    /// [`DEFAULT_BASE_URL`]
    pub fn from_config(config: ProviderConfig, timeouts: &TimeoutSettings) -> CoreResult<Self> {
        let client = Arc::new(HfClient::new(&config, timeouts)?);
        let generation_timeout = Duration::from_millis(timeouts.generation_ms);
        let models = Self::build_models(static_catalog(), &client, generation_timeout);

        Ok(Self {
            client,
            timeouts: timeouts.clone(),
            models: RwLock::new(models),
            jobs: JobTracker::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.client.base_url
    }

    fn build_models(
        descriptors: Vec<ProviderModel>,
        client: &Arc<HfClient>,
        timeout: Duration,
    ) -> Vec<Arc<dyn Model>> {
        descriptors
            .into_iter()
            .map(|d| Arc::new(HfModel::new(d, client.clone(), timeout)) as Arc<dyn Model>)
            .collect()
    }

    /// Merges the service's model list into the catalog.
    ///
    /// Reported models replace static entries with the same id. Returns the
    /// number of models reported by the service.
    pub async fn discover_models(&self) -> CoreResult<usize> {
        let reported = self.client.list_models().await?;
        let discovered: Vec<ProviderModel> = reported.iter().filter_map(descriptor_for).collect();
        let count = discovered.len();

        let mut descriptors = static_catalog();
        for descriptor in discovered {
            match descriptors.iter_mut().find(|d| d.id == descriptor.id) {
                Some(existing) => *existing = descriptor,
                None => descriptors.push(descriptor),
            }
        }

        let timeout = Duration::from_millis(self.timeouts.generation_ms);
        let models = Self::build_models(descriptors, &self.client, timeout);
        let total = models.len();
        match self.models.write() {
            Ok(mut guard) => *guard = models,
            Err(poisoned) => *poisoned.into_inner() = models,
        }

        info!("{} discovery: {} reported, {} in catalog", LABEL, count, total);
        Ok(count)
    }
}

#[async_trait]
impl MediaProvider for HuggingFaceProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "HuggingFace (local)"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn capabilities(&self) -> Vec<ProviderCapability> {
        vec![
            ProviderCapability::TextToImage,
            ProviderCapability::TextToSpeech,
            ProviderCapability::TextToAudio,
        ]
    }

    fn models(&self) -> Vec<Arc<dyn Model>> {
        match self.models.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn configure(&mut self, config: ProviderConfig) -> CoreResult<()> {
        let rebuilt = Self::from_config(config, &self.timeouts)?;
        let jobs = std::mem::take(&mut self.jobs);
        *self = Self { jobs, ..rebuilt };
        Ok(())
    }

    async fn is_available(&self) -> bool {
        match self.client.health().await {
            Ok(health) => {
                debug!(
                    "{} health: {} ({} models loaded)",
                    LABEL,
                    health.status,
                    health.loaded_models.len()
                );
                health.status == "healthy"
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options_from;

    fn provider() -> HuggingFaceProvider {
        HuggingFaceProvider::from_config(
            ProviderConfig::with_base_url("http://127.0.0.1:1/"),
            &TimeoutSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_static_catalog() {
        let provider = provider();
        assert_eq!(provider.base_url(), "http://127.0.0.1:1");
        assert_eq!(provider.provider_type(), ProviderType::Local);
        assert_eq!(
            provider
                .get_models_for_capability(ProviderCapability::TextToImage)
                .len(),
            3
        );
        assert!(provider.get_model("hexgrad/Kokoro-82M").is_ok());
    }

    #[test]
    fn test_default_base_url() {
        let provider =
            HuggingFaceProvider::from_config(ProviderConfig::default(), &TimeoutSettings::default())
                .unwrap();
        assert_eq!(provider.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_audio_defaults_follow_service() {
        let provider = provider();
        let model = provider.get_model("hexgrad/Kokoro-82M").unwrap();
        let resolved = model.descriptor().resolve_options(&Options::new()).unwrap();

        assert_eq!(resolved["speed"], json!(1.0));
        assert_eq!(resolved["pitch"], json!(0.0));
        assert_eq!(resolved["volume"], json!(1.0));
        assert_eq!(resolved["sampleRate"], json!(22050));
        assert_eq!(resolved["format"], json!("wav"));
        assert_eq!(resolved["language"], json!("en"));

        let too_fast = options_from(json!({"speed": 2.5}));
        assert!(model.descriptor().resolve_options(&too_fast).is_err());
    }

    #[test]
    fn test_descriptor_for_reported_models() {
        let audio: ServiceModelInfo = serde_json::from_value(json!({
            "modelId": "facebook/mms-tts-eng",
            "loaded": true,
            "capabilities": ["text-to-audio", "text-to-speech"]
        }))
        .unwrap();
        let descriptor = descriptor_for(&audio).unwrap();
        assert!(descriptor.supports(ProviderCapability::TextToSpeech));
        assert!(!descriptor.supports(ProviderCapability::TextToImage));

        let unknown: ServiceModelInfo = serde_json::from_value(json!({
            "modelId": "x",
            "capabilities": ["image-to-3d"]
        }))
        .unwrap();
        assert!(descriptor_for(&unknown).is_none());
    }

    #[test]
    fn test_decode_base64() {
        assert_eq!(decode_base64(Some("aGk=".to_string()), "x").unwrap(), b"hi");
        assert!(decode_base64(None, "x").is_err());
        assert!(decode_base64(Some("***".to_string()), "x").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        assert!(!provider().is_available().await);
    }

    #[tokio::test]
    async fn test_configure_keeps_timeouts_and_jobs() {
        let timeouts = TimeoutSettings {
            health_check_ms: 250,
            generation_ms: 42_000,
            poll_interval_ms: 500,
        };
        let mut provider =
            HuggingFaceProvider::from_config(ProviderConfig::default(), &timeouts).unwrap();
        let job_id = provider.jobs().create("hexgrad/Kokoro-82M").await;

        provider
            .configure(ProviderConfig::with_base_url("http://127.0.0.1:9"))
            .unwrap();

        assert_eq!(provider.base_url(), "http://127.0.0.1:9");
        assert_eq!(provider.timeouts, timeouts);
        assert_eq!(
            provider.get_model("hexgrad/Kokoro-82M").unwrap().timeout(),
            Duration::from_millis(42_000)
        );
        assert!(provider.jobs().get(&job_id).await.is_some());
    }
}
