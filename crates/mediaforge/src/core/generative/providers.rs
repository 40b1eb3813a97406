//! Media Providers
//!
//! Provider abstraction over generation backends. A provider owns a catalog
//! of models and a job table; `generate` runs one model and never fails,
//! folding errors into a `Failed` result.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::jobs::{with_current_job, JobStatus, JobTracker};
use super::models::{Model, ModelInput};
use crate::core::media::{MediaKind, MediaSummary, MediaValue};
use crate::core::{CoreError, CoreResult, JobId, ModelId, Options, ProviderId};

// =============================================================================
// Capabilities
// =============================================================================

/// Media transformation categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderCapability {
    TextToText,
    TextToImage,
    TextToSpeech,
    /// Music and sound effects
    TextToAudio,
    TextToVideo,
    ImageToImage,
    ImageToVideo,
    /// Captioning
    ImageToText,
    /// Transcription
    AudioToText,
    AudioToAudio,
    VideoToVideo,
    /// Audio track extraction
    VideoToAudio,
}

impl ProviderCapability {
    pub const ALL: [ProviderCapability; 12] = [
        ProviderCapability::TextToText,
        ProviderCapability::TextToImage,
        ProviderCapability::TextToSpeech,
        ProviderCapability::TextToAudio,
        ProviderCapability::TextToVideo,
        ProviderCapability::ImageToImage,
        ProviderCapability::ImageToVideo,
        ProviderCapability::ImageToText,
        ProviderCapability::AudioToText,
        ProviderCapability::AudioToAudio,
        ProviderCapability::VideoToVideo,
        ProviderCapability::VideoToAudio,
    ];

    pub fn input_kind(&self) -> MediaKind {
        match self {
            ProviderCapability::TextToText
            | ProviderCapability::TextToImage
            | ProviderCapability::TextToSpeech
            | ProviderCapability::TextToAudio
            | ProviderCapability::TextToVideo => MediaKind::Text,
            ProviderCapability::ImageToImage
            | ProviderCapability::ImageToVideo
            | ProviderCapability::ImageToText => MediaKind::Image,
            ProviderCapability::AudioToText | ProviderCapability::AudioToAudio => MediaKind::Audio,
            ProviderCapability::VideoToVideo | ProviderCapability::VideoToAudio => MediaKind::Video,
        }
    }

    pub fn output_kind(&self) -> MediaKind {
        match self {
            ProviderCapability::TextToText
            | ProviderCapability::ImageToText
            | ProviderCapability::AudioToText => MediaKind::Text,
            ProviderCapability::TextToImage | ProviderCapability::ImageToImage => MediaKind::Image,
            ProviderCapability::TextToSpeech
            | ProviderCapability::TextToAudio
            | ProviderCapability::AudioToAudio
            | ProviderCapability::VideoToAudio => MediaKind::Audio,
            ProviderCapability::TextToVideo
            | ProviderCapability::ImageToVideo
            | ProviderCapability::VideoToVideo => MediaKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCapability::TextToText => "text-to-text",
            ProviderCapability::TextToImage => "text-to-image",
            ProviderCapability::TextToSpeech => "text-to-speech",
            ProviderCapability::TextToAudio => "text-to-audio",
            ProviderCapability::TextToVideo => "text-to-video",
            ProviderCapability::ImageToImage => "image-to-image",
            ProviderCapability::ImageToVideo => "image-to-video",
            ProviderCapability::ImageToText => "image-to-text",
            ProviderCapability::AudioToText => "audio-to-text",
            ProviderCapability::AudioToAudio => "audio-to-audio",
            ProviderCapability::VideoToVideo => "video-to-video",
            ProviderCapability::VideoToAudio => "video-to-audio",
        }
    }
}

impl std::fmt::Display for ProviderCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderCapability {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ProviderCapability::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| CoreError::InvalidInput(format!("Unknown capability: {}", s)))
    }
}

/// Where a provider runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// On this machine or a local service
    Local,
    /// Hosted API
    Remote,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Local => write!(f, "local"),
            ProviderType::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Provider Configuration
// =============================================================================

/// Configuration for a provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// API key (if required)
    pub api_key: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_sec: u64,
    /// Maximum retries on transient failures
    pub max_retries: u32,
    /// Additional provider-specific settings
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_sec: 60,
            max_retries: 3,
            settings: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout_sec", &self.timeout_sec)
            .field("max_retries", &self.max_retries)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ProviderConfig {
    /// Creates a new config with API key
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// Creates a new config pointing at a service URL
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }

    /// Sets a custom setting
    pub fn with_setting<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.settings.insert(key.into(), v);
        }
        self
    }

    /// Gets a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Non-empty API key, or a `Configuration` error naming the provider
    pub fn require_api_key(&self, provider: &str) -> CoreResult<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::Configuration(format!("{} requires an API key", provider)))
    }

    /// Non-empty base URL without a trailing slash, or a `Configuration` error
    pub fn require_base_url(&self, provider: &str) -> CoreResult<String> {
        self.base_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CoreError::Configuration(format!("{} requires a base URL", provider)))
    }
}

// =============================================================================
// Requests / Results
// =============================================================================

/// A generation request against one model
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model_id: ModelId,
    pub input: ModelInput,
    pub options: Options,
}

impl GenerationRequest {
    pub fn new(model_id: impl Into<ModelId>, input: impl Into<ModelInput>) -> Self {
        Self {
            model_id: model_id.into(),
            input: input.into(),
            options: Options::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Outcome of [`MediaProvider::generate`]
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub job_id: JobId,
    pub provider_id: ProviderId,
    pub model_id: ModelId,
    pub status: JobStatus,
    pub outputs: Vec<MediaValue>,
    /// Backend-reported progress for jobs still in flight, 0 to 100
    pub progress: Option<f64>,
    pub cost: Option<f64>,
    pub currency: Option<String>,
    pub error: Option<String>,
    /// [`CoreError::kind`] of the failure
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GenerationResult {
    /// A result that ended in `error`; cancellations get the `Cancelled` status
    pub fn from_error(
        job_id: JobId,
        provider_id: &str,
        model_id: &str,
        error: &CoreError,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = match error {
            CoreError::Cancelled(_) => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        Self {
            job_id,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            status,
            outputs: Vec::new(),
            progress: None,
            cost: None,
            currency: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Status lookup for an id this provider has never seen (or has evicted)
    pub fn not_found(provider_id: &str, job_id: &str) -> Self {
        let now = Utc::now();
        Self::from_error(
            job_id.to_string(),
            provider_id,
            "",
            &CoreError::JobNotFound(job_id.to_string()),
            now,
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn output(&self) -> Option<&MediaValue> {
        self.outputs.first()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            job_id: self.job_id.clone(),
            provider_id: self.provider_id.clone(),
            model_id: self.model_id.clone(),
            status: self.status,
            outputs: self.outputs.iter().map(MediaValue::summary).collect(),
            progress: self.progress,
            cost: self.cost,
            currency: self.currency.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind.clone(),
            duration_ms: self.duration_ms(),
        }
    }
}

/// Serializable view of a [`GenerationResult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub job_id: JobId,
    pub provider_id: ProviderId,
    pub model_id: ModelId,
    pub status: JobStatus,
    pub outputs: Vec<MediaSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub duration_ms: i64,
}

/// Provider health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub provider_id: ProviderId,
    pub status: HealthStatus,
    pub uptime_sec: u64,
    pub active_jobs: usize,
    pub queued_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Trait for media generation providers
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Stable identifier, unique within a registry
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// Declared capabilities
    fn capabilities(&self) -> Vec<ProviderCapability>;

    fn supports(&self, capability: ProviderCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Current model catalog
    fn models(&self) -> Vec<Arc<dyn Model>>;

    fn get_models_for_capability(&self, capability: ProviderCapability) -> Vec<Arc<dyn Model>> {
        self.models()
            .into_iter()
            .filter(|m| m.descriptor().supports(capability))
            .collect()
    }

    fn get_model(&self, model_id: &str) -> CoreResult<Arc<dyn Model>> {
        self.models()
            .into_iter()
            .find(|m| m.descriptor().id == model_id)
            .ok_or_else(|| CoreError::ModelNotFound {
                provider_id: self.id().to_string(),
                model_id: model_id.to_string(),
            })
    }

    /// Resolves the request's model; no backend call is made
    fn validate_request(&self, request: &GenerationRequest) -> CoreResult<Arc<dyn Model>> {
        self.get_model(&request.model_id)
    }

    /// Binds credentials and endpoints; calling again rebinds
    fn configure(&mut self, config: ProviderConfig) -> CoreResult<()>;

    /// Lightweight reachability probe; failures read as `false`
    async fn is_available(&self) -> bool;

    fn jobs(&self) -> &JobTracker;

    /// Runs one model invocation and records it as a job.
    ///
    /// The model runs with the job id in scope (see
    /// [`current_job`](super::jobs::current_job)) so queue-backed models can
    /// tie backend requests to it for cancellation.
    async fn generate(&self, request: GenerationRequest) -> GenerationResult {
        let started_at = Utc::now();
        let job_id = self.jobs().create(&request.model_id).await;

        let outcome = match self.validate_request(&request) {
            Ok(model) => {
                if let Err(e) = self.jobs().transition(&job_id, JobStatus::Running).await {
                    warn!("Job {} on {}: {}", job_id, self.id(), e);
                }
                info!("Generation {} started on {}/{}", job_id, self.id(), request.model_id);
                with_current_job(
                    job_id.clone(),
                    model.transform(request.input.clone(), &request.options),
                )
                .await
                .map(|output| (model, output))
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok((model, output)) => {
                let cost = output.lineage().and_then(|l| model.cost(l.options()));
                info!("Generation {} completed: {}", job_id, output);
                GenerationResult {
                    job_id: job_id.clone(),
                    provider_id: self.id().to_string(),
                    model_id: request.model_id.clone(),
                    status: JobStatus::Completed,
                    outputs: vec![output],
                    progress: None,
                    cost,
                    currency: model.currency().map(str::to_string),
                    error: None,
                    error_kind: None,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
            Err(e) => {
                // a backend that noticed the cancel may still report a plain failure
                let e = match self.jobs().status(&job_id).await {
                    Some(JobStatus::Cancelled) if !matches!(e, CoreError::Cancelled(_)) => {
                        CoreError::Cancelled(format!("job {} was cancelled: {}", job_id, e))
                    }
                    _ => e,
                };
                match &e {
                    CoreError::Cancelled(_) => info!("Generation {} cancelled", job_id),
                    _ => warn!(
                        "Generation {} on {}/{} failed: {}",
                        job_id,
                        self.id(),
                        request.model_id,
                        e
                    ),
                }
                GenerationResult::from_error(
                    job_id.clone(),
                    self.id(),
                    &request.model_id,
                    &e,
                    started_at,
                )
            }
        };

        if let Err(e) = self.jobs().finish(&result).await {
            warn!("Job {} on {}: {}", job_id, self.id(), e);
        }
        result
    }

    /// Result of a previously seen job: the final result once it settled,
    /// otherwise a snapshot with the current status. Unknown ids yield a
    /// `Failed` result with `error_kind = "not_found"`.
    async fn get_job_status(&self, job_id: &str) -> GenerationResult {
        match self.jobs().get(job_id).await {
            Some(record) => record.to_result(self.id()),
            None => GenerationResult::not_found(self.id(), job_id),
        }
    }

    /// Best-effort cancellation; `false` when the job cannot be cancelled
    async fn cancel_job(&self, _job_id: &str) -> bool {
        false
    }

    async fn get_health(&self) -> HealthReport {
        let available = self.is_available().await;
        HealthReport {
            provider_id: self.id().to_string(),
            status: if available {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            uptime_sec: self.jobs().uptime().as_secs(),
            active_jobs: self.jobs().active_count().await,
            queued_jobs: self.jobs().queued_count().await,
            message: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_serialization() {
        assert_eq!(
            serde_json::to_string(&ProviderCapability::TextToImage).unwrap(),
            "\"text-to-image\""
        );
        assert_eq!(
            serde_json::from_str::<ProviderCapability>("\"video-to-audio\"").unwrap(),
            ProviderCapability::VideoToAudio
        );
    }

    #[test]
    fn test_capability_from_str_accepts_snake_case() {
        assert_eq!(
            "text_to_speech".parse::<ProviderCapability>().unwrap(),
            ProviderCapability::TextToSpeech
        );
        assert!("text-to-smell".parse::<ProviderCapability>().is_err());
    }

    #[test]
    fn test_capability_kinds() {
        for cap in ProviderCapability::ALL {
            let name = cap.to_string();
            let (from, to) = name.split_once("-to-").unwrap();
            let from: MediaKind = from.parse().unwrap();
            assert_eq!(cap.input_kind(), from);
            if to != "speech" {
                assert_eq!(cap.output_kind(), to.parse::<MediaKind>().unwrap());
            }
        }
        assert_eq!(ProviderCapability::TextToSpeech.output_kind(), MediaKind::Audio);
    }

    #[test]
    fn test_config_default() {
        let config = ProviderConfig::default();
        assert!(config.api_key.is_none());
        assert_eq!(config.timeout_sec, 60);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = ProviderConfig::with_api_key("sk-secret").with_setting("region", "eu");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert_eq!(config.get_setting::<String>("region"), Some("eu".to_string()));
    }

    #[test]
    fn test_config_requirements() {
        let config = ProviderConfig::with_base_url("http://localhost:8000/");
        assert_eq!(config.require_base_url("hf").unwrap(), "http://localhost:8000");
        assert!(matches!(
            config.require_api_key("fal"),
            Err(CoreError::Configuration(_))
        ));
        assert!(ProviderConfig::with_api_key("  ").require_api_key("fal").is_err());
    }
}
