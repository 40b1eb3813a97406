//! Chatterbox TTS Provider
//!
//! Adapter for the local Chatterbox text-to-speech service. Synthesis runs as
//! a background task on the service: the text is submitted, the task is
//! polled until it settles, and the finished audio is downloaded.
//!
//! Endpoints:
//! - `GET /health`
//! - `POST /tts/async`, `GET /tts/status/{id}`, `GET /tts/result/{id}`
//! - `DELETE /tts/task/{id}` (cancellation and cleanup)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::http::{
    build_client, download, execute_with_retry, network_error, parse_api_error, to_snake_case,
    BASE_RETRY_DELAY_MS,
};
use crate::core::generative::jobs::{current_job, JobStatus, JobTracker};
use crate::core::JobId;
use crate::core::generative::models::{Model, ModelLimits, ParameterSpec, ProviderModel};
use crate::core::generative::providers::{
    GenerationResult, MediaProvider, ProviderCapability, ProviderConfig, ProviderType,
};
use crate::core::media::{MediaValue, RawMedia};
use crate::core::settings::TimeoutSettings;
use crate::core::{CoreError, CoreResult, Options};

// =============================================================================
// Constants
// =============================================================================

/// Default URL of the local service
pub const DEFAULT_BASE_URL: &str = "http://localhost:8004";

const PROVIDER_ID: &str = "chatterbox";

const LABEL: &str = "Chatterbox";

pub const CHATTERBOX_TTS: &str = "chatterbox-tts";

// =============================================================================
// API Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

/// Task state reported by `GET /tts/status/{id}`
#[derive(Debug, Clone, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    total_chunks: Option<u64>,
    #[serde(default)]
    completed_chunks: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    model_loaded: Option<bool>,
}

// =============================================================================
// Client
// =============================================================================

struct ChatterboxClient {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    poll_interval: Duration,
    /// Service task ids of unsettled syntheses, by job id
    in_flight: Mutex<HashMap<JobId, String>>,
}

impl ChatterboxClient {
    fn new(config: &ProviderConfig, timeouts: &TimeoutSettings) -> CoreResult<Self> {
        let base_url = config
            .require_base_url(LABEL)
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_sec.max(1)))?,
            probe_client: build_client(Duration::from_millis(timeouts.health_check_ms))?,
            base_url,
            max_retries: config.max_retries,
            poll_interval: Duration::from_millis(timeouts.poll_interval_ms),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> CoreResult<Value> {
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(parse_api_error(LABEL, status, &body));
        }
        serde_json::from_str(&body).map_err(|e| {
            CoreError::Internal(format!("Failed to parse {} response: {}", LABEL, e))
        })
    }

    async fn health(&self) -> CoreResult<HealthResponse> {
        let url = format!("{}/health", self.base_url);
        let value = self.send_json(self.probe_client.get(&url)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn submit(&self, body: &Value) -> CoreResult<String> {
        let url = format!("{}/tts/async", self.base_url);
        let value = execute_with_retry(
            LABEL,
            "submit",
            self.max_retries,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            || self.send_json(self.client.post(&url).json(body)),
        )
        .await?;
        let submit: SubmitResponse = serde_json::from_value(value)?;
        Ok(submit.task_id)
    }

    async fn status(&self, task_id: &str) -> CoreResult<TaskStatus> {
        let url = format!("{}/tts/status/{}", self.base_url, task_id);
        let value = execute_with_retry(
            LABEL,
            "poll",
            self.max_retries,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            || self.send_json(self.client.get(&url)),
        )
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch(&self, task_id: &str) -> CoreResult<(Vec<u8>, Option<String>)> {
        download(
            &self.client,
            &format!("{}/tts/result/{}", self.base_url, task_id),
        )
        .await
    }

    /// Cancels a running task, or frees a finished one on the service
    async fn delete(&self, task_id: &str) -> CoreResult<()> {
        let url = format!("{}/tts/task/{}", self.base_url, task_id);
        self.send_json(self.client.delete(&url)).await?;
        Ok(())
    }

    /// Polls until the task completes; the caller's timeout bounds the wait
    async fn wait(&self, key: &str, task_id: &str) -> CoreResult<()> {
        loop {
            if self.tracked(key).is_none() {
                return Err(CoreError::Cancelled(format!(
                    "{} task {} was cancelled",
                    LABEL, task_id
                )));
            }
            let task = self.status(task_id).await?;
            debug!(
                "{} task {}: status={} progress={:.0}% chunks={:?}/{:?}",
                LABEL,
                task_id,
                task.status,
                task.progress,
                task.completed_chunks,
                task.total_chunks
            );
            match task.status.as_str() {
                "completed" => return Ok(()),
                "queued" | "processing" => tokio::time::sleep(self.poll_interval).await,
                "cancelled" => {
                    return Err(CoreError::Cancelled(format!(
                        "{} task {} was cancelled by the service",
                        LABEL, task_id
                    )))
                }
                "failed" => {
                    return Err(CoreError::Internal(format!(
                        "{} task {} failed: {}",
                        LABEL,
                        task_id,
                        task.error_message.as_deref().unwrap_or("unknown error")
                    )))
                }
                other => {
                    return Err(CoreError::Internal(format!(
                        "{} task {} ended with status {}",
                        LABEL, task_id, other
                    )))
                }
            }
        }
    }

    fn track(&self, key: &str, task_id: &str) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.insert(key.to_string(), task_id.to_string());
        }
    }

    fn untrack(&self, key: &str) -> Option<String> {
        self.in_flight.lock().ok().and_then(|mut map| map.remove(key))
    }

    fn tracked(&self, key: &str) -> Option<String> {
        self.in_flight.lock().ok().and_then(|map| map.get(key).cloned())
    }
}

struct TaskGuard<'a> {
    client: &'a ChatterboxClient,
    key: String,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.client.untrack(&self.key);
    }
}

// =============================================================================
// Request building
// =============================================================================

/// `CustomTTSRequest` body; unset options are left to the service defaults
fn build_body(text: &str, options: &Options) -> CoreResult<Value> {
    let mut body = serde_json::Map::new();
    for (key, value) in options.iter().filter(|(_, v)| !v.is_null()) {
        body.insert(to_snake_case(key), value.clone());
    }
    body.insert("text".to_string(), json!(text));

    let cloning = body.get("voice_mode").and_then(Value::as_str) == Some("clone");
    if cloning {
        let has_reference = body
            .get("reference_audio_filename")
            .and_then(Value::as_str)
            .is_some_and(|f| !f.trim().is_empty());
        if !has_reference {
            return Err(CoreError::InvalidInput(
                "Voice cloning requires referenceAudioFilename".to_string(),
            ));
        }
        body.remove("predefined_voice_id");
    }

    Ok(Value::Object(body))
}

// =============================================================================
// Catalog
// =============================================================================

fn static_catalog() -> Vec<ProviderModel> {
    vec![ProviderModel::new(
        CHATTERBOX_TTS,
        "Chatterbox TTS",
        vec![ProviderCapability::TextToSpeech],
    )
    .with_description("Local expressive text-to-speech with voice cloning")
    .with_parameter(
        "voiceMode",
        ParameterSpec::enumeration(["predefined", "clone"]).with_default("predefined"),
    )
    .with_parameter(
        "predefinedVoiceId",
        ParameterSpec::string().with_default("Emily.wav"),
    )
    .with_parameter(
        "referenceAudioFilename",
        ParameterSpec::string().with_description("Uploaded reference clip for cloning"),
    )
    .with_parameter(
        "outputFormat",
        ParameterSpec::enumeration(["wav", "opus", "mp3"]).with_default("wav"),
    )
    .with_parameter("splitText", ParameterSpec::boolean().with_default(true))
    .with_parameter(
        "chunkSize",
        ParameterSpec::integer()
            .with_default(120)
            .with_range(50.0, 500.0),
    )
    .with_parameter("temperature", ParameterSpec::number().with_range(0.0, 1.5))
    .with_parameter("exaggeration", ParameterSpec::number().with_range(0.25, 2.0))
    .with_parameter("cfgWeight", ParameterSpec::number().with_range(0.2, 1.0))
    .with_parameter("speedFactor", ParameterSpec::number().with_range(0.25, 4.0))
    .with_parameter("language", ParameterSpec::string())
    .with_parameter("seed", ParameterSpec::seed())
    .with_limits(ModelLimits {
        max_input_chars: Some(10_000),
        ..ModelLimits::default()
    })]
}

// =============================================================================
// Model
// =============================================================================

struct ChatterboxModel {
    descriptor: ProviderModel,
    client: Arc<ChatterboxClient>,
    timeout: Duration,
}

#[async_trait]
impl Model for ChatterboxModel {
    fn descriptor(&self) -> &ProviderModel {
        &self.descriptor
    }

    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn capability(&self) -> ProviderCapability {
        ProviderCapability::TextToSpeech
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(&self, input: &MediaValue, options: &Options) -> CoreResult<RawMedia> {
        let text = input
            .as_text()
            .map(|t| t.content())
            .ok_or_else(|| CoreError::InvalidInput("Speech input must be text".to_string()))?;
        let body = build_body(text, options)?;

        let task_id = self.client.submit(&body).await?;
        info!("{} task {} submitted", LABEL, task_id);

        let key = current_job().unwrap_or_else(|| task_id.clone());
        self.client.track(&key, &task_id);
        let _guard = TaskGuard {
            client: &self.client,
            key: key.clone(),
        };

        self.client.wait(&key, &task_id).await?;
        let (data, content_type) = self.client.fetch(&task_id).await?;
        if let Err(e) = self.client.delete(&task_id).await {
            debug!("{} cleanup of task {} failed: {}", LABEL, task_id, e);
        }

        let format = content_type
            .filter(|c| c.starts_with("audio/"))
            .or_else(|| {
                options
                    .get("outputFormat")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "wav".to_string());
        let mut metadata = Options::new();
        metadata.insert("taskId".to_string(), json!(task_id));

        Ok(RawMedia::bytes(data, format).with_metadata(metadata))
    }
}

// =============================================================================
// ChatterboxProvider
// =============================================================================

/// Provider backed by the local Chatterbox TTS service
pub struct ChatterboxProvider {
    client: Arc<ChatterboxClient>,
    models: Vec<Arc<dyn Model>>,
    timeouts: TimeoutSettings,
    jobs: JobTracker,
}

impl std::fmt::Debug for ChatterboxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatterboxProvider")
            .field("base_url", &self.client.base_url)
            .finish_non_exhaustive()
    }
}

impl ChatterboxProvider {
    /// Creates a provider; the base URL defaults to [`DEFAULT_BASE_URL`]
    pub fn from_config(config: ProviderConfig, timeouts: &TimeoutSettings) -> CoreResult<Self> {
        let client = Arc::new(ChatterboxClient::new(&config, timeouts)?);
        let timeout = Duration::from_millis(timeouts.generation_ms);
        let models = static_catalog()
            .into_iter()
            .map(|descriptor| {
                Arc::new(ChatterboxModel {
                    descriptor,
                    client: client.clone(),
                    timeout,
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

    /// Jobs whose service tasks have not settled yet
    pub fn in_flight_jobs(&self) -> Vec<JobId> {
        self.client
            .in_flight
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaProvider for ChatterboxProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Chatterbox TTS (local)"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn capabilities(&self) -> Vec<ProviderCapability> {
        vec![ProviderCapability::TextToSpeech]
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
        match self.client.health().await {
            Ok(health) => health.model_loaded.unwrap_or(true),
            Err(e) => {
                warn!("{} health check failed: {}", LABEL, e);
                false
            }
        }
    }

    fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Live status of a running job comes from the service task, so a
    /// queued task reads as `Pending` and progress is filled in
    async fn get_job_status(&self, job_id: &str) -> GenerationResult {
        let Some(record) = self.jobs.get(job_id).await else {
            return GenerationResult::not_found(PROVIDER_ID, job_id);
        };
        if record.status.is_terminal() {
            return record.to_result(PROVIDER_ID);
        }
        let Some(task_id) = self.client.tracked(job_id) else {
            return record.to_result(PROVIDER_ID);
        };

        let task = match self.client.status(&task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!("{} status of task {} failed: {}", LABEL, task_id, e);
                return record.to_result(PROVIDER_ID);
            }
        };
        self.jobs.set_external_id(job_id, task_id.as_str()).await;
        self.jobs
            .update_progress(job_id, task.progress, task.current_stage.clone())
            .await;

        let mut result = self
            .jobs
            .get(job_id)
            .await
            .unwrap_or(record)
            .to_result(PROVIDER_ID);
        match task.status.as_str() {
            "queued" => result.status = JobStatus::Pending,
            "processing" => result.status = JobStatus::Running,
            _ => {}
        }
        result
    }

    /// Deletes the service task behind a running job
    async fn cancel_job(&self, job_id: &str) -> bool {
        let Some(task_id) = self.client.tracked(job_id) else {
            return false;
        };

        match self.client.delete(&task_id).await {
            Ok(()) => {
                info!("{} task {} for job {} cancelled", LABEL, task_id, job_id);
                if let Err(e) = self.jobs.transition(job_id, JobStatus::Cancelled).await {
                    warn!("{} job {}: {}", LABEL, job_id, e);
                }
                self.client.untrack(job_id);
                true
            }
            Err(e) => {
                warn!("{} cancel of task {} failed: {}", LABEL, task_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generative::mock::silent_wav;
    use crate::core::generative::provider_impls::stub_server::{StubResponse, StubServer};
    use crate::core::generative::GenerationRequest;
    use crate::core::media::Text;
    use crate::core::options_from;

    fn provider_at(base_url: &str) -> ChatterboxProvider {
        let timeouts = TimeoutSettings {
            poll_interval_ms: 20,
            ..TimeoutSettings::default()
        };
        ChatterboxProvider::from_config(ProviderConfig::with_base_url(base_url), &timeouts)
            .unwrap()
    }

    #[test]
    fn test_catalog_and_defaults() {
        let provider =
            ChatterboxProvider::from_config(ProviderConfig::default(), &TimeoutSettings::default())
                .unwrap();
        assert_eq!(provider.base_url(), DEFAULT_BASE_URL);
        assert_eq!(provider.provider_type(), ProviderType::Local);

        let model = provider.get_model(CHATTERBOX_TTS).unwrap();
        assert_eq!(model.cost(&Options::new()), None);
        let resolved = model.descriptor().resolve_options(&Options::new()).unwrap();
        assert_eq!(resolved["voiceMode"], json!("predefined"));
        assert_eq!(resolved["chunkSize"], json!(120));
        assert_eq!(resolved["temperature"], Value::Null);

        let too_small = options_from(json!({"chunkSize": 10}));
        assert!(model.descriptor().resolve_options(&too_small).is_err());
    }

    #[test]
    fn test_build_body() {
        let provider = provider_at("http://127.0.0.1:1");
        let model = provider.get_model(CHATTERBOX_TTS).unwrap();
        let resolved = model
            .descriptor()
            .resolve_options(&options_from(json!({"cfgWeight": 0.3})))
            .unwrap();

        let body = build_body("Hello there", &resolved).unwrap();
        assert_eq!(body["text"], json!("Hello there"));
        assert_eq!(body["predefined_voice_id"], json!("Emily.wav"));
        assert_eq!(body["cfg_weight"], json!(0.3));
        assert_eq!(body["split_text"], json!(true));
        assert!(body.get("temperature").is_none());

        let clone = options_from(json!({"voiceMode": "clone"}));
        assert_eq!(build_body("x", &clone).unwrap_err().kind(), "invalid_input");

        let clone = options_from(json!({
            "voiceMode": "clone",
            "predefinedVoiceId": "Emily.wav",
            "referenceAudioFilename": "me.wav"
        }));
        let body = build_body("x", &clone).unwrap();
        assert_eq!(body["reference_audio_filename"], json!("me.wav"));
        assert!(body.get("predefined_voice_id").is_none());
    }

    #[tokio::test]
    async fn test_generate_downloads_audio() {
        let server = StubServer::start(vec![
            (
                "POST",
                "/tts/async",
                StubResponse::json(json!({"task_id": "t1", "status": "queued"})),
            ),
            (
                "GET",
                "/tts/status/t1",
                StubResponse::json(json!({"task_id": "t1", "status": "completed", "progress": 100})),
            ),
            (
                "GET",
                "/tts/result/t1",
                StubResponse::bytes("audio/wav", silent_wav(0.25).unwrap()),
            ),
            ("DELETE", "/tts/task/t1", StubResponse::json(json!({"message": "deleted"}))),
        ])
        .await;
        let provider = provider_at(&server.base_url);

        let result = provider
            .generate(GenerationRequest::new(CHATTERBOX_TTS, Text::new("Hello there")))
            .await;

        assert_eq!(result.status, JobStatus::Completed, "{:?}", result.error);
        let audio = result.output().unwrap().as_audio().unwrap();
        assert_eq!(audio.duration_sec(), Some(0.25));
        assert_eq!(result.cost, None);
        assert!(server.saw("DELETE /tts/task/t1"));
        assert!(provider.in_flight_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_reports_service_message() {
        let server = StubServer::start(vec![
            ("POST", "/tts/async", StubResponse::json(json!({"task_id": "t2"}))),
            (
                "GET",
                "/tts/status/t2",
                StubResponse::json(json!({"status": "failed", "error_message": "CUDA out of memory"})),
            ),
        ])
        .await;
        let provider = provider_at(&server.base_url);

        let result = provider
            .generate(GenerationRequest::new(CHATTERBOX_TTS, Text::new("Hello")))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.unwrap().contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn test_status_and_cancel_while_processing() {
        let server = StubServer::start(vec![
            ("POST", "/tts/async", StubResponse::json(json!({"task_id": "t3"}))),
            (
                "GET",
                "/tts/status/t3",
                StubResponse::json(json!({
                    "status": "processing",
                    "progress": 40.0,
                    "current_stage": "chunk 2/5"
                })),
            ),
            ("DELETE", "/tts/task/t3", StubResponse::json(json!({"message": "cancelled"}))),
        ])
        .await;
        let provider = Arc::new(provider_at(&server.base_url));

        let running = tokio::spawn({
            let provider = provider.clone();
            async move {
                provider
                    .generate(GenerationRequest::new(CHATTERBOX_TTS, Text::new("A long read")))
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

        let status = provider.get_job_status(&job_id).await;
        assert_eq!(status.status, JobStatus::Running);
        assert_eq!(status.progress, Some(40.0));
        let record = provider.jobs().get(&job_id).await.unwrap();
        assert_eq!(record.external_id.as_deref(), Some("t3"));
        assert_eq!(record.stage.as_deref(), Some("chunk 2/5"));

        assert!(provider.cancel_job(&job_id).await);
        let result = running.await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(
            provider.get_job_status(&job_id).await.status,
            JobStatus::Cancelled
        );
        assert!(server.saw("DELETE /tts/task/t3"));
        assert!(!provider.cancel_job(&job_id).await);
    }

    #[tokio::test]
    async fn test_queued_task_reads_as_pending() {
        let server = StubServer::start(vec![
            ("POST", "/tts/async", StubResponse::json(json!({"task_id": "t4"}))),
            (
                "GET",
                "/tts/status/t4",
                StubResponse::json(json!({"status": "queued", "progress": 0})),
            ),
            ("DELETE", "/tts/task/t4", StubResponse::json(json!({}))),
        ])
        .await;
        let provider = Arc::new(provider_at(&server.base_url));

        let running = tokio::spawn({
            let provider = provider.clone();
            async move {
                provider
                    .generate(GenerationRequest::new(CHATTERBOX_TTS, Text::new("Wait")))
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
            JobStatus::Pending
        );
        assert!(provider.cancel_job(&job_id).await);
        assert_eq!(running.await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_health_follows_model_loaded() {
        let server = StubServer::start(vec![(
            "GET",
            "/health",
            StubResponse::json(json!({"status": "healthy", "model_loaded": false})),
        )])
        .await;
        assert!(!provider_at(&server.base_url).is_available().await);

        let server = StubServer::start(vec![(
            "GET",
            "/health",
            StubResponse::json(json!({"status": "healthy", "model_loaded": true})),
        )])
        .await;
        assert!(provider_at(&server.base_url).is_available().await);

        assert!(!provider_at("http://127.0.0.1:1").is_available().await);
    }
}
