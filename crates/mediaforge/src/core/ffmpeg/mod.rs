//! FFmpeg Service Integration
//!
//! The service client and a local provider exposing it as models.

pub mod client;

pub use client::{ExtractAudioOptions, FFmpegServiceClient, ServiceHealth, ServiceOutput};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::core::fs::TempMediaFile;
use crate::core::generative::{
    HealthReport, HealthStatus, JobTracker, MediaProvider, Model, ParameterSpec, ProviderCapability,
    ProviderConfig, ProviderModel, ProviderType,
};
use crate::core::media::{MediaValue, RawMedia};
use crate::core::settings::TimeoutSettings;
use crate::core::{CoreError, CoreResult, Options};

const PROVIDER_ID: &str = "ffmpeg";

pub const EXTRACT_AUDIO_MODEL: &str = "extract-audio";
pub const FILTER_MODEL: &str = "filter";

fn catalog() -> Vec<ProviderModel> {
    vec![
        ProviderModel::new(
            EXTRACT_AUDIO_MODEL,
            "Extract Audio",
            vec![ProviderCapability::VideoToAudio],
        )
        .with_description("Extracts the audio track of a video")
        .with_parameter(
            "outputFormat",
            ParameterSpec::enumeration(["wav", "mp3", "aac", "flac", "ogg"]).with_default("wav"),
        )
        .with_parameter(
            "sampleRate",
            ParameterSpec::integer().with_range(8_000.0, 96_000.0),
        )
        .with_parameter("channels", ParameterSpec::integer().with_range(1.0, 8.0))
        .with_parameter("bitrate", ParameterSpec::string())
        .with_parameter("startTime", ParameterSpec::number().with_range(0.0, f64::MAX))
        .with_parameter("duration", ParameterSpec::number().with_range(0.0, f64::MAX))
        .with_parameter("volume", ParameterSpec::number().with_range(0.0, 10.0))
        .with_parameter("normalize", ParameterSpec::boolean().with_default(false)),
        ProviderModel::new(FILTER_MODEL, "Filter Graph", vec![ProviderCapability::VideoToVideo])
            .with_description("Applies an FFmpeg filter_complex graph")
            .with_parameter(
                "filterComplex",
                ParameterSpec::string()
                    .required()
                    .with_description("FFmpeg -filter_complex expression"),
            ),
    ]
}

// =============================================================================
// Model
// =============================================================================

struct FFmpegModel {
    descriptor: ProviderModel,
    capability: ProviderCapability,
    client: Arc<FFmpegServiceClient>,
    temp_dir: Option<PathBuf>,
    timeout: Duration,
}

impl FFmpegModel {
    async fn run(&self, upload: &TempMediaFile, options: &Options) -> CoreResult<RawMedia> {
        match self.capability {
            ProviderCapability::VideoToAudio => {
                let extract = ExtractAudioOptions::from_options(options)?;
                let output = self.client.extract_audio(upload.path(), &extract).await?;
                let format = output.content_type.unwrap_or(extract.output_format);
                Ok(RawMedia::bytes(output.data, format).with_metadata(output.metadata))
            }
            _ => {
                let filter = options
                    .get("filterComplex")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        CoreError::InvalidInput("filterComplex is required".to_string())
                    })?;
                let output = self
                    .client
                    .filter_video(filter, &[upload.path().to_path_buf()])
                    .await?;
                let format = output.content_type.unwrap_or_else(|| "mp4".to_string());
                Ok(RawMedia::bytes(output.data, format).with_metadata(output.metadata))
            }
        }
    }
}

#[async_trait]
impl Model for FFmpegModel {
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
        let video = input
            .as_video()
            .ok_or_else(|| CoreError::InvalidInput("FFmpeg models take video input".to_string()))?;

        let upload = TempMediaFile::create(
            self.temp_dir.as_deref(),
            video.format().extension(),
            video.data(),
        )
        .await?;

        let result = self.run(&upload, options).await;
        let path = upload.path().to_path_buf();
        if let Err(e) = upload.remove().await {
            warn!("Failed to remove upload {}: {}", path.display(), e);
        }
        result
    }
}

// =============================================================================
// FFmpegProvider
// =============================================================================

/// Local provider backed by the FFmpeg service
pub struct FFmpegProvider {
    client: Arc<FFmpegServiceClient>,
    models: Vec<Arc<dyn Model>>,
    temp_dir: Option<PathBuf>,
    timeouts: TimeoutSettings,
    jobs: JobTracker,
}

impl std::fmt::Debug for FFmpegProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FFmpegProvider")
            .field("base_url", &self.client.base_url())
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

impl FFmpegProvider {
    /// Creates a provider; the base URL defaults to [`client::DEFAULT_BASE_URL`]
    pub fn from_config(
        config: ProviderConfig,
        timeouts: &TimeoutSettings,
        temp_dir: Option<PathBuf>,
    ) -> CoreResult<Self> {
        let base_url = config
            .require_base_url("FFmpeg")
            .unwrap_or_else(|_| client::DEFAULT_BASE_URL.to_string());
        let client = Arc::new(FFmpegServiceClient::new(
            base_url,
            Duration::from_secs(config.timeout_sec.max(1)),
        )?);
        let generation_timeout = Duration::from_millis(timeouts.generation_ms);

        let models = catalog()
            .into_iter()
            .map(|descriptor| {
                let capability = descriptor
                    .capabilities
                    .first()
                    .copied()
                    .unwrap_or(ProviderCapability::VideoToVideo);
                Arc::new(FFmpegModel {
                    descriptor,
                    capability,
                    client: client.clone(),
                    temp_dir: temp_dir.clone(),
                    timeout: generation_timeout,
                }) as Arc<dyn Model>
            })
            .collect();

        Ok(Self {
            client,
            models,
            temp_dir,
            timeouts: timeouts.clone(),
            jobs: JobTracker::new(),
        })
    }

    pub fn client(&self) -> &FFmpegServiceClient {
        &self.client
    }
}

#[async_trait]
impl MediaProvider for FFmpegProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "FFmpeg service"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn capabilities(&self) -> Vec<ProviderCapability> {
        vec![
            ProviderCapability::VideoToAudio,
            ProviderCapability::VideoToVideo,
        ]
    }

    fn models(&self) -> Vec<Arc<dyn Model>> {
        self.models.clone()
    }

    fn configure(&mut self, config: ProviderConfig) -> CoreResult<()> {
        let rebuilt = Self::from_config(config, &self.timeouts, self.temp_dir.clone())?;
        let jobs = std::mem::take(&mut self.jobs);
        *self = Self { jobs, ..rebuilt };
        Ok(())
    }

    async fn is_available(&self) -> bool {
        match self.client.health().await {
            Ok(_) => true,
            Err(e) => {
                warn!("FFmpeg health check failed: {}", e);
                false
            }
        }
    }

    fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    async fn get_health(&self) -> HealthReport {
        let (status, message) = match self.client.health().await {
            Ok(health) => (
                HealthStatus::Healthy,
                Some(format!(
                    "ffmpeg {} ({} active / {} total jobs)",
                    health.ffmpeg_version.as_deref().unwrap_or("unknown"),
                    health.active_jobs,
                    health.total_jobs
                )),
            ),
            Err(e) => (
                HealthStatus::Unhealthy,
                Some(e.to_string()),
            ),
        };

        HealthReport {
            provider_id: self.id().to_string(),
            status,
            uptime_sec: self.jobs.uptime().as_secs(),
            active_jobs: self.jobs.active_count().await,
            queued_jobs: self.jobs.queued_count().await,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generative::{GenerationRequest, JobStatus};
    use crate::core::media::{Audio, AudioFormat, Video, VideoFormat};
    use serde_json::json;
    use tempfile::TempDir;

    fn provider(temp_dir: Option<PathBuf>) -> FFmpegProvider {
        let config = ProviderConfig {
            timeout_sec: 2,
            ..ProviderConfig::with_base_url("http://127.0.0.1:1")
        };
        FFmpegProvider::from_config(config, &TimeoutSettings::default(), temp_dir).unwrap()
    }

    #[test]
    fn test_catalog() {
        let provider = provider(None);
        assert_eq!(provider.provider_type(), ProviderType::Local);
        assert_eq!(provider.client().base_url(), "http://127.0.0.1:1");

        let extract = provider.get_model(EXTRACT_AUDIO_MODEL).unwrap();
        assert_eq!(extract.capability(), ProviderCapability::VideoToAudio);
        let defaults = extract.descriptor().default_options();
        assert_eq!(defaults["outputFormat"], json!("wav"));

        let filter = provider.get_model(FILTER_MODEL).unwrap();
        assert!(filter.descriptor().resolve_options(&Options::new()).is_err());
    }

    #[tokio::test]
    async fn test_upload_is_removed_after_failure() {
        let dir = TempDir::new().unwrap();
        let provider = provider(Some(dir.path().to_path_buf()));

        let video = Video::new(b"not-really-mp4".to_vec(), VideoFormat::Mp4);
        let result = provider
            .generate(GenerationRequest::new(EXTRACT_AUDIO_MODEL, video))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.is_some());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_non_video_input() {
        let provider = provider(None);
        let audio = Audio::new(vec![1, 2, 3], AudioFormat::Mp3);
        let result = provider
            .generate(GenerationRequest::new(EXTRACT_AUDIO_MODEL, audio))
            .await;

        assert_eq!(result.error_kind.as_deref(), Some("role_not_supported"));
    }

    #[tokio::test]
    async fn test_configure_keeps_timeouts_and_jobs() {
        let dir = TempDir::new().unwrap();
        let timeouts = TimeoutSettings {
            generation_ms: 1_500,
            ..TimeoutSettings::default()
        };
        let mut provider = FFmpegProvider::from_config(
            ProviderConfig::with_base_url("http://127.0.0.1:1"),
            &timeouts,
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        let job_id = provider.jobs().create(EXTRACT_AUDIO_MODEL).await;

        provider
            .configure(ProviderConfig::with_base_url("http://127.0.0.1:2"))
            .unwrap();

        assert_eq!(provider.client().base_url(), "http://127.0.0.1:2");
        assert_eq!(provider.temp_dir.as_deref(), Some(dir.path()));
        assert_eq!(
            provider.get_model(EXTRACT_AUDIO_MODEL).unwrap().timeout(),
            Duration::from_millis(1_500)
        );
        assert!(provider.jobs().get(&job_id).await.is_some());
    }

    #[tokio::test]
    async fn test_health_report_when_unreachable() {
        let report = provider(None).get_health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.message.is_some());
    }
}
