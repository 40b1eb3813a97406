//! In-process mock provider and model.
//!
//! Produces small deterministic payloads of the requested kind without any
//! network access. Used by tests and the CLI demo.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::jobs::JobTracker;
use super::models::{Model, ParameterSpec, Pricing, ProviderModel};
use super::providers::{MediaProvider, ProviderCapability, ProviderConfig, ProviderType};
use crate::core::media::{MediaKind, MediaValue, RawMedia};
use crate::core::roles::RoleResolver;
use crate::core::{options_from, CoreError, CoreResult, Options};

// ============================================================================
// Mock Model
// ============================================================================

/// Mock model for testing
#[derive(Debug)]
pub struct MockModel {
    descriptor: ProviderModel,
    provider_id: String,
    capability: ProviderCapability,
    failure: Option<String>,
    latency: Option<Duration>,
    timeout: Option<Duration>,
    resolver: Option<RoleResolver>,
    calls: AtomicUsize,
    last_options: Mutex<Option<Options>>,
}

impl MockModel {
    pub fn new(id: impl Into<String>, capability: ProviderCapability) -> Self {
        let id = id.into();
        Self {
            descriptor: ProviderModel::new(id.clone(), format!("Mock {}", id), vec![capability]),
            provider_id: "mock".to_string(),
            capability,
            failure: None,
            latency: None,
            timeout: None,
            resolver: None,
            calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.descriptor = self.descriptor.with_parameter(name, spec);
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.descriptor = self.descriptor.with_pricing(pricing);
        self
    }

    /// Every invocation fails with `message`
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sleeps before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_role_resolver(mut self, resolver: RoleResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Number of backend invocations so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent invocation
    pub fn last_options(&self) -> Option<Options> {
        self.last_options.lock().ok().and_then(|o| o.clone())
    }

    fn render(&self, input: &MediaValue, options: &Options) -> CoreResult<RawMedia> {
        let number = |key: &str, default: f64| {
            options.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
        };

        let raw = match self.capability.output_kind() {
            MediaKind::Text => {
                let body = match input.as_text() {
                    Some(text) => text.content().to_string(),
                    None => format!("{} {}", input.kind(), input.id()),
                };
                RawMedia::text(format!("[{}] {}", self.descriptor.id, body))
            }
            MediaKind::Image => {
                let width = number("width", 64.0) as u32;
                let height = number("height", 64.0) as u32;
                RawMedia::bytes(placeholder_png(width, height), "png")
            }
            MediaKind::Audio => {
                let duration = number("duration", 1.0).max(0.0);
                RawMedia::bytes(silent_wav(duration)?, "wav")
            }
            MediaKind::Video => {
                let duration = number("duration", 1.0);
                RawMedia::bytes(b"mock-video-payload".to_vec(), "mp4").with_metadata(options_from(
                    json!({ "durationSec": duration, "hasAudio": false }),
                ))
            }
        };
        Ok(raw)
    }
}

#[async_trait]
impl Model for MockModel {
    fn descriptor(&self) -> &ProviderModel {
        &self.descriptor
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capability(&self) -> ProviderCapability {
        self.capability
    }

    fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(Duration::from_millis(super::models::DEFAULT_GENERATION_TIMEOUT_MS))
    }

    fn role_resolver(&self) -> Option<&RoleResolver> {
        self.resolver.as_ref()
    }

    async fn invoke(&self, input: &MediaValue, options: &Options) -> CoreResult<RawMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_options.lock() {
            *last = Some(options.clone());
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = &self.failure {
            return Err(CoreError::Internal(message.clone()));
        }

        self.render(input, options)
    }
}

/// PNG signature plus an IHDR chunk; enough for header sniffing
fn placeholder_png(width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(&13u32.to_be_bytes());
    data.extend_from_slice(b"IHDR");
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[8, 2, 0, 0, 0]);
    data.extend_from_slice(&[0, 0, 0, 0]);
    data
}

/// 8 kHz mono 16-bit silence
pub(crate) fn silent_wav(duration_sec: f64) -> CoreResult<Vec<u8>> {
    const SAMPLE_RATE: u32 = 8_000;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CoreError::Internal(format!("WAV encode failed: {}", e)))?;
        let samples = (duration_sec * SAMPLE_RATE as f64).round() as u64;
        for _ in 0..samples {
            writer
                .write_sample(0i16)
                .map_err(|e| CoreError::Internal(format!("WAV encode failed: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| CoreError::Internal(format!("WAV encode failed: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Mock provider for testing
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    name: String,
    provider_type: ProviderType,
    capabilities: Option<Vec<ProviderCapability>>,
    models: Vec<Arc<MockModel>>,
    available: bool,
    probe_delay: Option<Duration>,
    config: ProviderConfig,
    jobs: JobTracker,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Mock ({})", id),
            id,
            provider_type: ProviderType::Remote,
            capabilities: None,
            models: Vec::new(),
            available: true,
            probe_delay: None,
            config: ProviderConfig::default(),
            jobs: JobTracker::new(),
        }
    }

    pub fn with_type(mut self, provider_type: ProviderType) -> Self {
        self.provider_type = provider_type;
        self
    }

    /// Sets availability
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Makes the availability probe slow
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Declares capabilities explicitly instead of deriving them from models
    pub fn with_capabilities(mut self, capabilities: Vec<ProviderCapability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Adds a model, binding it to this provider
    pub fn with_model(mut self, mut model: MockModel) -> Self {
        model.provider_id = self.id.clone();
        self.models.push(Arc::new(model));
        self
    }

    /// Adds a model and returns the shared handle for inspection
    pub fn add_model(&mut self, mut model: MockModel) -> Arc<MockModel> {
        model.provider_id = self.id.clone();
        let model = Arc::new(model);
        self.models.push(model.clone());
        model
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl MediaProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn capabilities(&self) -> Vec<ProviderCapability> {
        if let Some(capabilities) = &self.capabilities {
            return capabilities.clone();
        }
        let mut capabilities: Vec<ProviderCapability> =
            self.models.iter().map(|m| m.capability).collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    fn models(&self) -> Vec<Arc<dyn Model>> {
        self.models
            .iter()
            .map(|m| m.clone() as Arc<dyn Model>)
            .collect()
    }

    fn configure(&mut self, config: ProviderConfig) -> CoreResult<()> {
        self.config = config;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.available
    }

    fn jobs(&self) -> &JobTracker {
        &self.jobs
    }
}

// ============================================================================
// Tests
// ============================================================================
