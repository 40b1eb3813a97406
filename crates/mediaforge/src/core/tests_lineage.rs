//! End-to-End Lineage and Selection Tests
//!
//! Chains of mock models and registries of mock providers exercising the
//! guarantees callers rely on: lineage shape, option resolution, cost, and
//! provider selection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::core::generative::mock::{MockModel, MockProvider};
use crate::core::generative::{
    FindOptions, GenerationRequest, JobStatus, MediaProvider, Model, ParameterSpec, Pricing,
    ProviderCapability, ProviderRegistry, ProviderType,
};
use crate::core::media::{Audio, AudioFormat, Image, MediaValue, Text};
use crate::core::{options_from, CoreError, Options};

fn llm() -> Arc<MockModel> {
    Arc::new(
        MockModel::new("llm", ProviderCapability::TextToText)
            .with_parameter("system", ParameterSpec::string()),
    )
}

fn image_model() -> Arc<MockModel> {
    Arc::new(
        MockModel::new("painter", ProviderCapability::TextToImage)
            .with_parameter("width", ParameterSpec::integer().with_default(512))
            .with_parameter("height", ParameterSpec::integer().with_default(512))
            .with_parameter("seed", ParameterSpec::seed()),
    )
}

fn tts_model() -> Arc<MockModel> {
    Arc::new(
        MockModel::new("voice", ProviderCapability::TextToSpeech)
            .with_parameter(
                "speed",
                ParameterSpec::number().with_default(1.0).with_range(0.5, 2.0),
            )
            .with_parameter("duration", ParameterSpec::number().with_default(0.25)),
    )
}

fn image_provider(id: &str, provider_type: ProviderType, cost: f64) -> MockProvider {
    MockProvider::new(id).with_type(provider_type).with_model(
        MockModel::new(format!("{}-image", id), ProviderCapability::TextToImage)
            .with_pricing(Pricing::flat(cost)),
    )
}

// =============================================================================
// Lineage
// =============================================================================

#[tokio::test]
async fn test_chain_length_matches_transform_count() {
    let model = llm();
    let mut value = MediaValue::from(Text::new("seed text"));

    for _ in 0..4 {
        value = model.transform(value.into(), &Options::new()).await.unwrap();
    }

    assert_eq!(value.lineage_depth(), 4);
    assert_eq!(value.history().count(), 4);
    let steps: Vec<usize> = value.history().records().iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_dragon_chain() {
    let prompt = MediaValue::from(Text::new("a dragon"));
    let prompt_id = prompt.id().to_string();

    let enhanced = llm()
        .transform(prompt.into(), &options_from(json!({"system": "enhance"})))
        .await
        .unwrap();
    let image = image_model()
        .transform(
            enhanced.into(),
            &options_from(json!({"width": 1024, "height": 1024})),
        )
        .await
        .unwrap();

    let picture = image.as_image().unwrap();
    assert_eq!(picture.width(), Some(1024));
    assert_eq!(picture.height(), Some(1024));

    let records = image.history().records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].step, 0);
    assert_eq!(records[0].model, "llm");
    assert_eq!(records[0].options["system"], json!("enhance"));
    assert_eq!(records[1].step, 1);
    assert_eq!(records[1].model, "painter");
    assert_eq!(records[1].options["width"], json!(1024));

    let root = image.history().root();
    assert_eq!(root.id(), prompt_id);
    assert_eq!(root.as_text().unwrap().content(), "a dragon");

    let report = image.history().report();
    assert_eq!(report.depth, 2);
    assert!(report.to_json().unwrap().contains("painter"));
}

#[tokio::test]
async fn test_identity_role_keeps_chain() {
    let image = image_model()
        .transform("a castle".into(), &Options::new())
        .await
        .unwrap();

    let same: Image = image.as_role().unwrap();
    let back = MediaValue::from(same);

    assert_eq!(back.id(), image.id());
    assert!(back.is_valid());
    assert_eq!(back.lineage_depth(), image.lineage_depth());
}

#[tokio::test]
async fn test_empty_audio_rejected_before_backend() {
    let transcriber = MockModel::new("stt", ProviderCapability::AudioToText);
    let empty = Audio::new(Vec::new(), AudioFormat::Wav);

    let err = transcriber
        .transform(empty.into(), &Options::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(transcriber.call_count(), 0);
}

// =============================================================================
// Options and Cost
// =============================================================================

#[tokio::test]
async fn test_default_speed_is_recorded() {
    let speech = tts_model()
        .transform("hello".into(), &Options::new())
        .await
        .unwrap();

    let lineage = speech.lineage().unwrap();
    assert_eq!(lineage.options()["speed"], json!(1.0));
    assert!(speech.as_audio().unwrap().duration_sec().is_some());
}

#[tokio::test]
async fn test_explicit_seeds_are_recorded_identically() {
    let model = image_model();
    let options = options_from(json!({"seed": 1234}));

    let a = model.transform("a fox".into(), &options).await.unwrap();
    let b = model.transform("a fox".into(), &options).await.unwrap();

    assert_eq!(a.lineage().unwrap().options()["seed"], json!(1234));
    assert_eq!(
        a.lineage().unwrap().options(),
        b.lineage().unwrap().options()
    );
}

#[tokio::test]
async fn test_missing_seed_is_synthesized_and_recorded() {
    let output = image_model()
        .transform("a fox".into(), &Options::new())
        .await
        .unwrap();
    assert!(output.lineage().unwrap().options()["seed"].is_u64());
}

#[test]
fn test_cost_scales_linearly_with_duration() {
    let model = MockModel::new("clip", ProviderCapability::ImageToVideo)
        .with_parameter("duration", ParameterSpec::number().with_default(5.0))
        .with_pricing(Pricing::linear(0.15, "duration", 5.0));

    let five = options_from(json!({"duration": 5.0}));
    let ten = options_from(json!({"duration": 10.0}));

    assert_eq!(model.cost(&five), Some(0.15));
    assert_eq!(model.cost(&ten), Some(0.30));
    assert_eq!(model.cost(&ten), model.cost(&ten));
}

// =============================================================================
// Provider Selection
// =============================================================================

#[tokio::test]
async fn test_capability_filter_only_returns_supporting_providers() {
    let registry = ProviderRegistry::new();
    registry
        .register(Arc::new(image_provider("img", ProviderType::Remote, 0.1)))
        .await;
    registry
        .register(Arc::new(
            MockProvider::new("speech").with_model(MockModel::new(
                "tts",
                ProviderCapability::TextToSpeech,
            )),
        ))
        .await;

    for capability in ProviderCapability::ALL {
        for provider in registry.get_providers_for_capability(capability).await {
            assert!(provider.supports(capability));
        }
    }
    assert_eq!(
        registry
            .get_providers_for_capability(ProviderCapability::TextToSpeech)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_prefer_local_and_fallback() {
    let registry = ProviderRegistry::new();
    registry
        .register(Arc::new(image_provider("cloud", ProviderType::Remote, 0.05)))
        .await;
    registry
        .register(Arc::new(image_provider("gpu", ProviderType::Local, 0.0)))
        .await;

    let best = registry
        .find_best_provider(
            ProviderCapability::TextToImage,
            FindOptions::default().prefer_local(true),
        )
        .await
        .unwrap();
    assert_eq!(best.id(), "gpu");

    let registry = ProviderRegistry::new();
    registry
        .register(Arc::new(image_provider("cloud", ProviderType::Remote, 0.05)))
        .await;
    registry
        .register(Arc::new(
            image_provider("gpu", ProviderType::Local, 0.0).with_available(false),
        ))
        .await;

    let fallback = registry
        .find_best_provider(
            ProviderCapability::TextToImage,
            FindOptions::default().prefer_local(true),
        )
        .await
        .unwrap();
    assert_eq!(fallback.id(), "cloud");
}

#[tokio::test]
async fn test_max_cost_drops_expensive_providers() {
    let registry = ProviderRegistry::new();
    registry
        .register(Arc::new(image_provider("premium", ProviderType::Remote, 0.50)))
        .await;
    registry
        .register(Arc::new(image_provider("budget", ProviderType::Remote, 0.05)))
        .await;

    let best = registry
        .find_best_provider(
            ProviderCapability::TextToImage,
            FindOptions::default().max_cost(0.10),
        )
        .await
        .unwrap();
    assert_eq!(best.id(), "budget");

    assert!(registry
        .find_best_provider(
            ProviderCapability::TextToImage,
            FindOptions::default().max_cost(0.01),
        )
        .await
        .is_none());
}

#[tokio::test]
async fn test_generate_never_errors_on_backend_failure() {
    let provider = MockProvider::new("flaky").with_model(
        MockModel::new("broken", ProviderCapability::TextToImage).with_failure("GPU on fire"),
    );

    let result = provider
        .generate(GenerationRequest::new("broken", "a dragon"))
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(!result.is_success());
    assert!(result.outputs.is_empty());
    assert!(result.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert_eq!(result.error_kind.as_deref(), Some("transformation_failed"));
    let recorded = provider.get_job_status(&result.job_id).await;
    assert_eq!(recorded.status, JobStatus::Failed);
    assert_eq!(recorded.error, result.error);
    assert_eq!(recorded.error_kind.as_deref(), Some("transformation_failed"));
}

#[tokio::test]
async fn test_generate_reports_cost_from_resolved_options() {
    let provider = MockProvider::new("video").with_model(
        MockModel::new("animate", ProviderCapability::ImageToVideo)
            .with_parameter("duration", ParameterSpec::number().with_default(5.0))
            .with_pricing(Pricing::linear(0.15, "duration", 5.0)),
    );
    let still = image_model()
        .transform("a lighthouse".into(), &Options::new())
        .await
        .unwrap();

    let result = provider
        .generate(GenerationRequest::new("animate", still).with_option("duration", 10.0))
        .await;

    assert!(result.is_success());
    assert_eq!(result.cost, Some(0.30));
    assert_eq!(result.currency.as_deref(), Some("USD"));
    assert_eq!(result.output().unwrap().lineage_depth(), 2);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let model = MockModel::new("sluggish", ProviderCapability::TextToImage)
        .with_latency(Duration::from_millis(500))
        .with_timeout(Duration::from_millis(20));

    let err = model
        .transform("a dragon".into(), &Options::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Timeout { timeout_ms: 20, .. }));
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_generate_reports_timeout_as_failed() {
    let provider = MockProvider::new("slow").with_model(
        MockModel::new("sluggish", ProviderCapability::TextToImage)
            .with_latency(Duration::from_millis(500))
            .with_timeout(Duration::from_millis(20)),
    );

    let result = provider
        .generate(GenerationRequest::new("sluggish", "a dragon"))
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("timeout"));
    assert!(result.outputs.is_empty());

    let recorded = provider.get_job_status(&result.job_id).await;
    assert_eq!(recorded.status, JobStatus::Failed);
    assert_eq!(recorded.error_kind.as_deref(), Some("timeout"));
    assert_eq!(provider.jobs().active_count().await, 0);
}
