//! Mediaforge Core Library
//!
//! Provider-agnostic media generation. Media values (text, image, audio, video)
//! flow through chains of provider-backed models, and every output carries the
//! lineage of the invocations that produced it.
//!
//! Typical startup:
//!
//! ```no_run
//! use mediaforge::core::generative::{FindOptions, ProviderCapability};
//! use mediaforge::core::settings::Settings;
//!
//! # async fn run() {
//! let settings = Settings::default().with_env_overrides();
//! let registry = mediaforge::create_provider_registry(&settings).await;
//! let best = registry
//!     .find_best_provider(ProviderCapability::TextToImage, FindOptions::default())
//!     .await;
//! # let _ = best;
//! # }
//! ```

pub mod core;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::ffmpeg::FFmpegProvider;
use crate::core::generative::provider_impls::{
    ChatterboxProvider, FalProvider, HuggingFaceProvider,
};
use crate::core::generative::{MediaProvider, ProviderRegistry};
use crate::core::settings::Settings;
use crate::core::CoreResult;

/// Builds a registry from settings.
///
/// Providers whose configuration is missing or invalid are skipped with a
/// warning; the rest are registered in a fixed order (local first, then remote)
/// and the registry is marked ready before it is returned.
pub async fn create_provider_registry(settings: &Settings) -> ProviderRegistry {
    let registry = ProviderRegistry::with_settings(settings.registry.clone())
        .with_probe_timeout(Duration::from_millis(settings.timeouts.health_check_ms));

    if let Some(config) = settings.providers.huggingface.clone() {
        match HuggingFaceProvider::from_config(config, &settings.timeouts) {
            Ok(provider) => {
                let provider = Arc::new(provider);
                if let Err(e) = provider.discover_models().await {
                    warn!("HuggingFace model discovery failed, using static catalog: {}", e);
                }
                registry.register(provider).await;
            }
            Err(e) => warn!("Skipping HuggingFace provider: {}", e),
        }
    }

    if let Some(config) = settings.providers.ffmpeg.clone() {
        register_configured(&registry, "ffmpeg", || {
            FFmpegProvider::from_config(config, &settings.timeouts, settings.temp_dir.clone())
        })
        .await;
    }

    if let Some(config) = settings.providers.chatterbox.clone() {
        register_configured(&registry, "chatterbox", || {
            ChatterboxProvider::from_config(config, &settings.timeouts)
        })
        .await;
    }

    if let Some(config) = settings.providers.fal.clone() {
        register_configured(&registry, "fal", || {
            FalProvider::from_config(config, &settings.timeouts)
        })
        .await;
    }

    registry.mark_ready().await;
    let stats = registry.get_stats().await;
    info!(
        "Provider registry ready: {} providers ({} local, {} remote)",
        stats.total, stats.local, stats.remote
    );

    registry
}

async fn register_configured<P, F>(registry: &ProviderRegistry, label: &str, build: F)
where
    P: MediaProvider + 'static,
    F: FnOnce() -> CoreResult<P>,
{
    match build() {
        Ok(provider) => {
            registry.register(Arc::new(provider)).await;
        }
        Err(e) => warn!("Skipping {} provider: {}", label, e),
    }
}
