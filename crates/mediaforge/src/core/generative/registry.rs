//! Provider Registry
//!
//! Ordered set of providers, looked up by capability. The registry is built
//! once at startup and passed by reference; the provider list is its only
//! shared mutable state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::models::Model;
use super::providers::{MediaProvider, ProviderCapability, ProviderType};
use crate::core::settings::RegistrySettings;
use crate::core::ProviderId;

/// Default bound on one availability probe
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

/// How to choose among equally eligible providers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    /// First registered wins
    #[default]
    RegistrationOrder,
    /// Lowest cheapest-model cost wins, then registration order
    CheapestFirst,
}

/// Selection preferences for [`ProviderRegistry::find_best_provider`].
///
/// Unset fields fall back to the registry's settings.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub prefer_local: Option<bool>,
    /// Upper bound on the cheapest model cost for the capability
    pub max_cost: Option<f64>,
    pub tie_break: Option<TieBreak>,
}

impl FindOptions {
    pub fn prefer_local(mut self, prefer: bool) -> Self {
        self.prefer_local = Some(prefer);
        self
    }

    pub fn max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = Some(tie_break);
        self
    }
}

/// Registry statistics, computed on demand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub local: usize,
    pub remote: usize,
    /// Providers last seen available
    pub available: usize,
    pub by_capability: BTreeMap<ProviderCapability, usize>,
}

/// Listing entry for one registered provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub name: String,
    pub provider_type: ProviderType,
    pub capabilities: Vec<ProviderCapability>,
    pub model_count: usize,
    pub available: Option<bool>,
}

struct Registration {
    provider: Arc<dyn MediaProvider>,
    capabilities: Vec<ProviderCapability>,
    /// Last probe result; `None` until probed
    available: Option<bool>,
}

impl Registration {
    fn new(provider: Arc<dyn MediaProvider>) -> Self {
        Self {
            capabilities: provider.capabilities(),
            provider,
            available: None,
        }
    }

    fn serves(&self, capability: ProviderCapability) -> bool {
        self.capabilities.contains(&capability)
            && !self.provider.get_models_for_capability(capability).is_empty()
    }
}

/// Cheapest model a provider offers for `capability`, with its cost at
/// default options. Unpriced models count as free.
pub fn cheapest_model(
    provider: &dyn MediaProvider,
    capability: ProviderCapability,
) -> Option<(Arc<dyn Model>, f64)> {
    provider
        .get_models_for_capability(capability)
        .into_iter()
        .map(|model| {
            let descriptor = model.descriptor();
            let cost = descriptor
                .cost_for(&descriptor.default_options())
                .unwrap_or(0.0);
            (model, cost)
        })
        .fold(None, |best: Option<(Arc<dyn Model>, f64)>, (model, cost)| match best {
            Some((_, best_cost)) if best_cost <= cost => best,
            _ => Some((model, cost)),
        })
}

/// Registry of media providers
pub struct ProviderRegistry {
    providers: RwLock<Vec<Registration>>,
    settings: RegistrySettings,
    probe_timeout: Duration,
    ready: RwLock<bool>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("settings", &self.settings)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::with_settings(RegistrySettings::default())
    }

    pub fn with_settings(settings: RegistrySettings) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            settings,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            ready: RwLock::new(false),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a provider. An existing id is kept; returns whether the
    /// provider was added.
    pub async fn register(&self, provider: Arc<dyn MediaProvider>) -> bool {
        let mut providers = self.providers.write().await;
        if providers.iter().any(|r| r.provider.id() == provider.id()) {
            debug!("Provider {} already registered, keeping existing", provider.id());
            return false;
        }
        info!(
            "Registered provider {} ({}, {} models)",
            provider.id(),
            provider.provider_type(),
            provider.models().len()
        );
        providers.push(Registration::new(provider));
        true
    }

    /// Registers a provider, replacing any existing one with the same id in
    /// place. Returns the replaced provider.
    pub async fn register_forced(
        &self,
        provider: Arc<dyn MediaProvider>,
    ) -> Option<Arc<dyn MediaProvider>> {
        let mut providers = self.providers.write().await;
        let registration = Registration::new(provider);
        match providers
            .iter_mut()
            .find(|r| r.provider.id() == registration.provider.id())
        {
            Some(existing) => {
                info!("Replaced provider {}", registration.provider.id());
                let old = std::mem::replace(existing, registration);
                Some(old.provider)
            }
            None => {
                info!("Registered provider {}", registration.provider.id());
                providers.push(registration);
                None
            }
        }
    }

    pub async fn unregister(&self, id: &str) -> bool {
        let mut providers = self.providers.write().await;
        let before = providers.len();
        providers.retain(|r| r.provider.id() != id);
        before != providers.len()
    }

    pub async fn mark_ready(&self) {
        *self.ready.write().await = true;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get_provider(&self, id: &str) -> Option<Arc<dyn MediaProvider>> {
        self.providers
            .read()
            .await
            .iter()
            .find(|r| r.provider.id() == id)
            .map(|r| r.provider.clone())
    }

    /// All providers in registration order
    pub async fn providers(&self) -> Vec<Arc<dyn MediaProvider>> {
        self.providers
            .read()
            .await
            .iter()
            .map(|r| r.provider.clone())
            .collect()
    }

    /// Providers that declare `capability` and have a model for it, in
    /// registration order
    pub async fn get_providers_for_capability(
        &self,
        capability: ProviderCapability,
    ) -> Vec<Arc<dyn MediaProvider>> {
        self.providers
            .read()
            .await
            .iter()
            .filter(|r| r.serves(capability))
            .map(|r| r.provider.clone())
            .collect()
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|r| ProviderInfo {
                id: r.provider.id().to_string(),
                name: r.provider.name().to_string(),
                provider_type: r.provider.provider_type(),
                capabilities: r.capabilities.clone(),
                model_count: r.provider.models().len(),
                available: r.available,
            })
            .collect()
    }

    // =========================================================================
    // Availability
    // =========================================================================

    async fn probe(&self, providers: &[Arc<dyn MediaProvider>]) -> Vec<bool> {
        let timeout = self.probe_timeout;
        let probes = providers.iter().map(|provider| async move {
            match tokio::time::timeout(timeout, provider.is_available()).await {
                Ok(available) => available,
                Err(_) => {
                    warn!(
                        "Availability probe for {} timed out after {}ms",
                        provider.id(),
                        timeout.as_millis()
                    );
                    false
                }
            }
        });
        let results = join_all(probes).await;

        // write back only after every probe settled
        let mut registrations = self.providers.write().await;
        for (provider, available) in providers.iter().zip(&results) {
            debug!("Provider {} available: {}", provider.id(), available);
            if let Some(r) = registrations
                .iter_mut()
                .find(|r| r.provider.id() == provider.id())
            {
                r.available = Some(*available);
            }
        }
        results
    }

    /// Probes every provider concurrently
    pub async fn refresh_availability(&self) -> Vec<(ProviderId, bool)> {
        let providers = self.providers().await;
        let results = self.probe(&providers).await;
        providers
            .iter()
            .map(|p| p.id().to_string())
            .zip(results)
            .collect()
    }

    /// Picks a provider for `capability`.
    ///
    /// Candidates are probed concurrently and the decision is taken after all
    /// probes settle. Unavailable providers and providers whose cheapest model
    /// exceeds `max_cost` are dropped; with `prefer_local` any local provider
    /// beats every remote one; the tie-break policy picks among the rest.
    pub async fn find_best_provider(
        &self,
        capability: ProviderCapability,
        options: FindOptions,
    ) -> Option<Arc<dyn MediaProvider>> {
        let candidates = self.get_providers_for_capability(capability).await;
        if candidates.is_empty() {
            debug!("No provider declares {}", capability);
            return None;
        }

        let availability = self.probe(&candidates).await;
        let mut eligible: Vec<(Arc<dyn MediaProvider>, f64)> = candidates
            .into_iter()
            .zip(availability)
            .filter(|(_, available)| *available)
            .filter_map(|(provider, _)| {
                let (_, cost) = cheapest_model(provider.as_ref(), capability)?;
                Some((provider, cost))
            })
            .collect();

        if let Some(max_cost) = options.max_cost {
            eligible.retain(|(_, cost)| *cost <= max_cost);
        }

        let prefer_local = options.prefer_local.unwrap_or(self.settings.prefer_local);
        if prefer_local
            && eligible
                .iter()
                .any(|(p, _)| p.provider_type() == ProviderType::Local)
        {
            eligible.retain(|(p, _)| p.provider_type() == ProviderType::Local);
        }

        let chosen = match options.tie_break.unwrap_or(self.settings.tie_break) {
            TieBreak::RegistrationOrder => eligible.into_iter().next(),
            TieBreak::CheapestFirst => eligible.into_iter().fold(None, |best, candidate| match best {
                Some((_, best_cost)) if best_cost <= candidate.1 => best,
                _ => Some(candidate),
            }),
        };

        match &chosen {
            Some((provider, cost)) => debug!(
                "Selected {} for {} (cheapest model ${:.4})",
                provider.id(),
                capability,
                cost
            ),
            None => debug!("No eligible provider for {}", capability),
        }
        chosen.map(|(provider, _)| provider)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn get_stats(&self) -> RegistryStats {
        let providers = self.providers.read().await;
        let mut stats = RegistryStats {
            total: providers.len(),
            ..Default::default()
        };

        for r in providers.iter() {
            match r.provider.provider_type() {
                ProviderType::Local => stats.local += 1,
                ProviderType::Remote => stats.remote += 1,
            }
            if r.available == Some(true) {
                stats.available += 1;
            }
            for capability in ProviderCapability::ALL {
                if r.serves(capability) {
                    *stats.by_capability.entry(capability).or_default() += 1;
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generative::mock::{MockModel, MockProvider};
    use crate::core::generative::Pricing;

    fn image_provider(id: &str, provider_type: ProviderType, cost: f64) -> Arc<dyn MediaProvider> {
        Arc::new(
            MockProvider::new(id)
                .with_type(provider_type)
                .with_model(
                    MockModel::new(format!("{id}-img"), ProviderCapability::TextToImage)
                        .with_pricing(Pricing::flat(cost)),
                ),
        )
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = ProviderRegistry::new();
        assert!(registry.register(image_provider("a", ProviderType::Remote, 0.1)).await);
        assert!(!registry.register(image_provider("a", ProviderType::Local, 0.1)).await);

        let provider = registry.get_provider("a").await.unwrap();
        assert_eq!(provider.provider_type(), ProviderType::Remote);
    }

    #[tokio::test]
    async fn test_register_forced_swaps_in_place() {
        let registry = ProviderRegistry::new();
        registry.register(image_provider("a", ProviderType::Remote, 0.1)).await;
        registry.register(image_provider("b", ProviderType::Remote, 0.1)).await;

        let old = registry
            .register_forced(image_provider("a", ProviderType::Local, 0.1))
            .await;
        assert!(old.is_some());

        let ids: Vec<String> = registry
            .providers()
            .await
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            registry.get_provider("a").await.unwrap().provider_type(),
            ProviderType::Local
        );
    }

    #[tokio::test]
    async fn test_capability_filter_requires_models() {
        let registry = ProviderRegistry::new();
        registry.register(image_provider("img", ProviderType::Remote, 0.1)).await;
        // declares text-to-image but ships no model for it
        registry
            .register(Arc::new(
                MockProvider::new("empty").with_capabilities(vec![ProviderCapability::TextToImage]),
            ))
            .await;

        let found = registry
            .get_providers_for_capability(ProviderCapability::TextToImage)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "img");
        assert!(registry
            .get_providers_for_capability(ProviderCapability::TextToVideo)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_registration_order_tie_break() {
        let registry = ProviderRegistry::new();
        registry.register(image_provider("first", ProviderType::Remote, 0.5)).await;
        registry.register(image_provider("second", ProviderType::Remote, 0.1)).await;

        let best = registry
            .find_best_provider(ProviderCapability::TextToImage, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(best.id(), "first");

        let cheapest = registry
            .find_best_provider(
                ProviderCapability::TextToImage,
                FindOptions::default().tie_break(TieBreak::CheapestFirst),
            )
            .await
            .unwrap();
        assert_eq!(cheapest.id(), "second");
    }

    #[tokio::test]
    async fn test_unavailable_providers_are_skipped() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(
                MockProvider::new("down")
                    .with_available(false)
                    .with_model(MockModel::new("m", ProviderCapability::TextToImage)),
            ))
            .await;
        registry.register(image_provider("up", ProviderType::Remote, 0.1)).await;

        let best = registry
            .find_best_provider(ProviderCapability::TextToImage, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(best.id(), "up");

        let stats = registry.get_stats().await;
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_unavailable() {
        let registry = ProviderRegistry::new().with_probe_timeout(Duration::from_millis(20));
        registry
            .register(Arc::new(
                MockProvider::new("slow")
                    .with_probe_delay(Duration::from_millis(500))
                    .with_model(MockModel::new("m", ProviderCapability::TextToImage)),
            ))
            .await;

        let availability = registry.refresh_availability().await;
        assert_eq!(availability, vec![("slow".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = ProviderRegistry::new();
        registry.register(image_provider("a", ProviderType::Local, 0.0)).await;
        registry.register(image_provider("b", ProviderType::Remote, 0.1)).await;

        let stats = registry.get_stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.local, 1);
        assert_eq!(stats.remote, 1);
        assert_eq!(stats.by_capability.get(&ProviderCapability::TextToImage), Some(&2));
        assert_eq!(stats.by_capability.get(&ProviderCapability::TextToSpeech), None);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ProviderRegistry::new();
        registry.register(image_provider("a", ProviderType::Local, 0.0)).await;
        assert!(registry.unregister("a").await);
        assert!(!registry.unregister("a").await);
        assert!(registry.get_provider("a").await.is_none());
    }
}
