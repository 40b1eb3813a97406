//! Sequential model chains and lineage replay.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::models::{Model, ModelInput};
use super::registry::ProviderRegistry;
use crate::core::media::MediaValue;
use crate::core::{CoreError, CoreResult, Options};

/// One step of a [`Pipeline`]
#[derive(Clone)]
pub struct PipelineStep {
    pub model: Arc<dyn Model>,
    pub options: Options,
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStep")
            .field("provider", &self.model.provider_id())
            .field("model", &self.model.descriptor().id)
            .field("options", &self.options)
            .finish()
    }
}

/// A failed step. `last_output` is the output of the previous step, with
/// the lineage of every step that succeeded.
#[derive(Debug, Error)]
#[error("Pipeline step {step} failed: {error}")]
pub struct PipelineFailure {
    pub step: usize,
    #[source]
    pub error: CoreError,
    pub last_output: Option<MediaValue>,
}

/// Ordered chain of models run strictly one after another
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, model: Arc<dyn Model>, options: Options) -> Self {
        self.steps.push(PipelineStep { model, options });
        self
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of step costs at each step's declared defaults merged with its options
    pub fn estimated_cost(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| {
                let descriptor = s.model.descriptor();
                let mut options = descriptor.default_options();
                options.extend(s.options.clone());
                s.model.cost(&options).unwrap_or(0.0)
            })
            .sum()
    }

    pub async fn run(&self, input: impl Into<ModelInput>) -> Result<MediaValue, PipelineFailure> {
        let mut current: Option<MediaValue> = None;
        let mut input = Some(input.into());

        for (index, step) in self.steps.iter().enumerate() {
            let step_input = match (input.take(), &current) {
                (Some(first), _) => first,
                (None, Some(previous)) => ModelInput::Value(previous.clone()),
                (None, None) => break,
            };
            debug!(
                "Pipeline step {} -> {}/{}",
                index,
                step.model.provider_id(),
                step.model.descriptor().id
            );

            match step.model.transform(step_input, &step.options).await {
                Ok(output) => current = Some(output),
                Err(error) => {
                    return Err(PipelineFailure {
                        step: index,
                        error,
                        last_output: current,
                    })
                }
            }
        }

        match (current, input) {
            (Some(output), _) => Ok(output),
            (None, Some(input)) => Ok(input.into_value()),
            (None, None) => Err(PipelineFailure {
                step: 0,
                error: CoreError::Internal("Pipeline produced no output".to_string()),
                last_output: None,
            }),
        }
    }
}

/// Re-runs the recorded chain of `asset` from its root.
///
/// Each step is resolved through the registry by its recorded provider and
/// model and invoked with the recorded options, seeds included. The result is
/// a new value with a fresh chain of the same length.
pub async fn replay(asset: &MediaValue, registry: &ProviderRegistry) -> CoreResult<MediaValue> {
    let chain = asset.history();
    let mut steps: Vec<_> = chain.clone().collect();
    steps.reverse();

    let mut current = chain.root().clone();
    for lineage in steps {
        let provider = registry
            .get_provider(lineage.provider())
            .await
            .ok_or_else(|| CoreError::ProviderNotFound(lineage.provider().to_string()))?;
        let model = provider.get_model(lineage.model())?;

        current = model
            .transform(ModelInput::Value(current), lineage.options())
            .await?;
    }

    info!(
        "Replayed {} steps for asset {} -> {}",
        asset.lineage_depth(),
        asset.id(),
        current.id()
    );
    Ok(current)
}
