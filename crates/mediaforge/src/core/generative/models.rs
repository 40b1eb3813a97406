//! Model Contract
//!
//! A model is one invocable transformation bound to a provider and a model id.
//! [`ProviderModel`] describes it (parameters, pricing, limits); the [`Model`]
//! trait runs it. Implementors only write [`Model::invoke`]; the provided
//! [`Model::transform`] handles role resolution, validation, option
//! resolution, timeouts and lineage.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::providers::ProviderCapability;
use crate::core::lineage::GenerationLineage;
use crate::core::media::{Audio, Image, MediaKind, MediaValue, RawMedia, Text, Video};
use crate::core::roles::RoleResolver;
use crate::core::{CoreError, CoreResult, ModelId, Options, Size2D};

/// Default upper bound for one backend invocation
pub const DEFAULT_GENERATION_TIMEOUT_MS: u64 = 300_000;

// =============================================================================
// Parameter Schema
// =============================================================================

/// Parameter value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// One of a fixed set of strings
    Enum,
    /// Non-negative integer; synthesized when absent
    Seed,
}

/// Declared parameter of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    fn of(param_type: ParamType) -> Self {
        Self {
            param_type,
            required: false,
            default: None,
            min: None,
            max: None,
            options: Vec::new(),
            description: None,
        }
    }

    pub fn string() -> Self {
        Self::of(ParamType::String)
    }

    pub fn integer() -> Self {
        Self::of(ParamType::Integer)
    }

    pub fn number() -> Self {
        Self::of(ParamType::Number)
    }

    pub fn boolean() -> Self {
        Self::of(ParamType::Boolean)
    }

    pub fn seed() -> Self {
        Self::of(ParamType::Seed)
    }

    pub fn enumeration<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            options: choices.into_iter().map(Into::into).collect(),
            ..Self::of(ParamType::Enum)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checks a supplied value against type, range and choices
    pub fn validate(&self, name: &str, value: &Value) -> CoreResult<()> {
        let type_ok = match self.param_type {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Enum => value
                .as_str()
                .map(|s| self.options.iter().any(|o| o == s))
                .unwrap_or(false),
            ParamType::Seed => value.is_u64(),
        };
        if !type_ok {
            return Err(CoreError::InvalidInput(format!(
                "Parameter '{}' has invalid value {} (expected {:?}{})",
                name,
                value,
                self.param_type,
                if self.options.is_empty() {
                    String::new()
                } else {
                    format!(" in [{}]", self.options.join(", "))
                }
            )));
        }

        if let Some(n) = value.as_f64() {
            let below = self.min.is_some_and(|min| n < min);
            let above = self.max.is_some_and(|max| n > max);
            if below || above {
                return Err(CoreError::InvalidInput(format!(
                    "Parameter '{}' = {} is out of range [{}, {}]",
                    name,
                    n,
                    self.min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into()),
                    self.max.map(|v| v.to_string()).unwrap_or_else(|| "inf".into()),
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// How the base price scales with the request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CostScaling {
    #[default]
    Flat,
    /// Price is for `base` units of `param`; scales proportionally
    Linear { param: String, base: f64 },
}

/// Model pricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub input_cost: f64,
    pub output_cost: f64,
    pub currency: String,
    #[serde(default)]
    pub scaling: CostScaling,
}

impl Pricing {
    /// Flat price per invocation, in USD
    pub fn flat(cost: f64) -> Self {
        Self {
            input_cost: 0.0,
            output_cost: cost,
            currency: "USD".to_string(),
            scaling: CostScaling::Flat,
        }
    }

    /// `cost` per `base` units of `param` (e.g. $0.15 per 5 s of `duration`)
    pub fn linear(cost: f64, param: impl Into<String>, base: f64) -> Self {
        Self {
            scaling: CostScaling::Linear {
                param: param.into(),
                base,
            },
            ..Self::flat(cost)
        }
    }

    pub fn with_input_cost(mut self, cost: f64) -> Self {
        self.input_cost = cost;
        self
    }

    /// Deterministic cost for resolved options.
    ///
    /// A missing or non-numeric scaling parameter counts as one base unit.
    pub fn cost_for(&self, options: &Options) -> f64 {
        let factor = match &self.scaling {
            CostScaling::Flat => 1.0,
            CostScaling::Linear { param, base } if *base > 0.0 => options
                .get(param)
                .and_then(Value::as_f64)
                .map(|units| units / base)
                .unwrap_or(1.0),
            CostScaling::Linear { .. } => 1.0,
        };
        let cost = (self.input_cost + self.output_cost) * factor;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }
}

/// Input/output limits of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLimits {
    pub max_input_chars: Option<usize>,
    pub max_duration_sec: Option<f64>,
    pub max_resolution: Option<Size2D>,
}

impl ModelLimits {
    /// Rejects inputs the backend would refuse anyway
    pub fn check(&self, input: &MediaValue) -> CoreResult<()> {
        if let (Some(max), MediaValue::Text(text)) = (self.max_input_chars, input) {
            if text.char_count() > max {
                return Err(CoreError::InvalidInput(format!(
                    "Text input has {} characters (limit {})",
                    text.char_count(),
                    max
                )));
            }
        }

        let duration = match input {
            MediaValue::Audio(a) => a.duration_sec(),
            MediaValue::Video(v) => v.duration_sec(),
            _ => None,
        };
        if let (Some(max), Some(duration)) = (self.max_duration_sec, duration) {
            if duration > max {
                return Err(CoreError::InvalidInput(format!(
                    "Input duration {:.2}s exceeds limit {:.2}s",
                    duration, max
                )));
            }
        }

        let dims = match input {
            MediaValue::Image(i) => i.dimensions(),
            MediaValue::Video(v) => v.dimensions(),
            _ => None,
        };
        if let (Some(max), Some(dims)) = (self.max_resolution, dims) {
            if dims.width > max.width || dims.height > max.height {
                return Err(CoreError::InvalidInput(format!(
                    "Input resolution {} exceeds limit {}",
                    dims, max
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// ProviderModel
// =============================================================================

/// Static description of a model in a provider's catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderModel {
    pub id: ModelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: Vec<ProviderCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ModelLimits>,
}

impl ProviderModel {
    pub fn new(
        id: impl Into<ModelId>,
        name: impl Into<String>,
        capabilities: Vec<ProviderCapability>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            capabilities,
            parameters: BTreeMap::new(),
            pricing: None,
            limits: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_limits(mut self, limits: ModelLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn supports(&self, capability: ProviderCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Merges caller options over declared defaults.
    ///
    /// Every declared parameter appears in the result: supplied values are
    /// validated, absent ones take their default, absent seeds are synthesized
    /// and absent optional parameters without a default are an explicit null.
    /// Undeclared caller options pass through unchanged.
    pub fn resolve_options(&self, options: &Options) -> CoreResult<Options> {
        let mut resolved = Options::new();

        for (name, spec) in &self.parameters {
            let value = match options.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    spec.validate(name, value)?;
                    value.clone()
                }
                None => match (&spec.default, spec.param_type) {
                    (Some(default), _) => default.clone(),
                    (None, ParamType::Seed) => Value::from(rand::random::<u32>()),
                    (None, _) if spec.required => {
                        return Err(CoreError::InvalidInput(format!(
                            "Missing required parameter '{}' for model {}",
                            name, self.id
                        )))
                    }
                    (None, _) => Value::Null,
                },
            };
            resolved.insert(name.clone(), value);
        }

        for (name, value) in options {
            if !resolved.contains_key(name) {
                resolved.insert(name.clone(), value.clone());
            }
        }

        Ok(resolved)
    }

    /// Declared defaults only, for estimates made before a request exists
    pub fn default_options(&self) -> Options {
        self.parameters
            .iter()
            .filter_map(|(name, spec)| Some((name.clone(), spec.default.clone()?)))
            .collect()
    }

    /// Cost for already-resolved options; `None` when the model has no pricing
    pub fn cost_for(&self, resolved: &Options) -> Option<f64> {
        self.pricing.as_ref().map(|p| p.cost_for(resolved))
    }
}

// =============================================================================
// Model Input
// =============================================================================

/// Input accepted by [`Model::transform`]; bare strings become text values
#[derive(Debug, Clone)]
pub enum ModelInput {
    Value(MediaValue),
    Text(String),
}

impl ModelInput {
    pub fn into_value(self) -> MediaValue {
        match self {
            ModelInput::Value(value) => value,
            ModelInput::Text(content) => MediaValue::from(Text::new(content)),
        }
    }
}

impl From<MediaValue> for ModelInput {
    fn from(value: MediaValue) -> Self {
        ModelInput::Value(value)
    }
}

impl From<&MediaValue> for ModelInput {
    fn from(value: &MediaValue) -> Self {
        ModelInput::Value(value.clone())
    }
}

impl From<String> for ModelInput {
    fn from(value: String) -> Self {
        ModelInput::Text(value)
    }
}

impl From<&str> for ModelInput {
    fn from(value: &str) -> Self {
        ModelInput::Text(value.to_string())
    }
}

macro_rules! model_input_from_asset {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ModelInput {
            fn from(value: $ty) -> Self {
                ModelInput::Value(MediaValue::from(value))
            }
        })*
    };
}

model_input_from_asset!(Text, Image, Audio, Video);

// =============================================================================
// Model Trait
// =============================================================================

/// An invocable transformation
#[async_trait]
pub trait Model: Send + Sync {
    fn descriptor(&self) -> &ProviderModel;

    fn provider_id(&self) -> &str;

    /// The transformation this model performs
    fn capability(&self) -> ProviderCapability;

    fn input_kind(&self) -> MediaKind {
        self.capability().input_kind()
    }

    fn output_kind(&self) -> MediaKind {
        self.capability().output_kind()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_GENERATION_TIMEOUT_MS)
    }

    /// Conversions applied when the input is not natively of `input_kind`
    fn role_resolver(&self) -> Option<&RoleResolver> {
        None
    }

    /// Calls the backend with a validated input and fully resolved options
    async fn invoke(&self, input: &MediaValue, options: &Options) -> CoreResult<RawMedia>;

    /// Cost of one invocation with resolved options
    fn cost(&self, options: &Options) -> Option<f64> {
        self.descriptor().cost_for(options)
    }

    fn currency(&self) -> Option<&str> {
        self.descriptor().pricing.as_ref().map(|p| p.currency.as_str())
    }

    /// Runs the model and returns a new value carrying a lineage step
    async fn transform(&self, input: ModelInput, options: &Options) -> CoreResult<MediaValue> {
        let input = input.into_value();
        let expected = self.input_kind();

        let input = match self.role_resolver() {
            Some(resolver) => resolver.resolve_kind(&input, expected, None).await?,
            None if input.can_play_role(expected) => input,
            None => {
                return Err(CoreError::RoleNotSupported {
                    from: input.kind(),
                    to: expected,
                })
            }
        };

        if !input.is_valid() {
            return Err(CoreError::InvalidInput(format!(
                "{} input {} is empty",
                input.kind(),
                input.id()
            )));
        }

        let descriptor = self.descriptor();
        if let Some(limits) = &descriptor.limits {
            limits.check(&input)?;
        }
        let resolved = descriptor.resolve_options(options)?;

        let timeout = self.timeout();
        let raw = match tokio::time::timeout(timeout, self.invoke(&input, &resolved)).await {
            Ok(result) => {
                result.map_err(|e| e.into_transformation(self.provider_id(), &descriptor.id))?
            }
            Err(_) => {
                return Err(CoreError::Timeout {
                    operation: format!("{}/{}", self.provider_id(), descriptor.id),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        let output = raw
            .into_value(self.output_kind())
            .await
            .map_err(|e| e.into_transformation(self.provider_id(), &descriptor.id))?;

        let source = input.source_asset().cloned();
        let lineage = GenerationLineage::new(self.provider_id(), &descriptor.id, resolved, input);
        Ok(output.with_lineage(lineage).with_source_asset(source))
    }
}
