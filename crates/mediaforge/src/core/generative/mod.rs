//! Generative Models and Providers
//!
//! Model and provider contracts, the provider registry, job tracking,
//! sequential pipelines and the concrete backend adapters.

pub mod jobs;
pub mod mock;
pub mod models;
pub mod pipeline;
pub mod provider_impls;
pub mod providers;
pub mod registry;

// Re-export main types
pub use jobs::{JobRecord, JobStatus, JobTracker};
pub use models::{
    CostScaling, Model, ModelInput, ModelLimits, ParamType, ParameterSpec, Pricing,
    ProviderModel,
};
pub use pipeline::{replay, Pipeline, PipelineFailure, PipelineStep};
pub use providers::{
    GenerationRequest, GenerationResult, GenerationSummary, HealthReport, HealthStatus,
    MediaProvider, ProviderCapability, ProviderConfig, ProviderType,
};
pub use registry::{
    cheapest_model, FindOptions, ProviderInfo, ProviderRegistry, RegistryStats, TieBreak,
};
