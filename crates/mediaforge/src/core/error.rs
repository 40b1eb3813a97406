//! Mediaforge Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

use super::media::MediaKind;
use super::{JobId, ModelId, ProviderId};

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Provider / Model Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(ProviderId),

    #[error("Model not found: {model_id} (provider: {provider_id})")]
    ModelNotFound {
        provider_id: ProviderId,
        model_id: ModelId,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transformation failed ({provider_id}/{model_id}): {message}")]
    TransformationFailed {
        provider_id: ProviderId,
        model_id: ModelId,
        message: String,
    },

    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Role not supported: cannot convert {from} to {to}")]
    RoleNotSupported { from: MediaKind, to: MediaKind },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Project Errors
    // =========================================================================
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    // =========================================================================
    // External Service Errors
    // =========================================================================
    #[error("FFmpeg service error: {0}")]
    FFmpegService(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable snake_case tag for the error variant
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Configuration(_) => "configuration",
            CoreError::ProviderNotFound(_) => "provider_not_found",
            CoreError::ModelNotFound { .. } => "model_not_found",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::TransformationFailed { .. } => "transformation_failed",
            CoreError::Timeout { .. } => "timeout",
            CoreError::RoleNotSupported { .. } => "role_not_supported",
            CoreError::JobNotFound(_) => "not_found",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::ProjectNotFound(_) => "project_not_found",
            CoreError::FFmpegService(_) => "ffmpeg_service",
            CoreError::NotSupported(_) => "not_supported",
            CoreError::ValidationError(_) => "validation",
            CoreError::IoError(_) => "io",
            CoreError::JsonError(_) => "json",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether the error was produced by an expired timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout { .. })
    }

    /// Wraps any error as a backend failure of the given model, keeping the
    /// message verbatim. Timeouts, cancellations and already-typed
    /// transformation errors pass through.
    pub fn into_transformation(self, provider_id: &str, model_id: &str) -> CoreError {
        match self {
            CoreError::TransformationFailed { .. }
            | CoreError::Timeout { .. }
            | CoreError::Cancelled(_) => self,
            other => CoreError::TransformationFailed {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
                message: other.to_string(),
            },
        }
    }
}
