//! Gateway-wide error taxonomy.
//!
//! Every failure that can cross a component boundary is a `GatewayError`
//! variant; the API layer maps variants to HTTP statuses via
//! [`GatewayError::status_code`]. Auth errors carry no side effects; load and
//! generation errors have cleanup obligations documented on the components
//! that raise them.

use thiserror::Error;

/// Result alias used across the gateway crates.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No `Authorization: Bearer` header on a protected route.
    #[error("Missing Authorization header. Use: Authorization: Bearer <api_key>")]
    AuthMissing,

    /// Bearer token present but not `sk_`/`ak_` prefixed.
    #[error("Invalid API key format")]
    AuthMalformed,

    /// No active key matches the presented token.
    #[error("Invalid or inactive API key")]
    AuthInvalid,

    /// The key matched but its expiry has passed.
    #[error("API key has expired")]
    AuthExpired,

    /// The key is scoped to a different model.
    #[error("API key does not have access to model '{model}'")]
    ScopeDenied {
        /// The model that was requested
        model: String,
    },

    /// The metadata store has no usable active version for a custom model.
    #[error("cannot resolve active version for model '{model}': {reason}")]
    VersionUnresolved {
        /// The custom model name
        model: String,
        /// What was missing (document, activeVersionId, versionLabel, …)
        reason: String,
    },

    /// No artifact exists at the resolved location.
    #[error("model '{model}' not found in artifact store at {location}")]
    ArtifactNotFound {
        /// The model name
        model: String,
        /// The location that was probed
        location: String,
    },

    /// An artifact directory exists but fails the validity check.
    #[error("artifact for model '{model}' at {location} is not a valid model directory")]
    ArtifactInvalid {
        /// The model name
        model: String,
        /// The invalid directory
        location: String,
    },

    /// The ML framework failed to load weights or tokenizer.
    #[error("failed to load model '{model}': {reason}")]
    LoadFailed {
        /// The model name
        model: String,
        /// Underlying framework error text
        reason: String,
    },

    /// The framework reported an out-of-memory condition.
    #[error("out of memory while serving model '{model}': {reason}")]
    OutOfMemory {
        /// The model name
        model: String,
        /// Underlying framework error text
        reason: String,
    },

    /// The generation worker did not stop within the join deadline.
    #[error("generation worker for model '{model}' failed to stop within {seconds}s")]
    GenerationTimeout {
        /// The model name
        model: String,
        /// The join deadline that was breached
        seconds: u64,
    },

    /// A CUDA-class device fault during generation.
    #[error("GPU fault while serving model '{model}': {reason}")]
    GpuFault {
        /// The model name
        model: String,
        /// Underlying framework error text
        reason: String,
    },

    /// The metadata store could not be reached or returned garbage.
    #[error("Authentication service error: {0}")]
    MetadataStoreUnavailable(String),

    /// Malformed request body or unsupported parameter combination.
    #[error("{0}")]
    BadRequest(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthMissing | Self::AuthMalformed | Self::AuthInvalid | Self::AuthExpired => 401,
            Self::ScopeDenied { .. } => 403,
            Self::BadRequest(_) => 400,
            Self::VersionUnresolved { .. }
            | Self::ArtifactNotFound { .. }
            | Self::ArtifactInvalid { .. }
            | Self::LoadFailed { .. }
            | Self::OutOfMemory { .. }
            | Self::GenerationTimeout { .. }
            | Self::GpuFault { .. }
            | Self::MetadataStoreUnavailable(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Short stable identifier for logs and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthMalformed => "auth_malformed",
            Self::AuthInvalid => "auth_invalid",
            Self::AuthExpired => "auth_expired",
            Self::ScopeDenied { .. } => "scope_denied",
            Self::VersionUnresolved { .. } => "version_unresolved",
            Self::ArtifactNotFound { .. } => "artifact_not_found",
            Self::ArtifactInvalid { .. } => "artifact_invalid",
            Self::LoadFailed { .. } => "load_failed",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::GenerationTimeout { .. } => "generation_timeout",
            Self::GpuFault { .. } => "gpu_fault",
            Self::MetadataStoreUnavailable(_) => "metadata_store_unavailable",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error implicates a resident model that should be
    /// unloaded as part of recovery.
    pub fn implicates_model(&self) -> Option<&str> {
        match self {
            Self::OutOfMemory { model, .. }
            | Self::GenerationTimeout { model, .. }
            | Self::GpuFault { model, .. } => Some(model),
            _ => None,
        }
    }
}
