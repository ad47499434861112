//! Shared types and configuration for the loragate workspace.
//!
//! This crate sits near the bottom of the dependency hierarchy: it provides
//! the environment-driven gateway configuration, the model-name
//! classification used by the version resolver and artifact store, and the
//! GCP metadata-server token provider shared by the GCS and Firestore
//! clients.

pub mod config;
pub mod gcp;
pub mod model_name;

pub use config::GatewayConfig;
pub use gcp::MetadataTokenProvider;
pub use model_name::ModelName;
