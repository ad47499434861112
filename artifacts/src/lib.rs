//! Artifact store adapter for the loragate gateway.
//!
//! Model artifacts are directory trees produced by the fine-tuning job and
//! deposited in an object-store bucket (optionally mirrored by a mounted
//! filesystem). This crate locates a valid artifact directory for a logical
//! path, mirroring blobs into a local cache when no mount copy exists. The
//! gateway never writes artifacts; the fine-tune job is the only writer.

mod gcs;
mod store;

pub use gcs::GcsClient;
pub use store::{ArtifactStore, TrainingConfig};
