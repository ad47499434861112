//! loragate gateway server.
//!
//! Wires configuration, device detection, the metadata store, the artifact
//! store and the HTTP layer together, then serves until SIGTERM/ctrl-c.

use anyhow::Result;
use clap::Parser;
use common::{GatewayConfig, MetadataTokenProvider};
use loragate_api::GatewayState;
use loragate_artifacts::{ArtifactStore, GcsClient};
use loragate_hardware::DeviceProfile;
use loragate_registry::{FirestoreStore, MemoryStore, MetadataStore};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "loragate-server")]
#[command(about = "Multi-tenant OpenAI-compatible inference gateway", version)]
struct CliArgs {
    /// Port to bind (overrides the PORT environment variable)
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Host address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loragate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    let mut config = GatewayConfig::from_env();
    config.port = args.port;
    config.host = args.host.clone();

    info!("starting loragate gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        bucket = %config.gcs_bucket,
        prefix = %config.gcs_model_prefix,
        mount = ?config.mount_path,
        cache = %config.local_model_cache.display(),
        "artifact configuration"
    );
    info!(
        require_auth = config.require_auth,
        local_dev = config.local_dev,
        max_concurrent = config.max_concurrent(),
        request_timeout_secs = config.request_timeout_secs,
        "request configuration"
    );

    let profile = DeviceProfile::detect();
    info!(device = %profile.kind, precision = %profile.precision, "selected device");

    let token = Arc::new(MetadataTokenProvider::new());

    let store: Arc<dyn MetadataStore> = match &config.gcp_project {
        Some(project) => {
            info!(project = %project, "using Firestore metadata store");
            Arc::new(FirestoreStore::new(project, token.clone()))
        }
        None => {
            warn!("no GCP project configured, using in-memory metadata store (local dev only)");
            Arc::new(MemoryStore::new())
        }
    };

    let gcs = Some(GcsClient::new(config.gcs_bucket.clone(), token));
    let artifact_store = Arc::new(ArtifactStore::new(&config, gcs)?);

    let state = Arc::new(GatewayState::build(config, store, artifact_store, profile));

    loragate_api::run_server(state, shutdown_signal()).await?;
    info!("shutdown complete");
    Ok(())
}
