//! Prediction server
//!
//! Resolves the active model once at startup (registry first, local
//! snapshots as fallback) and serves it over HTTP. Refuses to start when no
//! model can be resolved.

use anyhow::{Context, Result};
use lifecycle_lib::{
    audit::AuditLog,
    observability::{ServiceMetrics, StructuredLogger},
    predictor::PredictionService,
    registry,
    resolver::ModelResolver,
};
use prediction_server::{api, config::ServerSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Optional explicit config file; otherwise `lifecycle.*` in the working directory
const CONFIG_FILE_ENV: &str = "LIFECYCLE_CONFIG_FILE";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting prediction-server");

    let config_path = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
    let settings = ServerSettings::load(config_path.as_deref())?;
    let lifecycle = &settings.lifecycle;
    info!(
        registry = %lifecycle.registry.endpoint,
        model_name = %lifecycle.registry.model_name,
        snapshot_root = %lifecycle.snapshot_root.display(),
        "Server configured"
    );

    let logger = StructuredLogger::new("prediction-server");

    // A registry that cannot even be constructed is treated like an unreachable one
    let registry = match registry::connect(&lifecycle.registry) {
        Ok(registry) => Some(registry),
        Err(e) => {
            warn!(error = %e, "Registry client unavailable");
            None
        }
    };

    let resolver = ModelResolver::new(
        registry,
        lifecycle.registry.clone(),
        &lifecycle.snapshot_root,
        logger.clone(),
    );
    let model = match resolver.resolve_active_model().await {
        Ok(model) => Arc::new(model),
        Err(e) => {
            error!(error = %e, "No model could be resolved, refusing to serve");
            return Err(e.into());
        }
    };

    let audit = AuditLog::open(&settings.server.audit_log_path, &settings.server.audit_db_path)
        .context("Failed to open audit store")?;
    let metrics = ServiceMetrics::new();
    let service = Arc::new(PredictionService::new(
        model.clone(),
        Arc::new(audit),
        metrics.clone(),
        logger.clone(),
    ));

    logger.log_startup(SERVER_VERSION, &model.source.to_string());

    let app = api::create_router(api::AppState::new(service));
    let exporter = api::create_metrics_router(metrics);

    let api_handle = tokio::spawn(api::serve("api", settings.server.port, app));
    let metrics_handle = tokio::spawn(api::serve("metrics", settings.server.metrics_port, exporter));

    // Run until interrupted or a listener dies
    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            "SIGINT received".to_string()
        }
        result = api_handle => format!("API listener stopped: {:?}", result),
        result = metrics_handle => format!("Metrics listener stopped: {:?}", result),
    };

    logger.log_shutdown(&reason);
    info!("Shutting down");

    Ok(())
}
