//! Registry and model resolution commands

use anyhow::{Context, Result};
use colored::Colorize;
use lifecycle_lib::{
    registry, LifecycleConfig, ModelResolver, ModelSource, Registrar, StructuredLogger,
};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    color_stage, print_info, print_json, print_success, print_table, truncate_id, OutputFormat,
};

/// Row for the versions table
#[derive(Tabled)]
struct VersionRow {
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Run")]
    run_id: String,
    #[tabled(rename = "Artifact")]
    artifact_path: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    source: String,
    origin: &'static str,
    model_type: String,
    feature_names: Vec<String>,
    classes: Vec<i64>,
    trained_at: String,
}

#[derive(Debug, Serialize)]
struct PromoteReport {
    model_name: String,
    version: u64,
    stage: String,
    archived: Vec<u64>,
}

/// Run the startup resolver and report where the model came from
pub async fn resolve(config: &LifecycleConfig, format: OutputFormat) -> Result<()> {
    let logger = StructuredLogger::new("cli");

    // Same degradation as the server: an unusable registry just means fallback
    let registry = match registry::connect(&config.registry) {
        Ok(registry) => Some(registry),
        Err(e) => {
            tracing::warn!(error = %e, "Registry client unavailable");
            None
        }
    };

    let resolver = ModelResolver::new(
        registry,
        config.registry.clone(),
        &config.snapshot_root,
        logger,
    );
    let model = resolver
        .resolve_active_model()
        .await
        .context("No model could be resolved")?;

    let report = ResolveReport {
        source: model.source.to_string(),
        origin: match model.source {
            ModelSource::Registry { .. } => "registry",
            ModelSource::Snapshot { .. } => "snapshot",
        },
        model_type: model.artifact.model_type.clone(),
        feature_names: model.artifact.feature_names.clone(),
        classes: model.artifact.classes().to_vec(),
        trained_at: model.artifact.trained_at.to_rfc3339(),
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Active Model".bold());
            println!("{}", "=".repeat(60));
            println!("Source:    {}", report.source.cyan());
            println!("Model:     {}", report.model_type);
            println!("Features:  {}", report.feature_names.join(", "));
            let classes: Vec<String> = report.classes.iter().map(i64::to_string).collect();
            println!("Classes:   {}", classes.join(", "));
            println!("Trained:   {}", report.trained_at);
            if report.origin == "snapshot" {
                println!();
                print_info("Resolved from a local snapshot; the registry had no usable version");
            }
        }
    }
    Ok(())
}

/// List registered versions, newest first
pub async fn versions(config: &LifecycleConfig, format: OutputFormat) -> Result<()> {
    let registry = registry::connect(&config.registry).context("Failed to connect to the model registry")?;
    let mut versions = registry
        .list_versions(&config.registry.model_name)
        .await
        .with_context(|| format!("Failed to list versions of {}", config.registry.model_name))?;
    versions.sort_by(|a, b| b.version.cmp(&a.version));

    match format {
        OutputFormat::Json => print_json(&versions)?,
        OutputFormat::Table => {
            let settings = &config.registry;
            let rows: Vec<VersionRow> = versions
                .iter()
                .map(|v| VersionRow {
                    version: v.version,
                    stage: v
                        .tag(&settings.stage_key)
                        .map(|s| color_stage(s, &settings.active_stage, &settings.archived_stage))
                        .unwrap_or_else(|| "-".to_string()),
                    run_id: truncate_id(&v.run_id),
                    artifact_path: v.artifact_path.clone(),
                    created_at: v.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();

            println!("{}", settings.model_name.bold());
            print_table(&rows, "No registered versions");
            if !rows.is_empty() {
                println!("\nTotal: {} versions", rows.len());
            }
        }
    }
    Ok(())
}

/// Move the active stage to `version`
pub async fn promote(config: &LifecycleConfig, version: u64, format: OutputFormat) -> Result<()> {
    let registry = registry::connect(&config.registry).context("Failed to connect to the model registry")?;
    let registrar = Registrar::new(
        registry,
        config.registry.clone(),
        &config.snapshot_root,
        StructuredLogger::new("cli"),
    );

    let archived = registrar
        .promote_version(version)
        .await
        .with_context(|| format!("Failed to promote version {}", version))?;

    let report = PromoteReport {
        model_name: config.registry.model_name.clone(),
        version,
        stage: config.registry.active_stage.clone(),
        archived,
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_success(&format!(
                "{} version {} is now {}",
                report.model_name, report.version, report.stage
            ));
            if !report.archived.is_empty() {
                let archived: Vec<String> = report.archived.iter().map(u64::to_string).collect();
                println!("Archived: {}", archived.join(", "));
            }
        }
    }
    Ok(())
}
