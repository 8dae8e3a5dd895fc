//! Change detection and retraining commands

use anyhow::{Context, Result};
use colored::Colorize;
use lifecycle_lib::{
    dataset::NoopDataSource, ChangeCheck, ChangeDetector, LifecycleConfig, PipelineOutcome,
    Promotion, RetrainPipeline, StructuredLogger,
};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    color_score, color_status, print_info, print_json, print_success, print_table,
    print_warning, truncate_id, OutputFormat,
};

/// Serializable view of a change check
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub dataset: String,
    pub status: &'static str,
    pub changed: bool,
    pub digest: Option<String>,
    pub previous: Option<String>,
    pub committed: bool,
}

impl CheckReport {
    fn new(config: &LifecycleConfig, check: &ChangeCheck) -> Self {
        Self {
            dataset: config.dataset_path.display().to_string(),
            status: check.status.as_str(),
            changed: check.changed(),
            digest: check.fingerprint.as_ref().map(|f| f.digest.clone()),
            previous: check.fingerprint.as_ref().and_then(|f| f.previous.clone()),
            committed: check.committed,
        }
    }
}

/// Row for the candidates table
#[derive(Debug, Serialize, Tabled)]
struct CandidateRow {
    #[tabled(rename = "Model")]
    model_type: String,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "Weighted F1")]
    weighted_f1: String,
    #[tabled(rename = "Run")]
    run_id: String,
    #[tabled(rename = "Selected")]
    selected: String,
}

#[derive(Debug, Serialize)]
struct CandidateReport {
    model_type: String,
    accuracy: f64,
    weighted_f1: f64,
    run_id: String,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct PromotionReport {
    model_name: String,
    version: u64,
    run_id: String,
    model_type: String,
    metric: &'static str,
    metric_value: f64,
    snapshot_dir: String,
    archived: Vec<u64>,
}

impl From<&Promotion> for PromotionReport {
    fn from(p: &Promotion) -> Self {
        Self {
            model_name: p.model_name.clone(),
            version: p.version,
            run_id: p.run_id.clone(),
            model_type: p.model_type.clone(),
            metric: p.metric.as_str(),
            metric_value: p.metric_value,
            snapshot_dir: p.snapshot_dir.display().to_string(),
            archived: p.archived.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RetrainReport {
    outcome: &'static str,
    check: CheckReport,
    candidates: Vec<CandidateReport>,
    promotion: Option<PromotionReport>,
}

/// Compare the dataset against the hash store without recording anything,
/// so a following `retrain` still sees the change.
pub fn check(config: &LifecycleConfig, format: OutputFormat) -> Result<()> {
    let detector = ChangeDetector::new(
        &config.hash_store_path,
        config.hash_commit,
        Box::new(NoopDataSource),
    );
    let check = detector
        .peek(&config.dataset_path)
        .context("Change detection failed")?;

    let report = CheckReport::new(config, &check);
    StructuredLogger::new("cli").log_data_check(
        &report.dataset,
        report.status,
        report.digest.as_deref(),
        report.changed,
    );

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_check(&report),
    }
    Ok(())
}

fn print_check(report: &CheckReport) {
    println!("{}", "Dataset Check".bold());
    println!("{}", "=".repeat(60));
    println!("Dataset:   {}", report.dataset.cyan());
    println!("Status:    {}", color_status(report.status));
    if let Some(digest) = &report.digest {
        println!("Digest:    {}", digest);
    }
    if let Some(previous) = &report.previous {
        println!("Previous:  {}", previous);
    }
    println!();

    if report.changed {
        print_warning("Dataset changed, retraining is warranted");
    } else {
        print_success("Dataset unchanged");
    }
}

/// Run one retraining cycle
pub async fn retrain(config: LifecycleConfig, force: bool, format: OutputFormat) -> Result<()> {
    let pipeline =
        RetrainPipeline::connect(config).context("Failed to connect to the model registry")?;
    let outcome = pipeline.run(force).await.context("Retraining failed")?;

    let report = match &outcome {
        PipelineOutcome::Skipped { check } => RetrainReport {
            outcome: "skipped",
            check: CheckReport::new(pipeline.config(), check),
            candidates: Vec::new(),
            promotion: None,
        },
        PipelineOutcome::Promoted {
            check,
            candidates,
            promotion,
        } => RetrainReport {
            outcome: "promoted",
            check: CheckReport::new(pipeline.config(), check),
            candidates: candidates
                .iter()
                .map(|c| CandidateReport {
                    model_type: c.model_type.clone(),
                    accuracy: c.accuracy,
                    weighted_f1: c.weighted_f1,
                    run_id: c.run_id.clone(),
                    selected: c.run_id == promotion.run_id,
                })
                .collect(),
            promotion: Some(PromotionReport::from(promotion)),
        },
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_retrain(&report),
    }
    Ok(())
}

fn print_retrain(report: &RetrainReport) {
    let Some(promotion) = &report.promotion else {
        print_info(&format!(
            "Dataset {} ({}), nothing to retrain. Use --force to retrain anyway",
            report.check.status, report.check.dataset
        ));
        return;
    };

    let rows: Vec<CandidateRow> = report
        .candidates
        .iter()
        .map(|c| CandidateRow {
            model_type: c.model_type.clone(),
            accuracy: color_score(c.accuracy),
            weighted_f1: color_score(c.weighted_f1),
            run_id: truncate_id(&c.run_id),
            selected: if c.selected { "✓".green().to_string() } else { String::new() },
        })
        .collect();
    print_table(&rows, "No candidates trained");
    println!();

    print_success(&format!(
        "Promoted {} as {} version {} ({} = {:.4})",
        promotion.model_type.cyan(),
        promotion.model_name,
        promotion.version,
        promotion.metric,
        promotion.metric_value
    ));
    println!("Snapshot: {}", promotion.snapshot_dir);
    if !promotion.archived.is_empty() {
        let archived: Vec<String> = promotion.archived.iter().map(u64::to_string).collect();
        println!("Archived: {}", archived.join(", "));
    }
}
