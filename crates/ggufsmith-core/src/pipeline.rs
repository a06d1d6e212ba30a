//! Pipeline orchestration.
//!
//! Composes the stage runner, fan-out, and publisher into the fixed stage
//! order: provision → layout → merge → fetch-toolchain → convert →
//! build-toolchain-if-needed → quantize×N → publish. Required-stage
//! failure halts the run immediately; fan-out and publish failures are
//! collected into the report instead.
//!
//! All state lives in the artifact tree, so re-running the pipeline skips
//! whatever already exists and resumes from the first missing artifact.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::layout::DirectoryHandle;
use crate::provision::{EnvironmentHandle, Provisioner};
use crate::publish::{PublishReport, Publisher, RegistryApi};
use crate::quantize;
use crate::scripts;
use crate::stage::{OutputCheck, ProgressStyle, StageResult, StageRunner, StageSpec, StageStatus};
use crate::toolchain::Toolchain;

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Every stage, variant, and upload succeeded (or was validly skipped).
    Success,
    /// The spine completed but some variants or uploads failed.
    Partial,
    /// A required stage failed; later stages were never attempted.
    Failed,
}

impl std::fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The ordered stage results of one pipeline invocation.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub started_at: String,
    pub stages: Vec<StageResult>,
    pub variants: BTreeMap<String, StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishReport>,
    pub outcome: PipelineOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
}

impl PipelineReport {
    fn new() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            stages: Vec::new(),
            variants: BTreeMap::new(),
            publish: None,
            outcome: PipelineOutcome::Success,
            failed_stage: None,
        }
    }

    /// Record a stage result, updating the outcome on failure. Returns
    /// whether the pipeline may advance.
    fn record(&mut self, result: StageResult) -> bool {
        let ok = result.is_ok();
        if !ok {
            self.outcome = PipelineOutcome::Failed;
            self.failed_stage = Some(result.stage.clone());
        }
        self.stages.push(result);
        ok
    }

    /// Process exit code for this run: 0 full success, 2 partial,
    /// 1 required-stage failure.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            PipelineOutcome::Success => 0,
            PipelineOutcome::Partial => 2,
            PipelineOutcome::Failed => 1,
        }
    }

    /// Human-readable summary of the run.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Pipeline run started {}", self.started_at);
        let _ = writeln!(out);
        let _ = writeln!(out, "Stages:");
        for result in &self.stages {
            let _ = writeln!(
                out,
                "  {:<20} {:<9} {:>8.1}s  {}",
                result.stage,
                result.status.to_string(),
                result.elapsed_secs,
                result.message.as_deref().unwrap_or("")
            );
        }

        if !self.variants.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Quantization variants:");
            for (kind, result) in &self.variants {
                let _ = writeln!(
                    out,
                    "  {:<10} {:<9} {}",
                    kind,
                    result.status.to_string(),
                    result.message.as_deref().unwrap_or("")
                );
            }
        }

        if let Some(publish) = &self.publish {
            let _ = writeln!(out);
            let _ = writeln!(out, "Published to {}:", publish.repo_id);
            for file in &publish.files {
                let _ = writeln!(
                    out,
                    "  {:<40} {:<9} {}",
                    file.remote_path,
                    file.status.to_string(),
                    file.message.as_deref().unwrap_or("")
                );
            }
        }

        let _ = writeln!(out);
        match &self.failed_stage {
            Some(stage) => {
                let _ = writeln!(out, "Outcome: {} (stage '{}' failed)", self.outcome, stage);
            }
            None => {
                let _ = writeln!(out, "Outcome: {}", self.outcome);
            }
        }
        out
    }
}

/// Run stage specs in order, halting at the first failure.
///
/// Returns all results produced plus the name of the failed stage, if
/// any. Later specs are never attempted once one fails.
pub async fn run_stages(
    runner: &StageRunner,
    specs: Vec<StageSpec>,
) -> (Vec<StageResult>, Option<String>) {
    let mut results = Vec::new();
    let mut failed = None;

    for spec in specs {
        let result = runner.run(&spec).await;
        let halt = !result.is_ok();
        let name = result.stage.clone();
        results.push(result);
        if halt {
            failed = Some(name);
            break;
        }
    }

    (results, failed)
}

/// Build the merge stage: embedded script, explicit argv.
fn merge_stage(
    config: &PipelineConfig,
    env: &EnvironmentHandle,
    layout: &DirectoryHandle,
) -> StageSpec {
    StageSpec::new("merge-adapter", env.python())
        .arg(scripts::merge_script_path(layout.root()))
        .arg("--base-model")
        .arg(&config.base_model_id)
        .arg("--adapter")
        .arg(&config.adapter_id)
        .arg("--output-dir")
        .arg(layout.merged_dir())
        .output(OutputCheck::WeightsDir(layout.merged_dir()))
        .skip_if_done()
        .progress(ProgressStyle::JsonLines)
}

/// Build the F16 GGUF conversion stage.
fn convert_stage(
    env: &EnvironmentHandle,
    toolchain: &Toolchain,
    layout: &DirectoryHandle,
) -> StageSpec {
    StageSpec::new("convert-gguf", env.python())
        .arg(toolchain.convert_script())
        .arg(layout.merged_dir())
        .args(["--outtype", "f16"])
        .arg("--outfile")
        .arg(layout.full_precision_path())
        .output(OutputCheck::File(layout.full_precision_path()))
        .skip_if_done()
}

/// Execute the full release pipeline.
///
/// Returns `Ok` with the report even when stages fail; the report carries
/// the failure and the matching exit code. `Err` is reserved for
/// conditions where no report could be produced at all.
pub async fn run_pipeline(
    config: &PipelineConfig,
    registry: &dyn RegistryApi,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::new();
    let runner = StageRunner::new(config.stage_timeout);

    info!(
        "Starting release pipeline for {} (root {})",
        config.model_name,
        config.root.display()
    );

    // -- provision ----------------------------------------------------------
    let provisioner = Provisioner::new(&config.root);
    let already_provisioned = provisioner.is_provisioned();
    let started = Instant::now();
    let env = match provisioner.ensure_environment().await {
        Ok(env) => {
            let result = if already_provisioned {
                StageResult::skipped("provision", "environment already provisioned")
            } else {
                StageResult::succeeded("provision", started.elapsed(), None)
            };
            report.record(result);
            env
        }
        Err(e) => {
            error!("{e}");
            report.record(StageResult::failed("provision", e.to_string(), started.elapsed()));
            return Ok(report);
        }
    };

    // -- layout -------------------------------------------------------------
    let started = Instant::now();
    let layout = match DirectoryHandle::ensure_layout(&config.root, &config.model_name) {
        Ok(layout) => {
            report.record(StageResult::succeeded("layout", started.elapsed(), None));
            layout
        }
        Err(e) => {
            error!("{e}");
            report.record(StageResult::failed("layout", e.to_string(), started.elapsed()));
            return Ok(report);
        }
    };

    let toolchain = Toolchain::new(&config.root);

    // -- merge → fetch → convert (hard dependencies of everything below) ----
    let chain = vec![
        merge_stage(config, &env, &layout),
        toolchain.fetch_stage(),
        convert_stage(&env, &toolchain, &layout),
    ];
    let (results, failed) = run_stages(&runner, chain).await;
    for result in results {
        report.record(result);
    }
    if failed.is_some() {
        return Ok(report);
    }

    // -- toolchain build (the one branch point) -----------------------------
    // Single boolean guard evaluated once per run.
    if toolchain.is_built() {
        report.record(StageResult::skipped(
            "build-toolchain",
            "llama-quantize already built",
        ));
    } else {
        let (results, failed) = run_stages(
            &runner,
            vec![toolchain.configure_stage(), toolchain.compile_stage()],
        )
        .await;
        for result in results {
            report.record(result);
        }
        if failed.is_some() {
            return Ok(report);
        }
    }

    // -- quantize fan-out ---------------------------------------------------
    let variants = quantize::plan_variants(&layout, &config.quant_kinds);
    let results = quantize::quantize_all(
        &runner,
        &toolchain.quantize_binary(),
        &layout.full_precision_path(),
        &variants,
        config.quantize_workers,
    )
    .await;

    let failed_variants = results
        .values()
        .filter(|r| r.status == StageStatus::Failed)
        .count();
    let total_variants = results.len();
    report.variants = results;

    if total_variants > 0 && failed_variants == total_variants {
        error!("All {total_variants} quantization variants failed");
        report.outcome = PipelineOutcome::Failed;
        report.failed_stage = Some("quantize".to_string());
        return Ok(report);
    }
    if failed_variants > 0 {
        info!("Quantization partially succeeded: {failed_variants} of {total_variants} variants failed");
        report.outcome = PipelineOutcome::Partial;
    }

    // -- publish ------------------------------------------------------------
    let started = Instant::now();
    if config.hub_token.is_none() {
        report.record(StageResult::failed(
            "publish",
            "no Hub token configured (set HF_TOKEN or pass --token)",
            started.elapsed(),
        ));
        return Ok(report);
    }

    let publisher = Publisher::new(config, registry);
    match publisher.publish(&layout).await {
        Ok(publish_report) => {
            let message = format!(
                "{} uploaded, {} failed",
                publish_report.succeeded_count(),
                publish_report.failed_count()
            );
            if !publish_report.is_complete() && report.outcome == PipelineOutcome::Success {
                report.outcome = PipelineOutcome::Partial;
            }
            report.publish = Some(publish_report);
            report.stages.push(StageResult {
                stage: "publish".to_string(),
                status: StageStatus::Succeeded,
                message: Some(message),
                elapsed_secs: started.elapsed().as_secs_f64(),
                output_bytes: None,
            });
        }
        Err(e) => {
            error!("{e}");
            report.record(StageResult::failed("publish", e.to_string(), started.elapsed()));
        }
    }

    Ok(report)
}
