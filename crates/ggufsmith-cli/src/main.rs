//! ggufsmith CLI.
//!
//! `ggufsmith run` (the default) executes the full release pipeline with
//! baked-in defaults; `ggufsmith publish` uploads previously produced
//! artifacts only, failing fast when none exist.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use ggufsmith::{run_pipeline, DirectoryHandle, HubClient, PipelineConfig, Publisher, StageStatus};

#[derive(Parser, Debug)]
#[command(name = "ggufsmith")]
#[command(about = "Merge, convert, quantize, and publish GGUF model releases")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline end-to-end (default)
    Run(PipelineArgs),
    /// Publish previously produced artifacts without re-running the pipeline
    Publish(PipelineArgs),
}

#[derive(Args, Debug, Default)]
struct PipelineArgs {
    /// Artifact tree root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Base model repository id
    #[arg(long)]
    base_model: Option<String>,

    /// Adapter repository id or local path
    #[arg(long)]
    adapter: Option<String>,

    /// Base name for produced GGUF files
    #[arg(long)]
    model_name: Option<String>,

    /// Destination Hub repository (owner/name)
    #[arg(long)]
    repo_id: Option<String>,

    /// Create the destination repository as private
    #[arg(long)]
    private: bool,

    /// Quantization kind to produce (repeatable; defaults to the
    /// recommended set)
    #[arg(long = "quant")]
    quants: Vec<String>,

    /// Worker bound for the quantization fan-out
    #[arg(long)]
    workers: Option<usize>,

    /// Hub API token (falls back to the HF_TOKEN environment variable)
    #[arg(long)]
    token: Option<String>,
}

impl PipelineArgs {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(base_model) = self.base_model {
            config.base_model_id = base_model;
        }
        if let Some(adapter) = self.adapter {
            config.adapter_id = adapter;
        }
        if let Some(model_name) = self.model_name {
            config.model_name = model_name;
        }
        if let Some(repo_id) = self.repo_id {
            config.repo_id = repo_id;
        }
        if self.private {
            config.private = true;
        }
        if !self.quants.is_empty() {
            config.quant_kinds = self.quants;
        }
        if let Some(workers) = self.workers {
            config.quantize_workers = workers.max(1);
        }
        config.hub_token = self.token.or_else(|| std::env::var("HF_TOKEN").ok());
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let command = cli.command.unwrap_or(Command::Run(PipelineArgs::default()));
    let code = match command {
        Command::Run(args) => run_full(args).await?,
        Command::Publish(args) => run_publish_only(args).await?,
    };
    std::process::exit(code);
}

async fn run_full(args: PipelineArgs) -> Result<i32> {
    let config = args.into_config();
    let registry = HubClient::new(config.hub_token.clone().unwrap_or_default())?;

    let report = run_pipeline(&config, &registry).await?;
    println!("{}", report.render());
    Ok(report.exit_code())
}

async fn run_publish_only(args: PipelineArgs) -> Result<i32> {
    let config = args.into_config();
    let token = config
        .hub_token
        .clone()
        .context("no Hub token configured (set HF_TOKEN or pass --token)")?;

    let layout = DirectoryHandle::ensure_layout(&config.root, &config.model_name)?;
    if !layout.has_gguf_artifacts() {
        anyhow::bail!(
            "No GGUF artifacts under {} — run `ggufsmith run` first",
            layout.gguf_dir().display()
        );
    }

    let registry = HubClient::new(token)?;
    let publisher = Publisher::new(&config, &registry);
    let report = publisher.publish(&layout).await?;

    println!("Published to {}:", report.repo_id);
    for file in &report.files {
        println!(
            "  {:<40} {:<9} {}",
            file.remote_path,
            file.status.to_string(),
            file.message.as_deref().unwrap_or("")
        );
    }
    println!(
        "{} uploaded, {} failed",
        report.succeeded_count(),
        report.failed_count()
    );

    let any_failed = report
        .files
        .iter()
        .any(|f| f.status == StageStatus::Failed);
    Ok(if any_failed { 2 } else { 0 })
}
