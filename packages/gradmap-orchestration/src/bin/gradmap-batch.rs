//! Gradmap batch CLI
//!
//! Runs one gradient-mapping job through the job registry and streams its
//! events to stdout.
//!
//! # Usage
//!
//! ```bash
//! # Map two images with the same gradient, four workers
//! cargo run --bin gradmap-batch --release -- \
//!     --input-root input --gradient-root gradients --output-root output \
//!     --task cat.png:warm/sunset.png --task dog.png:warm/sunset.png \
//!     --parallelism 4 --format jpeg --quality 85
//!
//! # Roots and worker counts from a YAML file
//! cargo run --bin gradmap-batch -- --config gradmap.yaml --task cat.png:sunset.png
//! ```
//!
//! Ctrl-C requests cancellation; tasks already running are allowed to finish.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use gradmap_core::{GradientMapTransform, OutputFormat, Quality};
use gradmap_orchestration::{
    EngineConfig, JobEvent, JobOptions, JobRegistry, JobStatus, OrchestratorError, TaskSpec,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gradmap-batch")]
#[command(about = "Apply gradient maps to a batch of images", long_about = None)]
struct Cli {
    /// YAML engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sandbox root for input images
    #[arg(long)]
    input_root: Option<PathBuf>,

    /// Sandbox root for gradient images
    #[arg(long)]
    gradient_root: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Worker threads for the batch
    #[arg(short, long)]
    parallelism: Option<usize>,

    /// Jobs allowed to run at once
    #[arg(long)]
    max_active_jobs: Option<usize>,

    /// Task as IMAGE:GRADIENT, relative to the sandbox roots (repeatable)
    #[arg(short, long = "task", value_name = "IMAGE:GRADIENT", required = true)]
    tasks: Vec<String>,

    /// Output format: png, jpeg or webp
    #[arg(short, long, default_value = "png")]
    format: OutputFormat,

    /// Encoder quality, 1-100 (JPEG only)
    #[arg(short, long, default_value = "95")]
    quality: u8,

    /// Prepended to every output name
    #[arg(long)]
    prefix: Option<String>,

    /// Appended to every output name
    #[arg(long)]
    suffix: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn parse_task(raw: &str) -> anyhow::Result<TaskSpec> {
    let (image, gradient) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("task '{}' is not IMAGE:GRADIENT", raw))?;
    if image.is_empty() || gradient.is_empty() {
        bail!("task '{}' is not IMAGE:GRADIENT", raw);
    }
    Ok(TaskSpec::new(image, gradient))
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(root) = &cli.input_root {
        config.input_root = root.clone();
    }
    if let Some(root) = &cli.gradient_root {
        config.gradient_root = root.clone();
    }
    if let Some(root) = &cli.output_root {
        config.output_root = root.clone();
    }
    if let Some(parallelism) = cli.parallelism {
        config = config.with_parallelism(parallelism);
    }
    if let Some(max_active_jobs) = cli.max_active_jobs {
        config = config.with_max_active_jobs(max_active_jobs);
    }

    config.validate()?;
    Ok(config)
}

fn print_event(event: &JobEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
        return;
    }
    match event {
        JobEvent::Progress {
            current,
            total,
            status,
            message,
            ..
        } => println!("[{}/{}] {} {}", current, total, status, message),
        JobEvent::Completed { download_ref, .. } => {
            println!("Job completed, download at {}", download_ref)
        }
        JobEvent::Cancelled { job_id } => println!("Job {} cancelled", job_id),
        JobEvent::Failed { message, .. } => println!("Job failed: {}", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let specs = cli
        .tasks
        .iter()
        .map(|raw| parse_task(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let options = JobOptions {
        output_format: cli.format,
        quality: Quality::new(cli.quality)?,
        prefix: cli.prefix.clone(),
        suffix: cli.suffix.clone(),
        parallelism: None,
    };

    let registry = JobRegistry::start(config, Arc::new(GradientMapTransform::new()))?;
    let job_id = registry.create(&specs, options)?;
    println!("Job {} queued with {} tasks", job_id, specs.len());

    let (sink, mut events) = mpsc::unbounded_channel::<JobEvent>();
    registry
        .subscribe(job_id, Arc::new(sink))
        .await
        .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, cli.json);
                if event.is_terminal() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                match signal {
                    Ok(()) if registry.cancel(job_id).await => {
                        info!("Cancellation requested, waiting for running tasks")
                    }
                    Ok(()) => warn!("Job {} is no longer cancellable", job_id),
                    Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                }
            }
        }
    }

    let snapshot = registry
        .status(job_id)
        .await
        .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
    println!(
        "Status: {} ({}/{} processed, {} errors)",
        snapshot.status, snapshot.current, snapshot.total, snapshot.error_count
    );

    let outputs = registry.outputs(job_id).await.unwrap_or_default();
    for path in &outputs {
        println!("  {}", path.display());
    }

    if snapshot.status != JobStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
