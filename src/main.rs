//! hearth - Local LLM serving daemon
//!
//! Hosts the model runtime: resident runner registry, VRAM-aware fit
//! prediction, and keep-alive driven eviction. The HTTP dispatch layer
//! and model pulling live in front of this binary; here the runtime can
//! be served, inspected, and exercised directly.
//!
//! ## Commands
//!
//! - `serve` - Run the serving daemon
//! - `devices` - Show discovered accelerators
//! - `estimate` - Predict whether a model fits in accelerator memory

use clap::{Parser, Subcommand};
use hearth::errors::display;
use hearth::sched::fit;
use hearth::{
    format_bytes, init_cli, init_daemon, ErrorContext, GpuDiscovery, ManifestLoader,
    MetadataLoader, ModelSpec, RunnerOptions, Scheduler, Settings, SystemDiscovery,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// hearth - local LLM serving daemon
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "Local LLM serving daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the serving daemon
    Serve {
        /// Log level override (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Show discovered accelerators
    Devices,

    /// Predict whether a model fits in accelerator memory
    Estimate {
        /// Path to the model manifest
        #[arg(short, long)]
        model: PathBuf,

        /// Context window to evaluate
        #[arg(long, default_value = "2048")]
        num_ctx: u64,

        /// Batch size to evaluate
        #[arg(long, default_value = "512")]
        num_batch: u64,

        /// Requested layer offload; -1 offloads as many as fit
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        num_gpu: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { log_level } => serve(log_level).await,
        Commands::Devices => devices(),
        Commands::Estimate {
            model,
            num_ctx,
            num_batch,
            num_gpu,
        } => estimate(model, num_ctx, num_batch, num_gpu).await,
    };

    if let Err(e) = result {
        display::print_error(&e);
        std::process::exit(1);
    }
}

async fn serve(log_level: Option<String>) -> hearth::Result<()> {
    let mut settings = Settings::load().context("loading daemon configuration")?;
    if let Some(level) = log_level {
        settings.log_level = level;
    }

    // the guard flushes buffered log lines when serve returns
    let _log_guard = match init_daemon(&settings, None) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("failed to initialize logging: {}", e);
            None
        }
    };

    let discovery = Arc::new(SystemDiscovery::new());
    for g in discovery.discover().iter() {
        info!(
            library = %g.library,
            id = %g.id,
            total = %format_bytes(g.total_memory),
            free = %format_bytes(g.free_memory),
            "accelerator"
        );
    }

    // The subprocess backend plugs in here; the mock backend keeps the
    // runtime serviceable (and CI-testable) on hosts without one.
    let scheduler = Scheduler::new(
        settings,
        discovery,
        Arc::new(ManifestLoader::new()),
        Arc::new(hearth::runner::mock::MockRunnerFactory::new()),
    );

    info!("hearth daemon started");

    let mut status = tokio::time::interval(Duration::from_secs(60));
    status.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = status.tick() => {
                info!(resident = scheduler.resident_count(), "runtime status");
            }
        }
    }

    scheduler.shutdown().await;
    info!("hearth daemon stopped");
    Ok(())
}

fn devices() -> hearth::Result<()> {
    let _ = init_cli("warn");

    let list = SystemDiscovery::new().discover();
    println!("{} accelerator(s) discovered", list.len());
    for g in list.iter() {
        println!(
            "  [{}] {}  total {}  free {}  overhead {}",
            g.library,
            g.id,
            format_bytes(g.total_memory),
            format_bytes(g.free_memory),
            format_bytes(g.minimum_memory),
        );
    }
    Ok(())
}

async fn estimate(
    model: PathBuf,
    num_ctx: u64,
    num_batch: u64,
    num_gpu: i64,
) -> hearth::Result<()> {
    let _ = init_cli("warn");

    let spec = ModelSpec::new(model);
    let metadata = ManifestLoader::new().load(&spec.path).await?;
    let gpus = SystemDiscovery::new().discover();

    let options = RunnerOptions {
        num_ctx,
        num_batch,
        num_gpu,
        ..Default::default()
    };

    let report = fit::predict_fit(&gpus, &metadata, &spec.projectors, &options);
    if gpus.by_library().is_empty() {
        error!("no accelerators visible; set HEARTH_MAX_VRAM to evaluate a hypothetical device");
    }

    println!("model:          {}", spec.short_name);
    println!("architecture:   {}", metadata.architecture);
    println!(
        "context:        {}",
        fit::effective_num_ctx(&options, &metadata, &spec.projectors)
    );
    println!("fits:           {}", report.fits);
    println!("fully offloads: {}", report.fully_offloaded);
    println!(
        "layers:         {} of {}",
        report.layer_count,
        metadata.block_count + 1
    );
    println!("estimated vram: {}", format_bytes(report.estimated_vram));

    Ok(())
}
