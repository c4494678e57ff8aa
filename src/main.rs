//! Generative image inpainting trainer
//!
//! Main entry point providing CLI interface for:
//! - Training the inpainting GAN
//! - Writing a default configuration file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::info;

use rust_inpainter::{
    data::{BatchSource, BatchStream, CyclicSource, DataLoader, ImageDataset, Prefetcher},
    model::{InpaintModel, InpaintTrainer, ReplicaCoordinator},
    training::{CsvScalarWriter, TrainingLoop},
    utils::{logging::init_logging, Config},
};

/// Coarse-to-fine image inpainting with WGAN-GP
#[derive(Parser)]
#[command(name = "inpainter")]
#[command(version = "0.1.0")]
#[command(about = "Train a generative image inpainting model")]
struct Cli {
    /// Path to configuration file (.toml or .json)
    #[arg(short, long, default_value = "configs/default.toml")]
    config: String,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the inpainting model
    Train {
        /// Random seed, drawn from 1..=10000 when omitted
        #[arg(short, long)]
        seed: Option<u64>,

        /// Print the network layout before training
        #[arg(long)]
        print_net: bool,
    },

    /// Initialize default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "configs/default.toml")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { seed, print_net } => train(&cli.config, &cli.verbosity, seed, print_net),
        Commands::Init { output } => init_config(&output),
    }
}

/// Train the inpainting model
fn train(config_path: &str, verbosity: &str, seed: Option<u64>, print_net: bool) -> Result<()> {
    let config = Config::load(config_path).with_context(|| format!("loading {}", config_path))?;

    // Run directory holds the config copy, log, scalars, samples and checkpoints
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)?;
    copy_config(Path::new(config_path), &run_dir)?;
    init_logging(verbosity, Some(&run_dir.join("train.log")))?;

    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(1..=10000));
    tch::manual_seed(seed as i64);
    info!("Random seed: {} (pass --seed {} to resume this run reproducibly)", seed, seed);
    info!("Run directory: {}", run_dir.display());
    info!("Configuration: {:?}", config);

    let devices = config.devices()?;
    info!("Training on {:?}", devices);

    // Data
    let dataset = ImageDataset::new(&config.data)?;
    info!("Training set: {} images under {}", dataset.len(), dataset.root().display());
    let loader = DataLoader::new(dataset, config.data.batch_size, true, seed)?;
    let passes = config.train.niter as f64 / loader.num_batches() as f64;
    info!(
        "Batch size {}, {} iterations, about {:.1} passes over the data",
        config.data.batch_size, config.train.niter, passes
    );
    let batches: Box<dyn BatchStream> = if config.data.num_workers > 0 {
        Box::new(Prefetcher::new(loader, config.data.num_workers))
    } else {
        Box::new(CyclicSource::new(loader))
    };

    // Model
    let shared = Arc::new(config.clone());
    let model: Box<dyn InpaintModel> = if devices.len() > 1 {
        let coordinator = ReplicaCoordinator::new(shared, &devices)?;
        if print_net {
            info!("Networks:\n{}", coordinator.primary().describe());
        }
        Box::new(coordinator)
    } else {
        let device = devices.first().copied().unwrap_or(tch::Device::Cpu);
        let trainer = InpaintTrainer::new(shared, device)?;
        if print_net {
            info!("Networks:\n{}", trainer.describe());
        }
        Box::new(trainer)
    };

    let scalars = CsvScalarWriter::open(run_dir.join("scalars.csv"))?;

    let pb = ProgressBar::new(config.train.niter as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let mut training = TrainingLoop::new(&config, model, batches, scalars, run_dir, seed).with_progress(pb);
    let summary = training.run()?;

    info!(
        "Training complete at iteration {} ({} generator / {} critic updates)",
        summary.last_iteration, summary.generator_steps, summary.discriminator_steps
    );

    Ok(())
}

/// Keep a copy of the configuration next to the run's outputs
fn copy_config(config_path: &Path, run_dir: &Path) -> Result<()> {
    let name = config_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let target = run_dir.join(name);
    if target != config_path {
        std::fs::copy(config_path, &target)
            .with_context(|| format!("copying config to {}", target.display()))?;
    }
    Ok(())
}

/// Initialize default configuration file
fn init_config(output: &str) -> Result<()> {
    if let Some(parent) = Path::new(output).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let config = Config::default();
    config.save(output)?;
    println!("Created default configuration at {}", output);
    Ok(())
}
