//! volseg CLI - sliding-window 3D segmentation evaluation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{module::Module, tensor::backend::Backend};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use volseg::config;
use volseg::data::synthetic::{write_synthetic_dataset, SyntheticConfig};
use volseg::evaluation::{evaluate_checkpoint, EngineState, EvaluationSettings};
use volseg::nn::gpu::{ComputeDevice, DevicePreference};
use volseg::nn::persistence::save_checkpoint;
use volseg::nn::UNetConfig;
use volseg::{CpuBackend, GpuBackend};

#[derive(Parser)]
#[command(name = "volseg")]
#[command(about = "Sliding-window 3D U-Net segmentation evaluation", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (including dependencies)
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random sphere volumes with matching labels
    Synth {
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Number of image/label pairs
        #[arg(short = 'n', long, default_value_t = config::SYNTH_NUM_VOLUMES)]
        count: usize,

        /// Edge length of the cubic volumes
        #[arg(long, default_value_t = config::SYNTH_VOLUME_SIZE)]
        size: usize,

        /// Number of label classes
        #[arg(long, default_value_t = config::SYNTH_SEG_CLASSES)]
        classes: usize,

        #[arg(long, default_value_t = config::SYNTH_SEED)]
        seed: u64,
    },

    /// Write a randomly initialised U-Net checkpoint
    InitCheckpoint {
        /// Checkpoint base path (`.mpk.gz` and `.json` are added)
        #[arg(default_value = config::DEFAULT_CHECKPOINT)]
        path: PathBuf,

        #[arg(long, default_value_t = config::SYNTH_SEED)]
        seed: u64,
    },

    /// Evaluate a checkpoint over a directory of volumes
    Evaluate {
        /// Directory with im*.nii.gz images and seg*.nii.gz labels;
        /// synthetic volumes are generated in a temporary directory when omitted
        #[arg(long)]
        data: Option<PathBuf>,

        #[arg(short, long, default_value = config::DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,

        /// Where segmentations are written
        #[arg(short, long, default_value = config::DEFAULT_OUTPUT_DIR)]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
        device: DeviceArg,

        /// Windows per network call
        #[arg(long, default_value_t = config::SW_BATCH_SIZE)]
        sw_batch_size: usize,

        /// Edge length of the cubic inference window
        #[arg(long, default_value_t = config::ROI_SIZE[0])]
        roi: usize,

        /// Data loader worker threads (0 loads on the main thread)
        #[arg(long, default_value_t = config::LOADER_NUM_WORKERS)]
        workers: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
    Gpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Gpu => DevicePreference::Gpu,
        }
    }
}

fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        "debug"
    } else if verbose {
        "volseg=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    info!("volseg v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Synth {
            output,
            count,
            size,
            classes,
            seed,
        } => {
            let synth = SyntheticConfig {
                num_seg_classes: classes,
                ..Default::default()
            };
            cmd_synth(&output, count, size, &synth, seed)?;
        }
        Commands::InitCheckpoint { path, seed } => {
            cmd_init_checkpoint(&path, seed)?;
        }
        Commands::Evaluate {
            data,
            checkpoint,
            output,
            device,
            sw_batch_size,
            roi,
            workers,
        } => {
            let settings = EvaluationSettings {
                data_dir: PathBuf::new(),
                checkpoint,
                output_dir: output,
                roi_size: vec![roi; 3],
                sw_batch_size,
                num_workers: workers,
            };
            cmd_evaluate(data, settings, device.into())?;
        }
    }

    Ok(())
}

fn cmd_synth(
    output: &Path,
    count: usize,
    size: usize,
    synth: &SyntheticConfig,
    seed: u64,
) -> Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    write_synthetic_dataset(output, count, size, synth, seed)
        .context("Failed to generate synthetic volumes")?;
    println!("Wrote {} image/label pairs to {}", count, output.display());
    Ok(())
}

fn cmd_init_checkpoint(path: &Path, seed: u64) -> Result<()> {
    CpuBackend::seed(seed);
    let model_config = UNetConfig::default();
    let model = model_config.init::<CpuBackend>(&Default::default())?;
    info!("Initialised U-Net with {} parameters", model.num_params());

    save_checkpoint(&model, &model_config, path)
        .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
    println!("Checkpoint written to {}", path.display());
    Ok(())
}

fn cmd_evaluate(
    data: Option<PathBuf>,
    mut settings: EvaluationSettings,
    preference: DevicePreference,
) -> Result<()> {
    // kept alive until the evaluation finishes
    let scratch = match data {
        Some(dir) => {
            settings.data_dir = dir;
            None
        }
        None => {
            let dir = tempfile::tempdir().context("Failed to create temporary directory")?;
            let synth = SyntheticConfig {
                num_seg_classes: config::SYNTH_SEG_CLASSES,
                ..Default::default()
            };
            write_synthetic_dataset(
                dir.path(),
                config::SYNTH_NUM_VOLUMES,
                config::SYNTH_VOLUME_SIZE,
                &synth,
                config::SYNTH_SEED,
            )
            .context("Failed to generate synthetic volumes")?;
            settings.data_dir = dir.path().to_path_buf();
            Some(dir)
        }
    };

    let device = preference.resolve();
    info!("Running on {}", device);
    let state = match device {
        ComputeDevice::Cpu => run_evaluation::<CpuBackend>(&settings)?,
        ComputeDevice::Gpu => run_evaluation::<GpuBackend>(&settings)?,
    };

    for (name, value) in &state.metrics {
        println!("{}: {:.4}", name, value);
    }
    println!(
        "Evaluated {} volume(s) in {:.2}s, segmentations in {}",
        state.items,
        state.elapsed().as_secs_f64(),
        settings.output_dir.display()
    );

    drop(scratch);
    Ok(())
}

fn run_evaluation<B: Backend>(settings: &EvaluationSettings) -> Result<EngineState> {
    let device = B::Device::default();
    evaluate_checkpoint::<B>(settings, &device).with_context(|| {
        format!(
            "Evaluation of checkpoint {} failed",
            settings.checkpoint.display()
        )
    })
}
