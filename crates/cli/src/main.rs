use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use vitlora_cli::commands;
use vitlora_cli::config::PipelineConfig;
use vitlora_cli::logging;

#[derive(Parser)]
#[command(
    name = "vitlora",
    version,
    about = "Train LoRA adapters on a frozen ViT backbone and compose them for inference"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file (default: ~/.config/vitlora/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backbone ID (HuggingFace Hub format) [default: google/vit-base-patch16-224-in21k]
    #[arg(long, global = true)]
    model: Option<String>,

    /// Local backbone directory (config.json, model.safetensors, preprocessor_config.json)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Compute device: cpu, cuda or cuda:N [default: cpu]
    #[arg(long, global = true)]
    device: Option<String>,

    /// Log level when RUST_LOG is unset [default: info]
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Train adapters for the configured (or selected) tasks
    Train {
        /// Task name or preset alias (model1/food101, model2/cats_vs_dogs); repeatable
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Override the number of epochs for every selected task
        #[arg(long)]
        epochs: Option<usize>,

        /// Directory receiving one artifact directory per task
        #[arg(long)]
        output_root: Option<PathBuf>,
    },

    /// Classify an image with a saved adapter
    Predict {
        /// Name to attach the adapter under
        #[arg(long)]
        task: String,

        /// Adapter artifact directory
        #[arg(long)]
        adapter: PathBuf,

        /// Image URL or local path
        #[arg(long)]
        image: String,

        /// Number of classes to print
        #[arg(long, default_value_t = 1)]
        top_k: usize,
    },

    /// Train both tasks, compose them and classify the sample images
    Demo {
        /// Override the number of epochs for every task
        #[arg(long)]
        epochs: Option<usize>,

        /// Food query image (URL or path)
        #[arg(long)]
        food_image: Option<String>,

        /// Cat query image (URL or path)
        #[arg(long)]
        cat_image: Option<String>,

        /// Directory receiving one artifact directory per task
        #[arg(long)]
        output_root: Option<PathBuf>,
    },

    /// Write a config file containing every default
    InitConfig {
        /// Destination (default: ~/.config/vitlora/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ─── Config: file first, CLI on top ─────────────────────────────────
    let config_path = cli.global.config.clone().or_else(PipelineConfig::default_path);
    let mut config = match &config_path {
        Some(path) if path.exists() => {
            let loaded = PipelineConfig::load_from(path)?;
            eprintln!("Loaded config from: {}", path.display());
            loaded
        }
        Some(path) if cli.global.config.is_some() => {
            anyhow::bail!("config file {} does not exist", path.display())
        }
        _ => PipelineConfig::default(),
    };

    let mut overrides = PipelineConfig {
        model: cli.global.model,
        model_dir: cli.global.model_dir,
        device: cli.global.device,
        log_level: cli.global.log_level,
        ..Default::default()
    };
    match &cli.command {
        Command::Train { output_root, .. } => overrides.output_root = output_root.clone(),
        Command::Demo {
            food_image,
            cat_image,
            output_root,
            ..
        } => {
            overrides.food_image = food_image.clone();
            overrides.cat_image = cat_image.clone();
            overrides.output_root = output_root.clone();
        }
        _ => {}
    }
    config.merge(&overrides);

    logging::init_with_level(config.log_level());

    // ─── Commands ───────────────────────────────────────────────────────
    match cli.command {
        Command::Train { tasks, epochs, .. } => {
            let selected = commands::select_tasks(&config, &tasks, epochs)?;
            for task in commands::train(&config, selected)? {
                println!(
                    "{}\taccuracy={:.4}\tartifact={}\tbytes={}",
                    task.name,
                    task.report.accuracy(),
                    task.artifact_dir.display(),
                    task.artifact_bytes
                );
            }
        }
        Command::Predict {
            task,
            adapter,
            image,
            top_k,
        } => {
            for prediction in commands::predict(&config, &task, &adapter, &image, top_k)? {
                println!("{}\t{:.4}", prediction.label, prediction.score);
            }
        }
        Command::Demo { epochs, .. } => {
            for result in commands::demo(&config, epochs)? {
                println!(
                    "{}\t{}\t{}\t{:.4}",
                    result.task, result.image, result.prediction.label, result.prediction.score
                );
            }
        }
        Command::InitConfig { path, force } => {
            let written = commands::init_config(path, force)?;
            println!("Wrote default config to {}", written.display());
        }
    }

    Ok(())
}
