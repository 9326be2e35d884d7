//! SegMix Semi-Supervised Segmentation CLI
//!
//! Entry point for training a segmentation network from a small labeled split
//! and a large unlabeled split with the Burn framework.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use segmix_ssl::backend::{backend_name, device_for_rank, TrainingBackend};
use segmix_ssl::config::SemiConfig;
use segmix_ssl::dataset::ids::rewrite_id_file;
use segmix_ssl::distributed::{run_local_workers, ProcessGroup, SingleProcess};
use segmix_ssl::model::SegmenterConfig;
use segmix_ssl::training::checkpoint::{model_from_bytes, model_to_bytes};
use segmix_ssl::training::{build_student, TrainingContext, TrainingData};
use segmix_ssl::utils::logging::{init_logging, LogConfig};

/// SegMix Semi-Supervised Semantic Segmentation
///
/// EMA teacher, confidence-gated pseudo-labels and CutMix over two unlabeled
/// streams, trained with Burn.
#[derive(Parser, Debug)]
#[command(name = "segmix_ssl")]
#[command(version)]
#[command(about = "Semi-supervised semantic segmentation with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the student/teacher pair
    Train {
        /// Run configuration (YAML, or TOML by extension)
        #[arg(long)]
        config: PathBuf,

        /// Id list of the labeled split
        #[arg(long)]
        labeled_id_path: PathBuf,

        /// Id list of the unlabeled split
        #[arg(long)]
        unlabeled_id_path: PathBuf,

        /// Directory for checkpoints and the event stream
        #[arg(long)]
        save_path: PathBuf,

        /// Device index of this worker
        #[arg(long = "local_rank", default_value = "0")]
        local_rank: usize,

        /// Rendezvous port (unused by in-process workers)
        #[arg(long, default_value = "10000")]
        port: u16,

        /// Number of in-process data-parallel workers
        #[arg(long, default_value = "1")]
        world_size: usize,
    },

    /// Rewrite a partition file to the plain dataset layout
    RewriteIds {
        /// Partition file to read
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the rewritten file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            labeled_id_path,
            unlabeled_id_path,
            save_path,
            local_rank,
            port: _,
            world_size,
        } => {
            let _ = init_logging(&LogConfig::for_workers(world_size, cli.verbose));
            print_banner();

            cmd_train(
                &config,
                &labeled_id_path,
                &unlabeled_id_path,
                &save_path,
                local_rank,
                world_size,
            )?;
        }

        Commands::RewriteIds { input, output } => {
            let _ = init_logging(&LogConfig::quiet());
            let count = rewrite_id_file(&input, &output)
                .with_context(|| format!("Failed to rewrite {}", input.display()))?;
            println!(
                "{} {} lines -> {}",
                "Rewrote".green().bold(),
                count,
                output.display()
            );
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +------------------------------------------------------------+
 |   SegMix Semi-Supervised Semantic Segmentation             |
 |   EMA teacher + CutMix pseudo-labels with Burn + Rust      |
 +------------------------------------------------------------+
  "#
        .green()
    );
    println!("  Backend: {}", backend_name().cyan());
    println!();
}

fn cmd_train(
    config_path: &Path,
    labeled_id_path: &Path,
    unlabeled_id_path: &Path,
    save_path: &Path,
    local_rank: usize,
    world_size: usize,
) -> Result<()> {
    if let Ok(env_world) = std::env::var("WORLD_SIZE") {
        let env_world: usize = env_world
            .trim()
            .parse()
            .with_context(|| format!("Invalid WORLD_SIZE '{env_world}'"))?;
        if env_world > 1 {
            bail!(
                "WORLD_SIZE={env_world}: multi-process launch is not supported, \
                 use --world-size to start in-process workers"
            );
        }
    }

    let cfg = SemiConfig::load(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    info!("Configuration:\n{}", cfg.to_yaml_string()?);

    let data = TrainingData::load(&cfg, labeled_id_path, unlabeled_id_path)
        .context("Failed to load dataset splits")?;

    if world_size > 1 {
        info!("Starting {} in-process workers", world_size);

        // Every worker starts from the same student
        let initial = build_student::<TrainingBackend>(&cfg, &device_for_rank(0))?;
        let bytes = model_to_bytes(&initial)?;
        drop(initial);

        let results = run_local_workers(world_size, |group| {
            let device = device_for_rank(group.rank());
            let model = SegmenterConfig::from_backbone(&cfg.backbone, cfg.nclass)?
                .init::<TrainingBackend>(&device);
            let student = model_from_bytes(model, bytes.clone(), &device)?;

            let mut ctx = TrainingContext::<TrainingBackend>::new(
                cfg.clone(),
                student,
                Box::new(group),
                save_path,
                device,
            )?;
            ctx.fit(&data)
        })
        .context("Training failed")?;

        if let Some(best) = results.first() {
            print_summary(*best, save_path);
        }
    } else {
        let device = device_for_rank(local_rank);
        let student = build_student::<TrainingBackend>(&cfg, &device)?;
        let mut ctx = TrainingContext::<TrainingBackend>::new(
            cfg,
            student,
            Box::new(SingleProcess),
            save_path,
            device,
        )?;
        let best = ctx.fit(&data).context("Training failed")?;
        print_summary(best, save_path);
    }

    Ok(())
}

fn print_summary(best_miou: f64, save_path: &Path) {
    println!();
    println!(
        "{} best mIoU {:.2}",
        "Training complete:".green().bold(),
        best_miou
    );
    println!("  Checkpoints in {}", save_path.display().to_string().cyan());
}
