//! CLI entry point for pairwise rank training.
//!
//! Subcommands:
//!   generate  -- Write a synthetic brightness-ranked dataset cache
//!   train     -- Train a ranker, report test accuracy, save a checkpoint
//!   eval      -- Load a checkpoint and report test accuracy

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use pairrank_core::{checkpoint_step, RankerConfig, RankerError};
use pairrank_model::{ConvExtractor, ConvExtractorConfig};
use pairrank_train::logging::init_logging;
use pairrank_train::{
    resolve_config, InMemoryPairDataset, JsonlSink, SyntheticSpec, TracingSink, Trainer,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pairrank", about = "Pairwise rank model training")]
struct Cli {
    /// YAML config file. Falls back to PAIRRANK_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct DataArgs {
    /// Dataset cache directory (items.safetensors + pairs.json).
    #[arg(long, conflicts_with = "synthetic")]
    data: Option<PathBuf>,

    /// Generate this many synthetic items instead of loading a cache.
    #[arg(long, default_value = "64")]
    synthetic: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Write a synthetic dataset cache.
    Generate {
        /// Output directory.
        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = "64")]
        items: usize,

        #[arg(long, default_value = "256")]
        train_pairs: usize,

        #[arg(long, default_value = "64")]
        test_pairs: usize,

        /// Image side length.
        #[arg(long, default_value = "8")]
        size: usize,
    },

    /// Train the ranker and save the head.
    Train {
        #[command(flatten)]
        data: DataArgs,

        /// Number of epochs.
        #[arg(long, default_value = "10")]
        epochs: usize,

        /// Checkpoint path. Defaults to one derived from the model identity.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Append metric points to this JSONL file instead of the log.
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Head checkpoint to continue training from.
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Step the resumed run continues from. Defaults to the `-iter:<step>`
        /// suffix of the `--resume` file name.
        #[arg(long, requires = "resume")]
        start_step: Option<u64>,
    },

    /// Evaluate a saved checkpoint.
    Eval {
        #[command(flatten)]
        data: DataArgs,

        /// Head checkpoint written by `train`.
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = resolve_config(cli.config.clone()).and_then(|(config, source)| {
        init_logging(&config.logging)?;
        tracing::info!(source = %source, "Loaded configuration");
        run(cli.command, config)
    });

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Command, config: RankerConfig) -> anyhow::Result<()> {
    match command {
        Command::Generate {
            output,
            items,
            train_pairs,
            test_pairs,
            size,
        } => {
            let spec = SyntheticSpec {
                items,
                train_pairs,
                test_pairs,
                size,
                ..Default::default()
            };
            let device = training_device();
            let dataset = InMemoryPairDataset::synthetic(spec, config.random_seed, &device)?;
            dataset.save(&output)?;
            println!(
                "Wrote {} items, {} train / {} test pairs to {}",
                items,
                train_pairs,
                test_pairs,
                output.display()
            );
            Ok(())
        }

        Command::Train {
            data,
            epochs,
            output,
            metrics,
            resume,
            start_step,
        } => {
            let mut trainer = build_trainer(&data, config)?;
            if let Some(checkpoint) = resume {
                let step = resume_step(&checkpoint, start_step)?;
                load_checkpoint(&mut trainer, &checkpoint)?;
                trainer = trainer.with_step(step);
            }
            match metrics {
                Some(path) => trainer.set_sink(Box::new(
                    JsonlSink::create(trainer.identity(), &path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                )),
                None => trainer.set_sink(Box::new(TracingSink::new(trainer.identity()))),
            }

            println!("Training {} for {epochs} epochs", trainer.identity());
            for (epoch, mean) in trainer.train_n_epochs(epochs)?.iter().enumerate() {
                println!("  epoch {:3} | mean_loss={:.4}", epoch + 1, mean);
            }
            report_accuracy(&trainer)?;

            let path = trainer.save(output.as_deref())?;
            let extractor_path = extractor_weights_path(&path);
            trainer.ranker().extractor().save(&extractor_path)?;
            println!("Head saved to: {}", path.display());
            println!("Extractor saved to: {}", extractor_path.display());
            Ok(())
        }

        Command::Eval { data, checkpoint } => {
            let mut trainer = build_trainer(&data, config)?;
            load_checkpoint(&mut trainer, &checkpoint)?;
            report_accuracy(&trainer)
        }
    }
}

/// CUDA, then Metal, then CPU. Each accelerator is only tried when the
/// matching cargo feature is compiled in.
fn training_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => return device,
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "CUDA device unavailable"),
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(e) => tracing::warn!(error = %e, "Metal device unavailable"),
        }
    }
    Device::Cpu
}

/// Step a resumed run continues from: `--start-step` when given, otherwise
/// the step encoded in the checkpoint name.
fn resume_step(checkpoint: &Path, start_step: Option<u64>) -> anyhow::Result<u64> {
    match start_step.or_else(|| checkpoint_step(checkpoint)) {
        Some(step) => Ok(step),
        None => anyhow::bail!(
            "Cannot tell which step {} was saved at; pass --start-step",
            checkpoint.display()
        ),
    }
}

/// Load the head and the extractor weights saved next to it.
fn load_checkpoint(
    trainer: &mut Trainer<ConvExtractor, InMemoryPairDataset>,
    checkpoint: &Path,
) -> anyhow::Result<()> {
    let extractor_path = extractor_weights_path(checkpoint);
    trainer
        .ranker_mut()
        .extractor_mut()
        .load(&extractor_path)
        .with_context(|| format!("Failed to load {}", extractor_path.display()))?;
    trainer.load(Some(checkpoint))?;
    Ok(())
}

fn build_trainer(
    data: &DataArgs,
    config: RankerConfig,
) -> anyhow::Result<Trainer<ConvExtractor, InMemoryPairDataset>> {
    let device = training_device();
    let dataset = match &data.data {
        Some(dir) => InMemoryPairDataset::load(dir, config.random_seed, &device)
            .with_context(|| format!("Failed to load dataset from {}", dir.display()))?,
        None => InMemoryPairDataset::synthetic(
            SyntheticSpec {
                items: data.synthetic,
                ..Default::default()
            },
            config.random_seed,
            &device,
        )?,
    };
    let in_channels = dataset.items().dim(1)?;
    let extractor = ConvExtractor::new(
        ConvExtractorConfig {
            in_channels,
            channel_mean: vec![0.5; in_channels],
            ..Default::default()
        },
        &device,
    )?;
    Ok(Trainer::new(extractor, dataset, config, &device)?)
}

fn report_accuracy(trainer: &Trainer<ConvExtractor, InMemoryPairDataset>) -> anyhow::Result<()> {
    match trainer.evaluate()?.accuracy() {
        Ok(accuracy) => println!("Test accuracy: {accuracy:.4}"),
        Err(e @ RankerError::NoEligiblePairs { .. }) => println!("Test accuracy: n/a ({e})"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// `<head>.safetensors` → `<head>.extractor.safetensors`
fn extractor_weights_path(head: &Path) -> PathBuf {
    head.with_extension("extractor.safetensors")
}
