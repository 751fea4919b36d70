use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dlt_lib::configs::TrainConfig;
use dlt_lib::datasets::{Dataset, FolderDataset};
use dlt_lib::models::Regressor;
use dlt_lib::trainer::{Datasets, RegressionTrainer, Trainer};

#[derive(Parser, Debug)]
#[command(name = "dlt", version, about = "Regression training harness", long_about = None)]
struct Cli {
    /// -v for debug, -vv for trace; RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a regressor, then evaluate the best checkpoint on the test split
    Train {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Evaluate a checkpoint on the test split
    Test {
        #[arg(short, long)]
        config: PathBuf,
        /// defaults to best_ckpt.pth of the experiment
        #[arg(long)]
        ckpt: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(cli.command) {
        if let Some(dlt_lib::Error::InsufficientMemory { .. }) = e.downcast_ref::<dlt_lib::Error>()
        {
            error!("{e}");
            process::exit(-1);
        }
        return Err(e);
    }
    Ok(())
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Train { config } => {
            let mut trainer = build_trainer(&config)?;
            trainer.train().context("training failed")?;
        }
        Command::Test { config, ckpt } => {
            let mut trainer = build_trainer(&config)?;
            let score = match ckpt {
                Some(path) => {
                    trainer
                        .load_weights(&path)
                        .with_context(|| format!("cannot load {}", path.display()))?;
                    trainer.evaluate_test()?
                }
                None => trainer.test_model()?,
            };
            info!("test {}: {score:.6}", trainer.metrics()[0]);
        }
    }
    Ok(())
}

fn build_trainer(config: &Path) -> Result<RegressionTrainer<Regressor>> {
    let cfg = TrainConfig::from_file(config)
        .with_context(|| format!("cannot read config {}", config.display()))?;
    let split = |dir: &Option<PathBuf>| -> Result<Option<Arc<dyn Dataset>>> {
        match dir {
            Some(dir) => {
                let ds = FolderDataset::new(dir, cfg.data.img_size, cfg.data.channels)
                    .with_context(|| format!("cannot open dataset {}", dir.display()))?;
                if ds.num_targets() != cfg.classes.len() {
                    bail!(
                        "{} has {} targets per image but {} classes are configured",
                        dir.display(),
                        ds.num_targets(),
                        cfg.classes.len()
                    );
                }
                Ok(Some(Arc::new(ds)))
            }
            None => Ok(None),
        }
    };
    let datasets = Datasets {
        train: split(&cfg.data.train_dir)?,
        val: split(&cfg.data.val_dir)?,
        test: split(&cfg.data.test_dir)?,
    };
    let model = Regressor::from_config(&cfg.model, cfg.data.channels, cfg.classes.len());
    Ok(RegressionTrainer::new(model, datasets, cfg)?)
}
