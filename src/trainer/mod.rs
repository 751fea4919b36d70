//! Training lifecycle shared by every task trainer.
//!
//! A task trainer owns a [`BaseTrainer`] for the bookkeeping (paths, counters,
//! meters, optimizer, schedule, checkpoints, scalar tracking) and implements
//! the [`Trainer`] hooks; [`Trainer::train`] drives the epoch/iteration loop.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::configs::TrainConfig;
use crate::nn::{ema::ModelEma, optim::Optimizer, Module};
use crate::{Config, Error, Result};

pub mod checkpoint;
pub mod logger;
pub mod lr_scheduler;
pub mod memory;
pub mod meters;
pub mod metrics;
pub mod reg_trainer;

pub use checkpoint::{Checkpoint, BEST_CKPT};
pub use logger::ScalarLogger;
pub use lr_scheduler::LrScheduler;
pub use meters::AverageMeter;
pub use metrics::{reg_eval, Metric};
pub use reg_trainer::{Datasets, RegressionTrainer};

pub const CONFIG_FILE: &str = "config.ron";

pub trait Trainer {
    fn base(&self) -> &BaseTrainer;
    fn base_mut(&mut self) -> &mut BaseTrainer;

    fn before_train(&mut self) -> Result<()>;
    fn after_train(&mut self) -> Result<()>;

    fn before_epoch(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_epoch(&mut self) -> Result<()>;

    fn before_iter(&mut self) -> Result<()> {
        let base = self.base_mut();
        base.update_lr(base.progress_in_iter());
        Ok(())
    }

    fn run_iter(&mut self) -> Result<()>;

    fn after_iter(&mut self) -> Result<()> {
        Ok(())
    }

    fn train(&mut self) -> Result<()> {
        self.before_train()?;
        let (start, end) = (self.base().start_epoch, self.base().max_epoch);
        for epoch in start..end {
            let base = self.base_mut();
            base.epoch = epoch;
            base.loss_aver.reset();
            base.acc_aver.reset();
            self.before_epoch()?;
            for iter in 1..=self.base().iters_per_epoch {
                self.base_mut().iter = iter;
                self.before_iter()?;
                self.run_iter()?;
                self.after_iter()?;
            }
            self.after_epoch()?;
        }
        self.after_train()
    }
}

pub struct BaseTrainer {
    pub cfg: TrainConfig,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    /// 0-based, shown 1-based in logs
    pub epoch: usize,
    /// 1-based within the epoch
    pub iter: usize,
    pub start_epoch: usize,
    pub max_epoch: usize,
    pub iters_per_epoch: usize,
    pub start_lr: f32,
    pub lr: f32,
    pub loss_aver: AverageMeter,
    pub acc_aver: AverageMeter,
    pub best_score: f64,
    pub optimizer: Optimizer,
    pub lr_scheduler: Option<LrScheduler>,
    pub tracker: ScalarLogger,
}

impl BaseTrainer {
    /// Fails when the config has no `optim` section. Creates the output and
    /// log directories and stores the resolved config next to the checkpoints.
    pub fn new(cfg: TrainConfig) -> Result<Self> {
        let optim_cfg = cfg
            .optim
            .clone()
            .ok_or_else(|| Error::config("`optim` section is required"))?;

        let output_path = cfg.output_dir.join(&cfg.exp_name);
        let log_path = cfg.log_dir.join(&cfg.exp_name);
        fs::create_dir_all(&output_path)?;
        fs::create_dir_all(&log_path)?;
        fs::write(output_path.join(CONFIG_FILE), cfg.config()?)?;
        info!("outputs in {}, logs in {}", output_path.display(), log_path.display());

        Ok(BaseTrainer {
            tracker: ScalarLogger::new(&log_path)?,
            optimizer: Optimizer::from_config(&optim_cfg),
            start_lr: optim_cfg.lr,
            lr: optim_cfg.lr,
            max_epoch: cfg.max_epoch,
            cfg,
            output_path,
            log_path,
            epoch: 0,
            iter: 0,
            start_epoch: 0,
            iters_per_epoch: 0,
            loss_aver: AverageMeter::new(),
            acc_aver: AverageMeter::new(),
            best_score: f64::MAX,
            lr_scheduler: None,
        })
    }

    pub fn progress_in_iter(&self) -> usize {
        self.epoch * self.iters_per_epoch + self.iter
    }

    pub fn build_lr_scheduler(&mut self) {
        self.lr_scheduler = Some(LrScheduler::new(
            self.start_lr,
            &self.cfg.lr_cfg,
            self.iters_per_epoch,
            self.max_epoch,
        ));
    }

    pub fn update_lr(&mut self, progress: usize) {
        if let Some(s) = &self.lr_scheduler {
            self.lr = s.lr(progress);
        }
    }

    pub fn save_ckpt<M: Module + Clone>(
        &self,
        model: &M,
        ema: Option<&ModelEma<M>>,
        name: &str,
        update_best: bool,
    ) -> Result<PathBuf> {
        let ckpt = Checkpoint {
            epoch: self.epoch + 1,
            best_score: self.best_score,
            model: model.state_dict(),
            ema: ema.map(|e| e.state_dict()),
            ema_updates: ema.map_or(0, |e| e.updates),
            optimizer: Some(self.optimizer.clone()),
        };
        checkpoint::save_checkpoint(&self.output_path, name, &ckpt, update_best)
    }

    /// With `resume` set, restores the full training state from `ckpt` (or
    /// the last epoch checkpoint). With only `ckpt` set, loads weights only,
    /// preferring the EMA weights when the checkpoint has them.
    pub fn resume_train<M: Module + Clone>(
        &mut self,
        model: &mut M,
        ema: Option<&mut ModelEma<M>>,
    ) -> Result<()> {
        if self.cfg.resume {
            let path = self
                .cfg
                .ckpt
                .clone()
                .unwrap_or_else(|| checkpoint::ckpt_path(&self.output_path, "last_epoch"));
            info!("resuming training from {}", path.display());
            let ckpt = checkpoint::load_checkpoint(&path)?;
            model.load_state_dict(&ckpt.model)?;
            match (ema, &ckpt.ema) {
                (Some(ema), Some(state)) => ema.load_state_dict(state, ckpt.ema_updates)?,
                (Some(ema), None) => {
                    warn!("checkpoint has no EMA weights, EMA restarts from the model");
                    ema.ema = model.clone();
                }
                _ => {}
            }
            if let Some(optimizer) = ckpt.optimizer {
                self.optimizer = optimizer;
            }
            self.start_epoch = ckpt.epoch;
            self.epoch = ckpt.epoch;
            self.best_score = ckpt.best_score;
            info!("resumed at epoch {} with best score {:.6}", ckpt.epoch + 1, ckpt.best_score);
        } else if let Some(path) = self.cfg.ckpt.clone() {
            info!("loading weights from {}", path.display());
            let ckpt = checkpoint::load_checkpoint(&path)?;
            model.load_state_dict(ckpt.ema.as_ref().unwrap_or(&ckpt.model))?;
        }
        Ok(())
    }
}
