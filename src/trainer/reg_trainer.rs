use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use itertools::Itertools;
use ndarray::prelude::*;
use tracing::{info, warn};

use super::memory::{self, DataType};
use super::metrics::{reg_eval, Metric};
use super::{BaseTrainer, ScalarLogger, Trainer, BEST_CKPT};
use crate::configs::TrainConfig;
use crate::datasets::{DataIterator, DataLoader, Dataset};
use crate::models::RegressionModel;
use crate::nn::{ema::ModelEma, loss::LossKind};
use crate::{Error, Result};

/// The splits a trainer works on, any of them may be absent
#[derive(Clone, Default)]
pub struct Datasets {
    pub train: Option<Arc<dyn Dataset>>,
    pub val: Option<Arc<dyn Dataset>>,
    pub test: Option<Arc<dyn Dataset>>,
}

/// Trains a model that regresses one value per class, keeps the checkpoint
/// with the lowest validation score and evaluates it on the test split
pub struct RegressionTrainer<M: RegressionModel> {
    pub base: BaseTrainer,
    pub model: M,
    pub ema_model: Option<ModelEma<M>>,
    datasets: Datasets,
    classes: Vec<String>,
    metrics: Vec<Metric>,
    loss_fn: BTreeMap<String, LossKind>,
    train_iter: Option<DataIterator>,
    val_loader: Option<DataLoader>,
    test_loader: Option<DataLoader>,
}

impl<M: RegressionModel> RegressionTrainer<M> {
    pub fn new(model: M, datasets: Datasets, cfg: TrainConfig) -> Result<Self> {
        if cfg.optim.is_none() {
            return Err(Error::config("`optim` section is required"));
        }
        if cfg.classes.is_empty() {
            return Err(Error::config("`classes` must name at least one attribute"));
        }
        if cfg.classes.len() != model.num_outputs() {
            return Err(Error::config(format!(
                "{} classes configured but the model has {} outputs",
                cfg.classes.len(),
                model.num_outputs()
            )));
        }
        if cfg.ema && cfg.ema_cfg.is_none() {
            return Err(Error::config("`ema` is enabled but `ema_cfg` is missing"));
        }
        let metrics = cfg.metrics();
        if metrics.is_empty() {
            return Err(Error::config("`eval_metrics` cannot be empty"));
        }
        if cfg.data.batch_size_per_gpu == 0 {
            return Err(Error::config("batch size cannot be zero"));
        }

        let classes = cfg.classes.clone();
        let base = BaseTrainer::new(cfg)?;
        Ok(RegressionTrainer {
            base,
            model,
            ema_model: None,
            datasets,
            classes,
            metrics,
            loss_fn: BTreeMap::new(),
            train_iter: None,
            val_loader: None,
            test_loader: None,
        })
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Train shuffles and gets `workers_per_gpu * num_gpus` workers, val and
    /// test keep their order and get `workers_per_gpu`
    pub fn get_dataloader(&mut self) -> Result<()> {
        let seed = self.base.cfg.seed;
        let batch = self.base.cfg.data.batch_size_per_gpu;
        let workers = self.base.cfg.data.workers_per_gpu;
        if let Some(ds) = &self.datasets.train {
            let train_workers = workers * self.base.cfg.num_gpus.max(1);
            let loader = DataLoader::new(ds.clone(), batch, train_workers, true, seed)?;
            self.train_iter = Some(DataIterator::new(loader)?);
        }
        if let Some(ds) = &self.datasets.val {
            self.val_loader = Some(DataLoader::new(ds.clone(), batch, workers, false, seed)?);
        }
        if let Some(ds) = &self.datasets.test {
            self.test_loader = Some(DataLoader::new(ds.clone(), batch, workers, false, seed)?);
        }
        Ok(())
    }

    pub fn evaluate_and_save_model(&mut self) -> Result<()> {
        info!("Validation start...");
        let score = match &self.val_loader {
            Some(loader) => {
                let eval_model = self.ema_model.as_ref().map_or(&self.model, |e| &e.ema);
                Some(evaluate(
                    eval_model,
                    loader,
                    &self.metrics,
                    &self.classes,
                    &mut self.base.tracker,
                    "val",
                    self.base.epoch,
                )?)
            }
            None => {
                warn!("no validation set, only the last epoch checkpoint is kept");
                None
            }
        };

        // the checkpoint stores the best score including this epoch
        let improved = score.map_or(false, |s| s < self.base.best_score);
        if let Some(s) = score {
            self.base.best_score = self.base.best_score.min(s);
        }
        self.base.save_ckpt(&self.model, self.ema_model.as_ref(), "last_epoch", improved)?;
        Ok(())
    }

    /// Loads weights only from `path`, the live training state is untouched
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.base.cfg.resume = false;
        self.base.cfg.ckpt = Some(path.to_path_buf());
        self.base.resume_train(&mut self.model, None)
    }

    /// Evaluates the best checkpoint on the test split
    pub fn test_model(&mut self) -> Result<f64> {
        info!("Test start...");
        let best = self.base.output_path.join(BEST_CKPT);
        if best.exists() {
            self.load_weights(&best)?;
        } else {
            warn!("{} not found, testing the current weights", best.display());
        }
        self.evaluate_test()
    }

    /// Evaluates the current weights on the test split
    pub fn evaluate_test(&mut self) -> Result<f64> {
        if self.test_loader.is_none() {
            self.get_dataloader()?;
        }
        let loader = self
            .test_loader
            .as_ref()
            .ok_or_else(|| Error::config("no test dataset"))?;
        evaluate(
            &self.model,
            loader,
            &self.metrics,
            &self.classes,
            &mut self.base.tracker,
            "test",
            self.base.epoch,
        )
    }

    fn log_iter(&self, losses: &BTreeMap<String, f32>) {
        let b = &self.base;
        let per_loss = losses.iter().map(|(k, v)| format!("{k}: {v:.6}")).join(" ");
        info!(
            "epoch {}/{} [{}/{}] - lr: {:.6} loss: {:.6} acc: {:.6} {}",
            b.epoch + 1,
            b.max_epoch,
            b.iter,
            b.iters_per_epoch,
            b.lr,
            b.loss_aver.avg,
            b.acc_aver.avg,
            per_loss
        );
    }
}

impl<M: RegressionModel> Trainer for RegressionTrainer<M> {
    fn base(&self) -> &BaseTrainer {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTrainer {
        &mut self.base
    }

    fn before_train(&mut self) -> Result<()> {
        self.get_dataloader()?;
        let train_len = self
            .train_iter
            .as_ref()
            .map(|it| it.loader().len())
            .ok_or_else(|| Error::config("no train dataset"))?;
        self.base.iters_per_epoch = self.base.cfg.iters_per_epoch.unwrap_or(train_len);

        if self.base.cfg.ema {
            let ema_cfg = self
                .base
                .cfg
                .ema_cfg
                .clone()
                .ok_or_else(|| Error::config("`ema` is enabled but `ema_cfg` is missing"))?;
            let burn_in_iters = train_len * ema_cfg.burn_in_epoch;
            self.ema_model = Some(ModelEma::new(&self.model, ema_cfg.decay, burn_in_iters));
        }

        self.loss_fn = self.base.cfg.loss.clone();
        if self.loss_fn.is_empty() {
            return Err(Error::config("at least one loss is required"));
        }

        self.base.resume_train(&mut self.model, self.ema_model.as_mut())?;
        self.base.build_lr_scheduler();

        if let Some(total_mem) = self.base.cfg.device.total_memory {
            let cfg = &self.base.cfg;
            let dtype = DataType::from_fp16(cfg.fp16);
            let slots = self.base.optimizer.state_slots();
            let batch = cfg.data.batch_size_per_gpu;
            let (img_size, channels) = (cfg.data.img_size, cfg.data.channels);
            let model = &self.model;
            let fits = memory::check_gpu_availability(
                model, img_size, channels, batch, slots, dtype, total_mem,
            );
            if !fits {
                let required =
                    memory::estimate_step_memory(model, img_size, channels, batch, slots, dtype);
                return Err(Error::InsufficientMemory { required, available: total_mem });
            }
        }
        info!(
            "training {} parameters for {} epochs of {} iterations",
            self.model.num_params(),
            self.base.max_epoch,
            self.base.iters_per_epoch
        );
        Ok(())
    }

    fn after_train(&mut self) -> Result<()> {
        info!(
            "Training of experiment is done and the best {} is {:.2}",
            self.metrics[0], self.base.best_score
        );
        if self.datasets.test.is_some() {
            self.test_model()?;
        }
        Ok(())
    }

    fn before_epoch(&mut self) -> Result<()> {
        info!("---> start train epoch{}", self.base.epoch + 1);
        Ok(())
    }

    fn run_iter(&mut self) -> Result<()> {
        let batch = self
            .train_iter
            .as_mut()
            .ok_or_else(|| Error::config("train loader is not built, call before_train first"))?
            .next_batch()?;
        let pass = self.model.forward_train(&batch.images);
        if pass.output.dim() != batch.targets.dim() {
            return Err(Error::shape(format!(
                "model output {:?} does not match targets {:?}",
                pass.output.dim(),
                batch.targets.dim()
            )));
        }

        let mut losses = BTreeMap::new();
        let mut grad = Array2::<f32>::zeros(pass.output.raw_dim());
        for (name, loss_fn) in &self.loss_fn {
            let mut total = 0.0;
            let rows = pass.output.outer_iter().zip(batch.targets.outer_iter());
            for (a, (output, target)) in rows.enumerate() {
                let (l, g) = loss_fn.forward(output, target);
                total += l;
                let mut row = grad.row_mut(a);
                row += &g;
            }
            losses.insert(name.clone(), total);
        }
        let loss: f32 = losses.values().sum();
        self.base.loss_aver.update(f64::from(loss));
        for (output, target) in pass.output.outer_iter().zip(batch.targets.outer_iter()) {
            self.base.acc_aver.update(reg_eval(output, target).mae);
        }

        self.model.zero_grad();
        pass.backward(&mut self.model, &grad);
        self.base.optimizer.step(&mut self.model, self.base.lr);

        if self.base.iter % 100 == 0 || self.base.iter == 1 {
            self.log_iter(&losses);
        }

        if let Some(ema) = &mut self.ema_model {
            ema.update(&self.model);
        }
        Ok(())
    }

    fn after_epoch(&mut self) -> Result<()> {
        let b = &mut self.base;
        let values = [
            ("train/lr", f64::from(b.lr)),
            ("train/loss", b.loss_aver.avg),
            ("train/mae", b.acc_aver.avg),
        ];
        for (tag, value) in values {
            b.tracker.add_scalar(tag, value, b.epoch)?;
        }
        self.evaluate_and_save_model()
    }
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        f64::NAN
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

/// Runs inference over `loader` and scores every attribute row of every batch.
/// Returns the mean of the first metric over all rows, which is the score used
/// to pick the best checkpoint.
fn evaluate<M: RegressionModel>(
    model: &M,
    loader: &DataLoader,
    metrics: &[Metric],
    classes: &[String],
    tracker: &mut ScalarLogger,
    split: &str,
    step: usize,
) -> Result<f64> {
    // metric -> class -> one value per batch
    let mut res: BTreeMap<Metric, Vec<Vec<f64>>> =
        metrics.iter().map(|&m| (m, vec![Vec::new(); classes.len()])).collect();
    for batch in loader.iter() {
        let batch = batch?;
        let output = model.forward(&batch.images);
        if output.dim() != batch.targets.dim() {
            return Err(Error::shape(format!(
                "model output {:?} does not match targets {:?}",
                output.dim(),
                batch.targets.dim()
            )));
        }
        for (a, (o, t)) in output.outer_iter().zip(batch.targets.outer_iter()).enumerate() {
            let scores = reg_eval(o, t);
            for (m, per_class) in res.iter_mut() {
                per_class[a].push(scores.get(*m));
            }
        }
    }

    let mut lines = Vec::new();
    for metric in metrics {
        let per_class = &res[metric];
        let all = per_class.iter().flatten().copied().collect_vec();
        let class_means = per_class.iter().map(|v| mean(v)).collect_vec();
        let detail = classes
            .iter()
            .zip(&class_means)
            .map(|(c, s)| format!("{c}: {s:.6}"))
            .join(", ");
        lines.push(format!("{metric:<20}{:.6} ({detail})", mean(&all)));

        tracker.add_scalar(&format!("{split}/{metric}"), mean(&all), step)?;
        for (c, s) in classes.iter().zip(&class_means) {
            tracker.add_scalar(&format!("{split}/{metric}/{c}"), *s, step)?;
        }
    }
    info!("{split} scores\n{}", lines.join("\n"));

    let first = res[&metrics[0]].iter().flatten().copied().collect_vec();
    Ok(mean(&first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::OptimConfig;
    use crate::datasets::InMemoryDataset;
    use crate::models::Regressor;
    use crate::nn::Module;

    fn config(dir: &Path) -> TrainConfig {
        let mut cfg = TrainConfig::default();
        cfg.output_dir = dir.join("out");
        cfg.log_dir = dir.join("logs");
        cfg.classes = vec!["r".into(), "g".into()];
        cfg.optim = Some(OptimConfig::default());
        cfg.data.img_size = [8, 8];
        cfg.data.batch_size_per_gpu = 4;
        cfg.data.workers_per_gpu = 1;
        cfg
    }

    #[test]
    fn validates_config() {
        let dir = tempfile::tempdir().unwrap();
        let model = Regressor::new(3, 2, 4, 2);
        let build = |cfg| RegressionTrainer::new(model.clone(), Datasets::default(), cfg);

        let mut cfg = config(dir.path());
        cfg.classes.pop();
        assert!(matches!(build(cfg), Err(Error::Config(_))));

        let mut cfg = config(dir.path());
        cfg.ema = true;
        assert!(matches!(build(cfg), Err(Error::Config(_))));

        let mut cfg = config(dir.path());
        cfg.eval_metrics = Some(vec![]);
        assert!(matches!(build(cfg), Err(Error::Config(_))));

        let trainer = build(config(dir.path())).unwrap();
        assert_eq!(trainer.metrics(), &[Metric::Mae, Metric::Mse, Metric::Rmse]);
        assert!(trainer.base.output_path.join(super::super::CONFIG_FILE).exists());
    }

    #[test]
    fn loaders_follow_worker_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ds: Arc<dyn Dataset> = Arc::new(InMemoryDataset::synthetic(10, 3, [8, 8], 2, 0));
        let datasets = Datasets { train: Some(ds.clone()), val: Some(ds.clone()), test: Some(ds) };
        let mut cfg = config(dir.path());
        cfg.num_gpus = 2;
        cfg.data.workers_per_gpu = 3;
        let model = Regressor::new(3, 2, 4, 2);
        let mut trainer = RegressionTrainer::new(model, datasets, cfg).unwrap();
        trainer.get_dataloader().unwrap();

        let train = trainer.train_iter.as_ref().unwrap().loader();
        assert!(train.shuffles());
        assert_eq!(train.num_workers(), 6);
        assert_eq!(train.len(), 3);
        let val = trainer.val_loader.as_ref().unwrap();
        assert!(!val.shuffles());
        assert_eq!(val.num_workers(), 3);
        assert!(!trainer.test_loader.as_ref().unwrap().shuffles());
    }

    #[test]
    fn run_iter_updates_meters_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let ds: Arc<dyn Dataset> = Arc::new(InMemoryDataset::synthetic(8, 3, [8, 8], 2, 1));
        let mut cfg = config(dir.path());
        cfg.loss = BTreeMap::from([
            ("l1".to_string(), LossKind::L1),
            ("mse".to_string(), LossKind::Mse),
        ]);
        let datasets = Datasets { train: Some(ds), ..Default::default() };
        let model = Regressor::new(3, 2, 4, 2);
        let mut trainer = RegressionTrainer::new(model, datasets, cfg).unwrap();
        trainer.before_train().unwrap();
        assert_eq!(trainer.base.iters_per_epoch, 2);

        let before = trainer.model.state_dict();
        trainer.base.iter = 1;
        trainer.before_iter().unwrap();
        trainer.run_iter().unwrap();
        assert_eq!(trainer.base.loss_aver.count, 1);
        // one mae sample per attribute row
        assert_eq!(trainer.base.acc_aver.count, 2);
        assert_ne!(trainer.model.state_dict()["fc2.weight"], before["fc2.weight"]);
    }
}
