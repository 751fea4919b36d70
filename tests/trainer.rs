use std::path::Path;
use std::sync::Arc;

use dlt_lib::configs::{EmaConfig, LrPolicy, OptimConfig, TrainConfig};
use dlt_lib::datasets::{Dataset, InMemoryDataset};
use dlt_lib::models::Regressor;
use dlt_lib::nn::Module;
use dlt_lib::trainer::checkpoint::{ckpt_path, load_checkpoint};
use dlt_lib::trainer::logger::{read_scalars, SCALARS_FILE};
use dlt_lib::trainer::{Datasets, RegressionTrainer, Trainer, BEST_CKPT};
use dlt_lib::Error;

fn config(root: &Path) -> TrainConfig {
    let mut cfg = TrainConfig::default();
    cfg.exp_name = "test_reg_trainer".into();
    cfg.output_dir = root.join("outputs");
    cfg.log_dir = root.join("logs");
    cfg.classes = vec!["r".into(), "g".into()];
    cfg.optim = Some(OptimConfig::default());
    cfg.max_epoch = 2;
    cfg.data.img_size = [8, 8];
    cfg.data.batch_size_per_gpu = 4;
    cfg.data.workers_per_gpu = 2;
    cfg
}

fn datasets() -> Datasets {
    let split = |n, seed| -> Option<Arc<dyn Dataset>> {
        Some(Arc::new(InMemoryDataset::synthetic(n, 3, [8, 8], 2, seed)))
    };
    Datasets { train: split(12, 0), val: split(6, 1), test: split(5, 2) }
}

fn model() -> Regressor {
    Regressor::new(3, 4, 8, 2)
}

#[test]
fn build_trainer() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = RegressionTrainer::new(model(), datasets(), config(dir.path())).unwrap();
    assert!(trainer.base.log_path.exists());
    assert!(trainer.base.output_path.exists());
    assert_eq!(trainer.base.cfg.classes.len(), 2);

    let mut cfg = config(dir.path());
    cfg.optim = None;
    assert!(matches!(RegressionTrainer::new(model(), datasets(), cfg), Err(Error::Config(_))));
}

#[test]
fn run_trainer() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = RegressionTrainer::new(model(), datasets(), config(dir.path())).unwrap();
    let best = trainer.base.output_path.join(BEST_CKPT);
    assert!(!best.exists());
    trainer.train().unwrap();
    assert!(best.exists());
    assert!(ckpt_path(&trainer.base.output_path, "last_epoch").exists());
    assert!(trainer.base.best_score < f64::MAX);

    let scalars = read_scalars(trainer.base.log_path.join(SCALARS_FILE)).unwrap();
    for tag in ["train/lr", "train/loss", "train/mae", "val/mae", "val/rmse/g", "test/mse"] {
        assert!(scalars.iter().any(|s| s.tag == tag), "missing {tag}");
    }
    assert_eq!(scalars.iter().filter(|s| s.tag == "val/mae").count(), 2);
}

#[test]
fn ema_weights_are_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.ema = true;
    cfg.ema_cfg = Some(EmaConfig { decay: 0.99, burn_in_epoch: 1 });
    let mut trainer = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
    trainer.train().unwrap();

    let ckpt = load_checkpoint(&ckpt_path(&trainer.base.output_path, "last_epoch")).unwrap();
    let ema = ckpt.ema.expect("ema weights");
    assert_eq!(ema.keys().collect::<Vec<_>>(), ckpt.model.keys().collect::<Vec<_>>());
    assert_ne!(ema["fc2.weight"], ckpt.model["fc2.weight"]);
    // 3 iterations per epoch over 2 epochs
    assert_eq!(ckpt.ema_updates, 6);
}

#[test]
fn resume_continues_from_saved_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = RegressionTrainer::new(model(), datasets(), config(dir.path())).unwrap();
    trainer.train().unwrap();
    let last = ckpt_path(&trainer.base.output_path, "last_epoch");
    let saved = load_checkpoint(&last).unwrap().model;

    let mut cfg = config(dir.path());
    cfg.resume = true;
    cfg.max_epoch = 3;
    let mut resumed = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
    resumed.before_train().unwrap();
    assert_eq!(resumed.base.start_epoch, 2);
    assert_eq!(resumed.model.state_dict()["conv1.weight"], saved["conv1.weight"]);
    assert!(resumed.base.best_score < f64::MAX);

    assert_eq!(load_checkpoint(&last).unwrap().epoch, 2);
}

#[test]
fn resume_restores_best_score_of_saved_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.max_epoch = 1;
    let mut trainer = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
    trainer.train().unwrap();
    let live_best = trainer.base.best_score;
    assert!(live_best < f64::MAX);
    let last = load_checkpoint(&ckpt_path(&trainer.base.output_path, "last_epoch")).unwrap();
    assert_eq!(last.best_score, live_best);

    let mut cfg = config(dir.path());
    cfg.resume = true;
    let mut resumed = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
    resumed.before_train().unwrap();
    assert_eq!(resumed.base.start_epoch, 1);
    assert_eq!(resumed.base.best_score, live_best);
}

#[test]
fn best_checkpoint_keeps_lowest_val_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut states = Vec::new();
    let mut last_trainer = None;
    for max_epoch in 1..=4 {
        let mut cfg = config(dir.path());
        cfg.max_epoch = max_epoch;
        cfg.resume = max_epoch > 1;
        if max_epoch == 4 {
            // diverges, so the last epoch scores worse than the best one
            cfg.optim.as_mut().unwrap().lr = 50.0;
            cfg.lr_cfg.policy = LrPolicy::Constant;
        }
        let mut trainer = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
        trainer.train().unwrap();
        let last = ckpt_path(&trainer.base.output_path, "last_epoch");
        states.push(load_checkpoint(&last).unwrap().model);
        last_trainer = Some(trainer);
    }
    let mut trainer = last_trainer.unwrap();

    let scalars = read_scalars(trainer.base.log_path.join(SCALARS_FILE)).unwrap();
    let val: Vec<f64> = scalars.iter().filter(|s| s.tag == "val/mae").map(|s| s.value).collect();
    assert_eq!(val.len(), 4);
    let best_epoch = (0..val.len())
        .filter(|&e| !val[e].is_nan())
        .min_by(|&a, &b| val[a].total_cmp(&val[b]))
        .unwrap();
    assert_ne!(best_epoch, 3);
    assert_eq!(trainer.base.best_score, val[best_epoch]);

    let best_path = trainer.base.output_path.join(BEST_CKPT);
    let best = load_checkpoint(&best_path).unwrap();
    assert_eq!(best.epoch, best_epoch + 1);
    assert_eq!(best.best_score, val[best_epoch]);
    for (name, w) in best.model.iter() {
        assert_eq!(w, &states[best_epoch][name], "{name} differs from epoch {best_epoch}");
    }

    // the test split was scored with the best weights, not the diverged ones
    let live = trainer.model.state_dict();
    assert_eq!(live["fc2.weight"], states[best_epoch]["fc2.weight"]);
    assert_ne!(live["fc2.weight"], states[3]["fc2.weight"]);
    let test_mae = scalars.iter().filter(|s| s.tag == "test/mae").last().unwrap().value;
    trainer.load_weights(&best_path).unwrap();
    assert_eq!(trainer.evaluate_test().unwrap(), test_mae);
}

#[test]
fn tiny_memory_budget_refuses_to_train() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.device.total_memory = Some(1);
    let mut trainer = RegressionTrainer::new(model(), datasets(), cfg).unwrap();
    assert!(matches!(trainer.train(), Err(Error::InsufficientMemory { available: 1, .. })));
    assert!(!trainer.base.output_path.join(BEST_CKPT).exists());
}

#[test]
fn missing_train_split_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let datasets = Datasets { train: None, ..datasets() };
    let mut trainer = RegressionTrainer::new(model(), datasets, config(dir.path())).unwrap();
    assert!(matches!(trainer.train(), Err(Error::Config(_))));
}
