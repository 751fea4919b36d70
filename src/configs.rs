//! Training configuration, stored as RON.
//!
//! Every struct carries defaults so a config file only needs the fields it
//! changes. `optim` is the exception: it has no default and the trainer
//! refuses to start without it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::nn::loss::LossKind;
use crate::trainer::metrics::Metric;
use crate::Result;

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct TrainConfig {
    #[derivative(Default(value = "\"regression\".to_string()"))]
    pub exp_name: String,
    #[derivative(Default(value = "PathBuf::from(\"outputs\")"))]
    pub output_dir: PathBuf,
    #[derivative(Default(value = "PathBuf::from(\"logs\")"))]
    pub log_dir: PathBuf,
    /// names of the regressed attributes, one per model output
    pub classes: Vec<String>,
    /// first entry is the score used to pick the best checkpoint
    pub eval_metrics: Option<Vec<Metric>>,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub optim: Option<OptimConfig>,
    #[derivative(Default(value = "default_losses()"))]
    pub loss: BTreeMap<String, LossKind>,
    pub lr_cfg: LrConfig,
    #[derivative(Default(value = "10"))]
    pub max_epoch: usize,
    pub iters_per_epoch: Option<usize>,
    pub ema: bool,
    pub ema_cfg: Option<EmaConfig>,
    #[derivative(Default(value = "1"))]
    pub num_gpus: usize,
    pub resume: bool,
    pub ckpt: Option<PathBuf>,
    pub fp16: bool,
    pub device: DeviceConfig,
    #[derivative(Default(value = "42"))]
    pub seed: u64,
}

fn default_losses() -> BTreeMap<String, LossKind> {
    BTreeMap::from([("mse".to_string(), LossKind::Mse)])
}

impl TrainConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.eval_metrics
            .clone()
            .unwrap_or_else(|| vec![Metric::Mae, Metric::Mse, Metric::Rmse])
    }
}

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct DataConfig {
    pub train_dir: Option<PathBuf>,
    pub val_dir: Option<PathBuf>,
    pub test_dir: Option<PathBuf>,
    #[derivative(Default(value = "16"))]
    pub batch_size_per_gpu: usize,
    #[derivative(Default(value = "2"))]
    pub workers_per_gpu: usize,
    /// [height, width]
    #[derivative(Default(value = "[64, 64]"))]
    pub img_size: [usize; 2],
    #[derivative(Default(value = "3"))]
    pub channels: usize,
}

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct ModelConfig {
    #[derivative(Default(value = "16"))]
    pub hidden_channels: usize,
    #[derivative(Default(value = "32"))]
    pub hidden_dim: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum OptimKind {
    Sgd {
        momentum: f32,
        nesterov: bool,
    },
    Adam {
        beta1: f32,
        beta2: f32,
        eps: f32,
    },
}

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
pub struct OptimConfig {
    #[derivative(Default(value = "OptimKind::Sgd { momentum: 0.9, nesterov: false }"))]
    pub kind: OptimKind,
    #[derivative(Default(value = "0.01"))]
    pub lr: f32,
    #[derivative(Default(value = "default_weight_decay()"))]
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
}

fn default_weight_decay() -> f32 {
    5e-4
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum LrPolicy {
    Constant,
    Cosine { min_lr_ratio: f32 },
    MultiStep { milestones: Vec<usize>, gamma: f32 },
}

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct LrConfig {
    #[derivative(Default(value = "LrPolicy::Cosine { min_lr_ratio: 0.05 }"))]
    pub policy: LrPolicy,
    pub warmup_epochs: usize,
    pub warmup_lr: f32,
}

#[derive(Serialize, Deserialize, Derivative, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct EmaConfig {
    #[derivative(Default(value = "0.9998"))]
    pub decay: f32,
    #[derivative(Default(value = "1"))]
    pub burn_in_epoch: usize,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct DeviceConfig {
    /// memory budget in bytes for one training step, the preflight check is
    /// skipped when unset
    pub total_memory: Option<u64>,
}

#[test]
fn parse_partial_config() {
    let text = r#"(
        exp_name: "ages",
        classes: ["age"],
        data: (batch_size_per_gpu: 4, img_size: (32, 32)),
        optim: Some((kind: Adam(beta1: 0.9, beta2: 0.999, eps: 1e-8), lr: 0.001)),
        loss: {"l1": L1, "smooth": SmoothL1(beta: 1.0)},
    )"#;
    let cfg: TrainConfig = ron::from_str(text).unwrap();
    assert_eq!(cfg.exp_name, "ages");
    assert_eq!(cfg.data.img_size, [32, 32]);
    assert_eq!(cfg.data.workers_per_gpu, 2);
    assert_eq!(cfg.loss.len(), 2);
    assert_eq!(cfg.max_epoch, 10);
    assert!(matches!(cfg.optim.as_ref().unwrap().kind, OptimKind::Adam { .. }));
    assert_eq!(cfg.metrics(), vec![Metric::Mae, Metric::Mse, Metric::Rmse]);
}

#[test]
fn missing_optim_defaults_to_none() {
    let cfg: TrainConfig = ron::from_str("(classes: [\"a\"])").unwrap();
    assert!(cfg.optim.is_none());
}

#[test]
fn shipped_config_parses() {
    let cfg: TrainConfig = ron::from_str(include_str!("../configs/regression.ron")).unwrap();
    assert_eq!(cfg.classes.len(), 2);
    assert!(cfg.ema && cfg.ema_cfg.is_some());
    assert!(matches!(cfg.loss.get("smooth_l1"), Some(LossKind::SmoothL1 { .. })));
    assert_eq!(cfg.device.total_memory, Some(1 << 32));
}
