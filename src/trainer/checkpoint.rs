use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::nn::{optim::Optimizer, StateDict};
use crate::{ops, Result};

pub const BEST_CKPT: &str = "best_ckpt.pth";

/// Everything needed to continue a run
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Checkpoint {
    /// first epoch still to be run
    pub epoch: usize,
    pub best_score: f64,
    pub model: StateDict,
    pub ema: Option<StateDict>,
    pub ema_updates: usize,
    pub optimizer: Option<Optimizer>,
}

pub fn ckpt_path(output_path: &Path, name: &str) -> PathBuf {
    output_path.join(format!("{name}_ckpt.pth"))
}

/// writes `{name}_ckpt.pth` and, when `update_best` is set, copies it to `best_ckpt.pth`
pub fn save_checkpoint(
    output_path: &Path,
    name: &str,
    ckpt: &Checkpoint,
    update_best: bool,
) -> Result<PathBuf> {
    let path = ckpt_path(output_path, name);
    ops::serialize(ckpt, &path)?;
    if update_best {
        let best = output_path.join(BEST_CKPT);
        fs::copy(&path, &best)?;
        info!("new best checkpoint {}", best.display());
    }
    Ok(path)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    ops::deserialize(path)
}

#[test]
fn best_copy_only_when_improved() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = Checkpoint {
        epoch: 3,
        best_score: 0.5,
        model: StateDict::default(),
        ema: None,
        ema_updates: 0,
        optimizer: None,
    };
    let path = save_checkpoint(dir.path(), "last_epoch", &ckpt, false).unwrap();
    assert_eq!(path, dir.path().join("last_epoch_ckpt.pth"));
    assert!(!dir.path().join(BEST_CKPT).exists());

    save_checkpoint(dir.path(), "last_epoch", &ckpt, true).unwrap();
    let best = load_checkpoint(&dir.path().join(BEST_CKPT)).unwrap();
    assert_eq!(best.epoch, 3);
}
