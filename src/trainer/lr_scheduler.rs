use std::f32::consts::PI;

use crate::configs::{LrConfig, LrPolicy};

/// Maps training progress in iterations to a learning rate.
/// Warmup ramps linearly from `warmup_lr` to the base rate, the policy takes
/// over afterwards.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    base_lr: f32,
    policy: LrPolicy,
    warmup_lr: f32,
    warmup_iters: usize,
    iters_per_epoch: usize,
    total_iters: usize,
}

impl LrScheduler {
    pub fn new(base_lr: f32, cfg: &LrConfig, iters_per_epoch: usize, max_epoch: usize) -> Self {
        let iters_per_epoch = iters_per_epoch.max(1);
        LrScheduler {
            base_lr,
            policy: cfg.policy.clone(),
            warmup_lr: cfg.warmup_lr,
            warmup_iters: cfg.warmup_epochs * iters_per_epoch,
            iters_per_epoch,
            total_iters: max_epoch * iters_per_epoch,
        }
    }

    pub fn lr(&self, progress: usize) -> f32 {
        if progress < self.warmup_iters {
            let t = progress as f32 / self.warmup_iters as f32;
            return self.warmup_lr + (self.base_lr - self.warmup_lr) * t;
        }
        match &self.policy {
            LrPolicy::Constant => self.base_lr,
            LrPolicy::Cosine { min_lr_ratio } => {
                let min_lr = self.base_lr * min_lr_ratio;
                let span = self.total_iters.saturating_sub(self.warmup_iters).max(1);
                let t = ((progress - self.warmup_iters) as f32 / span as f32).min(1.0);
                min_lr + (self.base_lr - min_lr) * 0.5 * (1.0 + (PI * t).cos())
            }
            LrPolicy::MultiStep { milestones, gamma } => {
                let epoch = progress / self.iters_per_epoch;
                let passed = milestones.iter().filter(|&&m| epoch >= m).count();
                self.base_lr * gamma.powi(passed as i32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(policy: LrPolicy, warmup_epochs: usize) -> LrConfig {
        LrConfig { policy, warmup_epochs, warmup_lr: 0.0 }
    }

    #[test]
    fn warmup_then_cosine() {
        let s = LrScheduler::new(0.1, &cfg(LrPolicy::Cosine { min_lr_ratio: 0.1 }, 1), 10, 11);
        assert_eq!(s.lr(0), 0.0);
        assert!((s.lr(5) - 0.05).abs() < 1e-6);
        assert!((s.lr(10) - 0.1).abs() < 1e-6);
        assert!((s.lr(110) - 0.01).abs() < 1e-6);
        assert!((s.lr(500) - 0.01).abs() < 1e-6);
        assert!(s.lr(60) < s.lr(20));
    }

    #[test]
    fn multistep_and_constant() {
        let policy = LrPolicy::MultiStep { milestones: vec![2, 4], gamma: 0.5 };
        let s = LrScheduler::new(1.0, &cfg(policy, 0), 5, 6);
        assert_eq!(s.lr(9), 1.0);
        assert_eq!(s.lr(10), 0.5);
        assert_eq!(s.lr(25), 0.25);
        let c = LrScheduler::new(0.3, &cfg(LrPolicy::Constant, 0), 5, 6);
        assert_eq!(c.lr(17), 0.3);
    }
}
