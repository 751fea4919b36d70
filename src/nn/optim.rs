//! First-order optimizers. State buffers are keyed by parameter path so they
//! survive a checkpoint round trip.

use std::collections::HashMap;

use ndarray::{prelude::*, Zip};
use serde::{Deserialize, Serialize};

use super::Module;
use crate::configs::{OptimConfig, OptimKind};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Sgd {
    pub momentum: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(momentum: f32, weight_decay: f32, nesterov: bool) -> Self {
        Sgd { momentum, weight_decay, nesterov, velocity: HashMap::new() }
    }

    pub fn step(&mut self, model: &mut dyn Module, lr: f32) {
        let (momentum, wd, nesterov) = (self.momentum, self.weight_decay, self.nesterov);
        let velocity = &mut self.velocity;
        model.visit_mut("", &mut |k, mut p| {
            let mut d = p.g.to_owned();
            if wd != 0.0 {
                d.scaled_add(wd, &p.w);
            }
            if momentum != 0.0 {
                let buf = velocity
                    .entry(k.to_string())
                    .or_insert_with(|| ArrayD::zeros(d.raw_dim()));
                buf.zip_mut_with(&d, |v, &g| *v = momentum * *v + g);
                if nesterov {
                    d.scaled_add(momentum, &*buf);
                } else {
                    d.assign(&*buf);
                }
            }
            p.w.scaled_add(-lr, &d);
        });
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    t: i32,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> Self {
        Adam { beta1, beta2, eps, weight_decay, t: 0, m: HashMap::new(), v: HashMap::new() }
    }

    pub fn step(&mut self, model: &mut dyn Module, lr: f32) {
        self.t += 1;
        let (b1, b2, eps, wd) = (self.beta1, self.beta2, self.eps, self.weight_decay);
        let c1 = 1.0 - b1.powi(self.t);
        let c2 = 1.0 - b2.powi(self.t);
        let (ms, vs) = (&mut self.m, &mut self.v);
        model.visit_mut("", &mut |k, mut p| {
            let mut g = p.g.to_owned();
            if wd != 0.0 {
                g.scaled_add(wd, &p.w);
            }
            let m = ms.entry(k.to_string()).or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            let v = vs.entry(k.to_string()).or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            Zip::from(&mut p.w).and(&g).and(m).and(v).for_each(|w, &g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / c1;
                let v_hat = *v / c2;
                *w -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        });
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Optimizer {
    Sgd(Sgd),
    Adam(Adam),
}

impl Optimizer {
    pub fn from_config(cfg: &OptimConfig) -> Self {
        match cfg.kind {
            OptimKind::Sgd { momentum, nesterov } => {
                Optimizer::Sgd(Sgd::new(momentum, cfg.weight_decay, nesterov))
            }
            OptimKind::Adam { beta1, beta2, eps } => {
                Optimizer::Adam(Adam::new(beta1, beta2, eps, cfg.weight_decay))
            }
        }
    }

    pub fn step(&mut self, model: &mut dyn Module, lr: f32) {
        match self {
            Optimizer::Sgd(o) => o.step(model, lr),
            Optimizer::Adam(o) => o.step(model, lr),
        }
    }

    /// number of f32 buffers kept per parameter element
    pub fn state_slots(&self) -> usize {
        match self {
            Optimizer::Sgd(o) if o.momentum != 0.0 => 1,
            Optimizer::Sgd(_) => 0,
            Optimizer::Adam(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;

    /// drives ||W x||^2 towards zero, returns the objective before and after
    fn descend(opt: &mut Optimizer, lr: f32) -> (f32, f32) {
        let mut lin = Linear::new(4, 2, false);
        let x = crate::nn::utils::randn((4, 8));
        let objective = |l: &Linear| l.infer(&x).mapv(|v| v * v).sum();
        let before = objective(&lin);
        for _ in 0..50 {
            lin.zero_grad();
            let (y, back) = lin.forward(&x);
            back(&mut lin, &(2.0 * y));
            opt.step(&mut lin, lr);
        }
        (before, objective(&lin))
    }

    #[test]
    fn sgd_descends() {
        let mut opt = Optimizer::Sgd(Sgd::new(0.9, 0.0, false));
        let (before, after) = descend(&mut opt, 1e-3);
        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn nesterov_descends() {
        let mut opt = Optimizer::Sgd(Sgd::new(0.9, 1e-4, true));
        let (before, after) = descend(&mut opt, 1e-3);
        assert!(after < before);
    }

    #[test]
    fn adam_descends() {
        let mut opt = Optimizer::Adam(Adam::new(0.9, 0.999, 1e-8, 0.0));
        let (before, after) = descend(&mut opt, 1e-2);
        assert!(after < before);
        assert_eq!(opt.state_slots(), 2);
    }

    #[test]
    fn plain_sgd_step() {
        let mut lin = Linear::new(1, 1, false);
        let w0 = lin.state_dict()["weight"][[0, 0]];
        lin.visit_mut("", &mut |_, mut p| p.g.fill(2.0));
        Optimizer::Sgd(Sgd::new(0.0, 0.0, false)).step(&mut lin, 0.5);
        let w1 = lin.state_dict()["weight"][[0, 0]];
        assert!((w0 - 1.0 - w1).abs() < 1e-6);
    }
}
