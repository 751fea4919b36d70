use ndarray::{prelude::*, Zip};
use serde::{Deserialize, Serialize};

/// Regression losses, each reduced by the mean over the batch
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LossKind {
    Mse,
    L1,
    SmoothL1 { beta: f32 },
}

impl LossKind {
    /// output and target are one attribute row of length B, returns the
    /// mean loss and its gradient w.r.t. output
    pub fn forward(&self, output: ArrayView1<f32>, target: ArrayView1<f32>) -> (f32, Array1<f32>) {
        let n = output.len().max(1) as f32;
        let mut grad = Array1::zeros(output.len());
        let mut total = 0.0;
        Zip::from(&mut grad).and(&output).and(&target).for_each(|g, &o, &t| {
            let d = o - t;
            let (l, dl) = match self {
                LossKind::Mse => (d * d, 2.0 * d),
                LossKind::L1 => (d.abs(), sign(d)),
                LossKind::SmoothL1 { beta } => {
                    if d.abs() < *beta {
                        (0.5 * d * d / beta, d / beta)
                    } else {
                        (d.abs() - 0.5 * beta, sign(d))
                    }
                }
            };
            total += l;
            *g = dl / n;
        });
        (total / n, grad)
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[test]
fn mse_value_and_grad() {
    let (l, g) = LossKind::Mse.forward(array![1.0f32, 3.0].view(), array![0.0f32, 1.0].view());
    assert_eq!(l, 2.5);
    assert_eq!(g, array![1.0f32, 2.0]);
}

#[test]
fn l1_and_smooth_l1() {
    let o = array![2.0f32, -0.25];
    let t = array![0.0f32, 0.0];
    let (l, g) = LossKind::L1.forward(o.view(), t.view());
    assert_eq!(l, 1.125);
    assert_eq!(g, array![0.5f32, -0.5]);

    let (l, g) = LossKind::SmoothL1 { beta: 1.0 }.forward(o.view(), t.view());
    // 2.0 - 0.5 on the linear branch, 0.5 * 0.0625 on the quadratic one
    assert!((l - (1.5 + 0.03125) / 2.0).abs() < 1e-6);
    assert_eq!(g, array![0.5f32, -0.125]);
}

#[test]
fn gradcheck_losses() {
    use super::utils::{grad_check, randn};
    let t = randn(6);
    for kind in [LossKind::Mse, LossKind::SmoothL1 { beta: 100.0 }] {
        let f = |x: &ArrayD<f32>| {
            let x = x.clone().into_dimensionality::<Ix1>().unwrap();
            arr1(&[kind.forward(x.view(), t.view()).0]).into_dyn()
        };
        let x0 = randn(6);
        let df = |grad: &ArrayD<f32>| {
            let (_, g) = kind.forward(x0.view(), t.view());
            (g * grad.sum()).into_dyn()
        };
        grad_check(x0.clone().into_dyn(), f, df, None, None, None).unwrap();
    }
}
