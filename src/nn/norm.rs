use ndarray::prelude::*;

use super::{init, join, Module, Param, ParamMut};

/// Channel-wise L2 normalisation with a learnable per-channel scale,
/// used on the shallowest SSD feature map whose activations are much larger
/// than the deeper ones
#[derive(Clone, Debug)]
pub struct L2Norm {
    weight: Param<Ix1>,
    eps: f32,
}

impl L2Norm {
    pub fn new(channels: usize, scale: f32) -> Self {
        L2Norm {
            weight: Param::new(init::Initializer::Constant(scale).init(channels, channels)),
            eps: 1e-10,
        }
    }

    pub fn channels(&self) -> usize {
        self.weight.w.len()
    }

    /// x is [B, C, H, W]
    pub fn infer(&self, x: &Array4<f32>) -> Array4<f32> {
        let norm = x.mapv(|v| v * v).sum_axis(Axis(1)).mapv(f32::sqrt);
        let mut y = x.clone();
        for ((n, c, i, j), v) in y.indexed_iter_mut() {
            *v = *v / (norm[[n, i, j]] + self.eps) * self.weight.w[c];
        }
        y
    }
}

impl Module for L2Norm {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&join(prefix, "weight"), self.weight.w.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>)) {
        f(&join(prefix, "weight"), self.weight.as_mut());
    }
}

#[test]
fn l2norm_scales_unit_vectors() {
    let norm = L2Norm::new(2, 20.0);
    let mut x = Array4::<f32>::zeros((1, 2, 1, 1));
    x[[0, 0, 0, 0]] = 3.0;
    x[[0, 1, 0, 0]] = 4.0;
    let y = norm.infer(&x);
    assert!((y[[0, 0, 0, 0]] - 12.0).abs() < 1e-4);
    assert!((y[[0, 1, 0, 0]] - 16.0).abs() < 1e-4);
}
