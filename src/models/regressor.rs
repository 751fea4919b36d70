use ndarray::prelude::*;

use super::{ForwardPass, RegressionModel};
use crate::configs::ModelConfig;
use crate::nn::{global_avg_pool, join, relu, Conv2d, Linear, Module, ParamMut};

/// Small convolutional regressor:
/// conv3x3/s2 -> relu -> conv3x3/s2 -> relu -> global avg pool -> linear -> relu -> linear
#[derive(Clone, Debug)]
pub struct Regressor {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
}

impl Regressor {
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        hidden_dim: usize,
        num_outputs: usize,
    ) -> Self {
        Regressor {
            conv1: Conv2d::new(channels, hidden_channels, 3, 2, 1, true),
            conv2: Conv2d::new(hidden_channels, hidden_channels, 3, 2, 1, true),
            fc1: Linear::new(hidden_channels, hidden_dim, true),
            fc2: Linear::new(hidden_dim, num_outputs, true),
        }
    }

    pub fn from_config(cfg: &ModelConfig, channels: usize, num_outputs: usize) -> Self {
        Self::new(channels, cfg.hidden_channels, cfg.hidden_dim, num_outputs)
    }
}

impl RegressionModel for Regressor {
    fn num_outputs(&self) -> usize {
        self.fc2.out_dim()
    }

    fn forward(&self, images: &Array4<f32>) -> Array2<f32> {
        let x = self.conv1.infer(images).mapv(|v| v.max(0.0));
        let x = self.conv2.infer(&x).mapv(|v| v.max(0.0));
        let (x, _) = global_avg_pool(&x);
        let x = self.fc1.infer(&x).mapv(|v| v.max(0.0));
        self.fc2.infer(&x)
    }

    fn forward_train(&self, images: &Array4<f32>) -> ForwardPass<Self> {
        let (h1, conv1_back) = self.conv1.forward(images);
        let (a1, relu1_back) = relu(&h1);
        let (h2, conv2_back) = self.conv2.forward(&a1);
        let (a2, relu2_back) = relu(&h2);
        let (pooled, pool_back) = global_avg_pool(&a2);
        let (h3, fc1_back) = self.fc1.forward(&pooled);
        let (a3, relu3_back) = relu(&h3);
        let (y, fc2_back) = self.fc2.forward(&a3);

        // im2col buffers and the relu gates roughly double what is listed here
        let activations = 2 * (images.len() + h1.len() + a1.len() + h2.len() + a2.len())
            + pooled.len()
            + h3.len()
            + a3.len()
            + y.len();

        let back_fn = move |m: &mut Regressor, grad: &Array2<f32>| {
            let g = fc2_back(&mut m.fc2, grad);
            let g = relu3_back(&g);
            let g = fc1_back(&mut m.fc1, &g);
            let g = pool_back(&g);
            let g = relu2_back(&g);
            let g = conv2_back(&mut m.conv2, &g);
            let g = relu1_back(&g);
            conv1_back(&mut m.conv1, &g);
        };
        ForwardPass::new(y, activations, Box::new(back_fn))
    }
}

impl Module for Regressor {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.conv1.visit(&join(prefix, "conv1"), f);
        self.conv2.visit(&join(prefix, "conv2"), f);
        self.fc1.visit(&join(prefix, "fc1"), f);
        self.fc2.visit(&join(prefix, "fc2"), f);
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>)) {
        self.conv1.visit_mut(&join(prefix, "conv1"), f);
        self.conv2.visit_mut(&join(prefix, "conv2"), f);
        self.fc1.visit_mut(&join(prefix, "fc1"), f);
        self.fc2.visit_mut(&join(prefix, "fc2"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::utils::{grad_check, randn};

    #[test]
    fn regressor_shapes() {
        let model = Regressor::new(3, 4, 8, 2);
        let x = randn((5, 3, 16, 16));
        assert_eq!(model.forward(&x).dim(), (2, 5));
        let pass = model.forward_train(&x);
        assert_eq!(pass.output, model.forward(&x));
        assert!(pass.activations > x.len());
        assert_eq!(
            model.state_dict().keys().cloned().collect::<Vec<_>>(),
            vec![
                "conv1.bias", "conv1.weight", "conv2.bias", "conv2.weight",
                "fc1.bias", "fc1.weight", "fc2.bias", "fc2.weight"
            ]
        );
    }

    #[test]
    fn gradcheck_regressor_head() {
        // gradient w.r.t. the last layer weight through the full backward
        let model = Regressor::new(1, 2, 3, 1);
        let x = randn((2, 1, 6, 6));
        let w0 = model.state_dict()["fc2.weight"].clone();

        let with_w = |w: &ArrayD<f32>| {
            let mut m = model.clone();
            m.visit_mut("", &mut |k, mut p| {
                if k == "fc2.weight" {
                    p.w.assign(w);
                }
            });
            m.forward(&x).into_dyn()
        };
        let df = |grad: &ArrayD<f32>| {
            let mut m = model.clone();
            let pass = m.forward_train(&x);
            pass.backward(&mut m, &grad.clone().into_dimensionality::<Ix2>().unwrap());
            let mut g = None;
            m.visit_mut("", &mut |k, p| {
                if k == "fc2.weight" {
                    g = Some(p.g.to_owned());
                }
            });
            g.unwrap()
        };
        grad_check(w0, with_w, df, None, None, None).unwrap();
    }
}
