use ndarray::prelude::*;

use crate::nn::Module;

pub mod neck;
pub mod regressor;

pub use neck::{FeatureMaps, SsdNeck};
pub use regressor::Regressor;

type BackFn<M> = Box<dyn FnOnce(&mut M, &Array2<f32>)>;

/// Result of a training forward pass. Holds the cached activations inside the
/// backward closure until [`ForwardPass::backward`] consumes it.
pub struct ForwardPass<M> {
    /// [num_outputs, B]
    pub output: Array2<f32>,
    /// number of f32 elements kept alive for the backward pass
    pub activations: usize,
    back_fn: BackFn<M>,
}

impl<M> ForwardPass<M> {
    pub fn new(output: Array2<f32>, activations: usize, back_fn: BackFn<M>) -> Self {
        ForwardPass { output, activations, back_fn }
    }

    /// accumulates parameter gradients into `model`, grad has the shape of `output`
    pub fn backward(self, model: &mut M, grad: &Array2<f32>) {
        (self.back_fn)(model, grad)
    }
}

/// A model mapping a NCHW image batch to one regressed value per attribute
pub trait RegressionModel: Module + Clone + Send + Sync + 'static {
    fn num_outputs(&self) -> usize;

    /// inference only, output is [num_outputs, B]
    fn forward(&self, images: &Array4<f32>) -> Array2<f32>;

    fn forward_train(&self, images: &Array4<f32>) -> ForwardPass<Self>;
}
