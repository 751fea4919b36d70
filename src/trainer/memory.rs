use ndarray::prelude::*;
use tracing::{info, warn};

use crate::models::RegressionModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    pub fn from_fp16(fp16: bool) -> Self {
        if fp16 {
            DataType::F16
        } else {
            DataType::F32
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }
}

/// Bytes needed by one training step: weights, their gradients and
/// `optim_slots` optimizer buffers per weight, plus the activations of a
/// forward pass counted twice for the backward. Activations are measured on a
/// single zero image and scaled by the batch size.
pub fn estimate_step_memory<M: RegressionModel>(
    model: &M,
    input_size: [usize; 2],
    channels: usize,
    batch_size: usize,
    optim_slots: usize,
    dtype: DataType,
) -> u64 {
    let probe = Array4::zeros((1, channels, input_size[0], input_size[1]));
    let per_sample = model.forward_train(&probe).activations as u64;
    let params = model.num_params() as u64;
    let elements = params * (2 + optim_slots as u64) + 2 * per_sample * batch_size as u64;
    elements * dtype.bytes()
}

/// false when one training step would not fit in `total_mem` bytes
pub fn check_gpu_availability<M: RegressionModel>(
    model: &M,
    input_size: [usize; 2],
    channels: usize,
    batch_size: usize,
    optim_slots: usize,
    dtype: DataType,
    total_mem: u64,
) -> bool {
    let required =
        estimate_step_memory(model, input_size, channels, batch_size, optim_slots, dtype);
    if required > total_mem {
        warn!(
            "batch size {batch_size} needs ~{:.1} MiB per step but only {:.1} MiB are available",
            required as f64 / (1 << 20) as f64,
            total_mem as f64 / (1 << 20) as f64
        );
        return false;
    }
    info!(
        "memory check passed: ~{:.1} of {:.1} MiB",
        required as f64 / (1 << 20) as f64,
        total_mem as f64 / (1 << 20) as f64
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Module;
    use crate::models::Regressor;

    #[test]
    fn estimate_scales_with_batch() {
        let model = Regressor::new(3, 4, 8, 2);
        let one = estimate_step_memory(&model, [16, 16], 3, 1, 1, DataType::F32);
        let eight = estimate_step_memory(&model, [16, 16], 3, 8, 1, DataType::F32);
        let half = estimate_step_memory(&model, [16, 16], 3, 8, 1, DataType::F16);
        assert!(eight > one);
        assert_eq!(half * 2, eight);
        assert!(one > model.num_params() as u64 * 3 * 4);
    }

    #[test]
    fn tiny_budget_is_rejected() {
        let model = Regressor::new(1, 2, 2, 1);
        assert!(!check_gpu_availability(&model, [8, 8], 1, 4, 2, DataType::F32, 1));
        assert!(check_gpu_availability(&model, [8, 8], 1, 4, 2, DataType::F32, u64::MAX));
    }
}
