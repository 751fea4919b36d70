//! Datasets yield single samples; batching, shuffling and worker fan-out live
//! in the loader so every dataset gets them for free.
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::Uniform;

use crate::{Error, Result};

pub mod folder;
pub mod loader;

pub use folder::FolderDataset;
pub use loader::{DataIterator, DataLoader};

/// One image and its regression targets
#[derive(Clone, Debug)]
pub struct Sample {
    /// [C, H, W], normalised to [0, 1]
    pub image: Array3<f32>,
    /// [A]
    pub target: Array1<f32>,
}

/// A collated batch, targets are transposed so each row is one attribute
#[derive(Clone, Debug)]
pub struct Batch {
    /// [B, C, H, W]
    pub images: Array4<f32>,
    /// [A, B]
    pub targets: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Random access dataset, shared between loader workers
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;
    fn get(&self, idx: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks images along a new batch axis and targets along a new column axis
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::dataset("cannot collate an empty batch"));
    }
    let images: Vec<_> = samples.iter().map(|s| s.image.view()).collect();
    let targets: Vec<_> = samples.iter().map(|s| s.target.view()).collect();
    let images = ndarray::stack(Axis(0), &images)?;
    let targets = ndarray::stack(Axis(1), &targets)?;
    Ok(Batch { images, targets })
}

pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Result<Self> {
        if let Some(first) = samples.first() {
            let (shape, a) = (first.image.dim(), first.target.len());
            let ragged = samples.iter().position(|s| s.image.dim() != shape || s.target.len() != a);
            if let Some(i) = ragged {
                return Err(Error::dataset(format!(
                    "sample {i} does not match the shape of sample 0 ({shape:?}, {a} targets)"
                )));
            }
        }
        Ok(InMemoryDataset { samples })
    }

    /// Random images whose target `a` is the mean intensity of channel
    /// `a % channels`, so a small model can actually fit it
    pub fn synthetic(
        n: usize,
        channels: usize,
        img_size: [usize; 2],
        num_targets: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = (0..n)
            .map(|_| {
                let shape = (channels, img_size[0], img_size[1]);
                let image = Array3::random_using(shape, Uniform::new(0.0f32, 1.0), &mut rng);
                let means = image.mean_axis(Axis(1)).and_then(|m| m.mean_axis(Axis(1)));
                let target = Array1::from_shape_fn(num_targets, |a| {
                    means.as_ref().map_or(0.0, |m| m[a % channels.max(1)])
                });
                Sample { image, target }
            })
            .collect();
        InMemoryDataset { samples }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        self.samples
            .get(idx)
            .cloned()
            .ok_or_else(|| {
                let n = self.samples.len();
                Error::dataset(format!("index {idx} out of range for {n} samples"))
            })
    }
}

#[test]
fn collate_shapes() {
    let ds = InMemoryDataset::synthetic(3, 2, [4, 5], 3, 0);
    let samples: Vec<_> = (0..3).map(|i| ds.get(i).unwrap()).collect();
    let batch = collate(&samples).unwrap();
    assert_eq!(batch.images.dim(), (3, 2, 4, 5));
    assert_eq!(batch.targets.dim(), (3, 3));
    assert_eq!(batch.targets.column(1), samples[1].target);
    // third target wraps around to channel 0
    assert_eq!(batch.targets[[2, 0]], batch.targets[[0, 0]]);
}

#[test]
fn in_memory_rejects_ragged() {
    let a = Sample { image: Array3::zeros((1, 2, 2)), target: Array1::zeros(1) };
    let b = Sample { image: Array3::zeros((1, 3, 2)), target: Array1::zeros(1) };
    assert!(InMemoryDataset::new(vec![a.clone(), b]).is_err());
    let ds = InMemoryDataset::new(vec![a]).unwrap();
    assert!(matches!(ds.get(1), Err(Error::Dataset(_))));
}
