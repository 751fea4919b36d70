use std::sync::Arc;

use itertools::Itertools;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::debug;

use super::{collate, Batch, Dataset, Sample};
use crate::{Error, Result};

/// Batches a dataset. With more than one worker the samples of a batch are
/// read in parallel on scoped threads, sample order is preserved.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    num_workers: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        num_workers: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size cannot be zero"));
        }
        let mut loader = DataLoader {
            order: (0..dataset.len()).collect(),
            dataset,
            batch_size,
            num_workers: num_workers.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.reshuffle();
        Ok(loader)
    }

    /// number of batches, the last one may be partial
    pub fn len(&self) -> usize {
        (self.order.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn shuffles(&self) -> bool {
        self.shuffle
    }

    /// draws a new sample order, a no-op for loaders that do not shuffle
    pub fn reshuffle(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn batch(&self, idx: usize) -> Result<Batch> {
        let start = idx * self.batch_size;
        if start >= self.order.len() {
            return Err(Error::dataset(format!(
                "batch {idx} out of range for {} batches",
                self.len()
            )));
        }
        let end = (start + self.batch_size).min(self.order.len());
        let samples = self.fetch(&self.order[start..end])?;
        collate(&samples)
    }

    /// every batch of one pass in the current order
    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        (0..self.len()).map(move |i| self.batch(i))
    }

    fn fetch(&self, indices: &[usize]) -> Result<Vec<Sample>> {
        if self.num_workers <= 1 || indices.len() <= 1 {
            return indices.iter().map(|&i| self.dataset.get(i)).collect();
        }
        let chunk = (indices.len() + self.num_workers - 1) / self.num_workers;
        let dataset = &self.dataset;
        let parts = crossbeam::scope(|s| {
            let handles = indices
                .chunks(chunk)
                .map(|c| {
                    s.spawn(move |_| c.iter().map(|&i| dataset.get(i)).collect::<Result<Vec<_>>>())
                })
                .collect_vec();
            handles.into_iter().map(|h| h.join()).collect_vec()
        })
        .map_err(|_| Error::dataset("loader worker panicked"))?;

        let mut samples = Vec::with_capacity(indices.len());
        for part in parts {
            samples.extend(part.map_err(|_| Error::dataset("loader worker panicked"))??);
        }
        Ok(samples)
    }
}

/// Endless batch stream over a loader, reshuffling at every wrap around
pub struct DataIterator {
    loader: DataLoader,
    cursor: usize,
}

impl DataIterator {
    pub fn new(loader: DataLoader) -> Result<Self> {
        if loader.is_empty() {
            return Err(Error::dataset("cannot iterate over an empty dataset"));
        }
        Ok(DataIterator { loader, cursor: 0 })
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor >= self.loader.len() {
            debug!("data iterator exhausted after {} batches, restarting", self.cursor);
            self.loader.reshuffle();
            self.cursor = 0;
        }
        let batch = self.loader.batch(self.cursor)?;
        self.cursor += 1;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::InMemoryDataset;

    fn dataset(n: usize) -> Arc<dyn Dataset> {
        Arc::new(InMemoryDataset::synthetic(n, 1, [2, 2], 1, 7))
    }

    #[test]
    fn partial_last_batch() {
        let loader = DataLoader::new(dataset(10), 4, 1, false, 0).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!((loader.num_samples(), loader.batch_size()), (10, 4));
        let sizes = loader.iter().map(|b| b.unwrap().len()).collect_vec();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(loader.batch(3).is_err());
    }

    #[test]
    fn parallel_matches_serial() {
        let ds = dataset(9);
        let serial = DataLoader::new(ds.clone(), 9, 1, true, 3).unwrap();
        let parallel = DataLoader::new(ds, 9, 4, true, 3).unwrap();
        let (a, b) = (serial.batch(0).unwrap(), parallel.batch(0).unwrap());
        assert_eq!(a.images, b.images);
        assert_eq!(a.targets, b.targets);
    }

    #[test]
    fn iterator_wraps_and_rejects_empty() {
        let loader = DataLoader::new(dataset(3), 2, 1, true, 0).unwrap();
        let mut it = DataIterator::new(loader).unwrap();
        let total: usize = (0..5).map(|_| it.next_batch().unwrap().len()).sum();
        assert_eq!(total, 2 + 1 + 2 + 1 + 2);
        assert!(DataIterator::new(DataLoader::new(dataset(0), 2, 1, false, 0).unwrap()).is_err());
        assert!(DataLoader::new(dataset(3), 0, 1, false, 0).is_err());
    }
}
