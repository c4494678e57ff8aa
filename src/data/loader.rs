//! DataLoader for batching and iterating over training images
//!
//! Provides batching with support for:
//! - Seeded shuffling, reshuffled on every restart; the order of pass `p`
//!   depends only on `(seed, p)`, so any pass can be rebuilt directly
//! - Dropping the trailing incomplete batch, so every batch has the same size
//! - Parallel decoding of the images in a batch

use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use super::dataset::ImageDataset;
use super::BatchSource;
use crate::error::{InpaintError, Result};
use crate::utils::derive_seed;

/// DataLoader for iterating over batched images
pub struct DataLoader {
    dataset: ImageDataset,
    /// Batch size
    batch_size: usize,
    /// Whether to shuffle on every pass
    shuffle: bool,
    /// Current sample order
    indices: Vec<usize>,
    /// Current position in `indices`
    current_idx: usize,
    /// Passes started so far, minus one
    pass: usize,
    seed: u64,
}

impl DataLoader {
    /// Create a new DataLoader
    ///
    /// Fails when the dataset cannot fill a single batch.
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if dataset.len() < batch_size {
            return Err(InpaintError::Config(format!(
                "dataset has {} images, fewer than one batch of {}",
                dataset.len(),
                batch_size
            )));
        }

        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut loader = Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            current_idx: 0,
            pass: 0,
            seed,
        };
        loader.order_pass();

        Ok(loader)
    }

    /// Get total number of samples
    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Index of the current pass, starting at 0
    pub fn pass(&self) -> usize {
        self.pass
    }

    fn pass_seed(&self) -> u64 {
        derive_seed(self.seed, self.pass as u64)
    }

    /// Rebuild the sample order of the current pass
    fn order_pass(&mut self) {
        self.indices = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.pass_seed());
            self.indices.shuffle(&mut rng);
        }
    }
}

impl BatchSource for DataLoader {
    fn restart(&mut self) -> Result<()> {
        self.seek(self.pass + 1, 0)
    }

    fn next_batch(&mut self) -> Result<Option<Array4<f32>>> {
        let start = self.current_idx;
        let end = start + self.batch_size;
        if end > self.indices.len() {
            return Ok(None);
        }

        // Crop windows come from per-position seeds so parallel decoding
        // stays reproducible
        let pass_seed = self.pass_seed();
        let seeds: Vec<u64> = (start..end).map(|k| derive_seed(pass_seed, k as u64 + 1)).collect();
        let dataset = &self.dataset;
        let samples = self.indices[start..end]
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| dataset.load(index, &mut StdRng::seed_from_u64(seed)))
            .collect::<Result<Vec<_>>>()?;

        let [c, h, w] = dataset.sample_shape();
        let mut batch = Array4::<f32>::zeros((self.batch_size, c, h, w));
        for (batch_idx, sample) in samples.iter().enumerate() {
            batch.index_axis_mut(Axis(0), batch_idx).assign(sample);
        }

        self.current_idx = end;
        Ok(Some(batch))
    }

    fn num_batches(&self) -> usize {
        self.indices.len() / self.batch_size
    }

    fn seek(&mut self, pass: usize, batch: usize) -> Result<()> {
        if batch > self.num_batches() {
            return Err(InpaintError::Config(format!(
                "cannot seek to batch {} of a {}-batch pass",
                batch,
                self.num_batches()
            )));
        }
        if pass != self.pass {
            self.pass = pass;
            self.order_pass();
        }
        self.current_idx = batch * self.batch_size;
        Ok(())
    }
}
