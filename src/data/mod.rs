//! Data module: the sample source of the training loop
//!
//! This module provides:
//! - An image folder dataset
//! - A shuffling batch loader
//! - `CyclicSource`, an endless stream over any finite batch source
//! - A background prefetcher with a bounded queue

mod dataset;
mod loader;
mod prefetch;

pub use dataset::ImageDataset;
pub use loader::DataLoader;
pub use prefetch::Prefetcher;

use ndarray::Array4;
use tch::{Device, Tensor};

use crate::error::{InpaintError, Result};

/// A finite pass over the data, restartable
pub trait BatchSource {
    /// Begin a new pass
    fn restart(&mut self) -> Result<()>;

    /// Next `[B, 3, H, W]` batch of the current pass, `None` once it is done
    fn next_batch(&mut self) -> Result<Option<Array4<f32>>>;

    /// Batches per pass
    fn num_batches(&self) -> usize;

    /// Jump to batch `batch` of pass `pass`, as if every earlier batch had
    /// been drawn
    fn seek(&mut self, pass: usize, batch: usize) -> Result<()>;
}

/// An endless stream of batches
///
/// The end of a pass is not observable through this trait.
pub trait BatchStream {
    fn pull(&mut self) -> Result<Array4<f32>>;

    /// Position the stream so the next pull returns batch number `position`
    /// (zero-based, counted across passes)
    fn seek(&mut self, position: usize) -> Result<()>;
}

/// Endless stream over a [`BatchSource`]: when a pass ends the source is
/// restarted and the first batch of the new pass is returned
pub struct CyclicSource<S> {
    inner: S,
    passes: usize,
}

impl<S: BatchSource> CyclicSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, passes: 0 }
    }

    /// Completed passes over the data
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: BatchSource> BatchStream for CyclicSource<S> {
    fn pull(&mut self) -> Result<Array4<f32>> {
        if let Some(batch) = self.inner.next_batch()? {
            return Ok(batch);
        }

        self.inner.restart()?;
        self.passes += 1;
        tracing::debug!("Sample source restarted (pass {})", self.passes + 1);

        self.inner.next_batch()?.ok_or(InpaintError::NoBatches)
    }

    fn seek(&mut self, position: usize) -> Result<()> {
        let per_pass = self.inner.num_batches();
        if per_pass == 0 {
            return Err(InpaintError::NoBatches);
        }
        self.passes = position / per_pass;
        self.inner.seek(self.passes, position % per_pass)
    }
}

impl<T: BatchSource + ?Sized> BatchSource for Box<T> {
    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }

    fn next_batch(&mut self) -> Result<Option<Array4<f32>>> {
        (**self).next_batch()
    }

    fn num_batches(&self) -> usize {
        (**self).num_batches()
    }

    fn seek(&mut self, pass: usize, batch: usize) -> Result<()> {
        (**self).seek(pass, batch)
    }
}

impl<T: BatchStream + ?Sized> BatchStream for Box<T> {
    fn pull(&mut self) -> Result<Array4<f32>> {
        (**self).pull()
    }

    fn seek(&mut self, position: usize) -> Result<()> {
        (**self).seek(position)
    }
}

/// Move a host batch onto `device` as a float tensor
pub fn to_tensor(batch: &Array4<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
    let values: Vec<f32> = batch.iter().copied().collect();
    Tensor::from_slice(&values).view(shape.as_slice()).to_device(device)
}
