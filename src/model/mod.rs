//! Model module containing the inpainting GAN
//!
//! This module provides:
//! - A two-stage coarse/fine generator
//! - Local and global WGAN critics
//! - Adam with checkpointable state
//! - `InpaintTrainer`, which owns the networks and optimizers of one device
//! - `ReplicaCoordinator`, which spreads a batch over several devices
//!
//! The training loop only sees the [`InpaintModel`] trait, so a single
//! trainer and a coordinator are interchangeable.

mod discriminator;
mod generator;
mod optim;
mod replica;
mod trainer;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};
pub use optim::Adam;
pub use replica::ReplicaCoordinator;
pub use trainer::InpaintTrainer;

use std::path::Path;

use tch::{Device, Tensor};

use crate::error::{InpaintError, Result};
use crate::mask::BBox;
use crate::training::LossRecord;

/// Which network a gradient operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Net {
    Generator,
    /// Both critics
    Discriminator,
}

/// One occluded batch, everything on the same device
#[derive(Debug)]
pub struct MaskedBatch {
    /// Original images `[B, 3, H, W]`
    pub ground_truth: Tensor,
    /// Occluded images `[B, 3, H, W]`
    pub input: Tensor,
    /// `[B, 1, H, W]`, 1 inside the hole
    pub mask: Tensor,
    /// One box per sample
    pub boxes: Vec<BBox>,
}

impl MaskedBatch {
    pub fn batch_size(&self) -> usize {
        self.boxes.len()
    }

    /// Split into equal contiguous shards, shard `i` moved to `devices[i]`
    pub fn shard(&self, devices: &[Device]) -> Result<Vec<MaskedBatch>> {
        let n = devices.len();
        let batch_size = self.batch_size();
        if n == 0 || batch_size % n != 0 {
            return Err(InpaintError::UnevenShards {
                batch_size,
                devices: n,
            });
        }

        let per = batch_size / n;
        Ok(devices
            .iter()
            .enumerate()
            .map(|(i, &device)| {
                let start = (i * per) as i64;
                let take = |t: &Tensor| t.narrow(0, start, per as i64).to_device(device);
                MaskedBatch {
                    ground_truth: take(&self.ground_truth),
                    input: take(&self.input),
                    mask: take(&self.mask),
                    boxes: self.boxes[i * per..(i + 1) * per].to_vec(),
                }
            })
            .collect())
    }
}

/// Result of one forward pass
#[derive(Debug)]
pub struct ForwardOutput {
    pub losses: LossRecord,
    /// Final output pasted into the known pixels, `[B, 3, H, W]`
    pub inpainted: Tensor,
    /// Attention flow visualization, if the generator produces one
    pub offset_flow: Option<Tensor>,
}

/// Something the training loop can drive
pub trait InpaintModel {
    /// Compute the losses of one batch
    ///
    /// Critic losses are always produced; generator losses only when
    /// `compute_generator_loss` is set.
    fn forward(&mut self, batch: &MaskedBatch, compute_generator_loss: bool) -> Result<ForwardOutput>;

    /// Clear the accumulated gradients of `net`
    fn zero_grad(&mut self, net: Net);

    /// Apply one optimizer update to `net`
    fn step(&mut self, net: Net) -> Result<()>;

    /// Write the checkpoint set for `iteration` into `dir`
    fn save(&self, dir: &Path, iteration: usize) -> Result<()>;

    /// Load the newest checkpoint in `dir` and return its iteration
    fn resume(&mut self, dir: &Path) -> Result<usize>;

    /// Device batches must be placed on
    fn device(&self) -> Device;
}

impl<M: InpaintModel + ?Sized> InpaintModel for Box<M> {
    fn forward(&mut self, batch: &MaskedBatch, compute_generator_loss: bool) -> Result<ForwardOutput> {
        (**self).forward(batch, compute_generator_loss)
    }

    fn zero_grad(&mut self, net: Net) {
        (**self).zero_grad(net)
    }

    fn step(&mut self, net: Net) -> Result<()> {
        (**self).step(net)
    }

    fn save(&self, dir: &Path, iteration: usize) -> Result<()> {
        (**self).save(dir, iteration)
    }

    fn resume(&mut self, dir: &Path) -> Result<usize> {
        (**self).resume(dir)
    }

    fn device(&self) -> Device {
        (**self).device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn batch(n: i64) -> MaskedBatch {
        let gt = Tensor::arange(n, (Kind::Float, Device::Cpu)).view([n, 1, 1, 1]).expand([n, 3, 4, 4], false).contiguous();
        MaskedBatch {
            input: gt.shallow_clone(),
            mask: Tensor::zeros([n, 1, 4, 4], (Kind::Float, Device::Cpu)),
            ground_truth: gt,
            boxes: (0..n).map(|i| BBox::new(i, 0, 1, 1)).collect(),
        }
    }

    #[test]
    fn test_shard_keeps_batch_order() {
        let shards = batch(4).shard(&[Device::Cpu, Device::Cpu]).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[1].batch_size(), 2);
        assert_eq!(shards[1].ground_truth.double_value(&[0, 0, 0, 0]), 2.0);
        assert_eq!(shards[1].boxes[0].top, 2);
    }

    #[test]
    fn test_uneven_shards_rejected() {
        let err = batch(3).shard(&[Device::Cpu, Device::Cpu]).unwrap_err();
        assert!(matches!(
            err,
            InpaintError::UnevenShards {
                batch_size: 3,
                devices: 2
            }
        ));
    }
}
