//! # Generative Image Inpainting
//!
//! This crate trains a coarse-to-fine inpainting generator against a local
//! and a global WGAN-GP critic.
//!
//! ## Modules
//!
//! - `data`: Image folder dataset, batch loader and prefetcher
//! - `mask`: Random boxes, masks and local patches
//! - `model`: Networks, optimizers, the single-device trainer and the
//!   multi-device replica coordinator
//! - `training`: Losses, the training loop and metric sinks
//! - `utils`: Configuration, checkpoints, visualization and logging

pub mod data;
pub mod error;
pub mod mask;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{BatchSource, BatchStream, CyclicSource, DataLoader, ImageDataset, Prefetcher};
pub use error::{InpaintError, Result};
pub use model::{ForwardOutput, InpaintModel, InpaintTrainer, MaskedBatch, Net, ReplicaCoordinator};
pub use training::{CsvScalarWriter, LossRecord, ScalarSink, TrainingLoop, TrainingSummary};
pub use utils::{Config, MaskType};
