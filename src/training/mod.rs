//! Training module for WGAN-GP inpainting
//!
//! This module provides:
//! - Loss functions and the per-iteration loss record
//! - The iteration-based training loop
//! - Scalar sinks and throughput tracking

mod driver;
pub mod losses;
mod metrics;

pub use driver::{viz_path, TrainingLoop, TrainingSummary};
pub use losses::{mean_reduce, scalarize, GeneratorLosses, LossRecord, LossSnapshot, LOSS_KEYS};
pub use metrics::{CsvScalarWriter, ScalarHistory, ScalarSink, ThroughputMeter};
