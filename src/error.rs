//! Error types for the inpainting trainer

use std::path::PathBuf;

/// Errors raised by the library
#[derive(thiserror::Error, Debug)]
pub enum InpaintError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No valid checkpoint found in {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Dataset at {} contains no usable images", .0.display())]
    EmptyDataset(PathBuf),

    #[error("Sample source yields no batches")]
    NoBatches,

    #[error("Batch prefetch worker stopped: {0}")]
    Prefetch(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Batch of {batch_size} samples cannot be split evenly across {devices} devices")]
    UnevenShards { batch_size: usize, devices: usize },

    #[error("Replica failed: {0}")]
    Replica(String),

    #[error("Generator step requested but generator losses were not computed this iteration")]
    MissingGeneratorLoss,

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, InpaintError>;

/// `err` followed by each of its causes, joined with `": "`
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
