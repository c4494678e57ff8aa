//! Utility module with helper functions
//!
//! This module provides:
//! - Configuration handling
//! - Checkpoint file layout and discovery
//! - Image grid visualization
//! - Logging setup
//! - Seed derivation for reproducible random streams

mod config;
pub mod checkpoint;
pub mod logging;
pub mod seed;
pub mod visualize;

pub use config::{
    Config, DataConfig, DeviceConfig, LossWeights, MaskConfig, MaskType, ModelConfig,
    OptimConfig, ScheduleConfig,
};
pub use checkpoint::{find_latest_checkpoint, list_checkpoints, CheckpointMeta, CheckpointPaths};
pub use seed::derive_seed;
pub use visualize::save_image_grid;
