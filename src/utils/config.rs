//! Configuration management
//!
//! One immutable configuration is loaded at startup and passed by reference
//! to every component. Every field is required in the file: a missing key is
//! a deserialization error, so the run stops before training begins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{InpaintError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dataset name, first component of the run directory
    pub dataset_name: String,
    /// Experiment name, suffix of the run directory
    pub expname: String,
    /// Data configuration
    pub data: DataConfig,
    /// Occlusion geometry
    pub mask: MaskConfig,
    /// Network widths
    pub model: ModelConfig,
    /// Adam hyperparameters shared by both optimizers
    pub optim: OptimConfig,
    /// Loss composition weights
    pub loss: LossWeights,
    /// Iteration schedule and cadences
    pub train: ScheduleConfig,
    /// Compute devices
    pub device: DeviceConfig,
}

/// Data-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root directory of training images
    pub train_data_path: String,
    /// Whether images live one level down, in per-class folders
    pub data_with_subfolder: bool,
    /// Image shape as [height, width, channels]
    pub image_shape: [usize; 3],
    /// Random crop to `image_shape` instead of resizing
    pub random_crop: bool,
    /// Fraction of the image list to keep, in (0, 1]
    pub subset_frac: f64,
    /// Batch size
    pub batch_size: usize,
    /// Prefetch depth; 0 loads batches on the training thread
    pub num_workers: usize,
}

/// How the occluded region of the input is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    /// Occluded pixels are zeroed
    Hole,
    /// Occluded pixels are replaced by a coarse nearest-neighbour mosaic
    Mosaic,
}

impl fmt::Display for MaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskType::Hole => write!(f, "hole"),
            MaskType::Mosaic => write!(f, "mosaic"),
        }
    }
}

/// Occlusion geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskConfig {
    /// Box shape as [height, width]
    pub mask_shape: [usize; 2],
    /// Use one box for the whole batch
    pub mask_batch_same: bool,
    /// Maximum total shrink of the mask inside its box, [height, width]
    pub max_delta_shape: [usize; 2],
    /// Minimum distance of the box from the image border, [height, width]
    pub margin: [usize; 2],
    /// Fill mode
    pub mask_type: MaskType,
    /// Mosaic cell size in pixels
    pub mosaic_unit_size: usize,
    /// Weight the local L1 loss towards the hole centre
    pub discounted_mask: bool,
    /// Discount base
    pub spatial_discounting_gamma: f64,
}

/// Network widths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base filters for the generator
    pub gen_base_filters: i64,
    /// Base filters for both discriminators
    pub disc_base_filters: i64,
}

/// Adam hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
}

/// Loss composition weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossWeights {
    /// Weight of the coarse stage inside `l1` and `ae`
    pub coarse_l1_alpha: f64,
    /// Weight of `l1` in the generator objective
    pub l1_loss_alpha: f64,
    /// Weight of `ae` in the generator objective
    pub ae_loss_alpha: f64,
    /// Weight of the global critic relative to the local one
    pub global_wgan_loss_alpha: f64,
    /// Weight of `wgan_g` in the generator objective
    pub gan_loss_alpha: f64,
    /// Weight of `wgan_gp` in the discriminator objective
    pub wgan_gp_lambda: f64,
}

/// Iteration schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Generator update period (discriminator updates per generator update)
    pub n_critic: usize,
    /// Total number of iterations
    pub niter: usize,
    /// Logging cadence
    pub print_iter: usize,
    /// Visualization cadence
    pub viz_iter: usize,
    /// Maximum samples per visualization grid
    pub viz_max_out: usize,
    /// Checkpoint cadence
    pub snapshot_save_iter: usize,
    /// Checkpoint directory to resume from
    #[serde(default)]
    pub resume: Option<String>,
}

/// Compute devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Train on CUDA devices
    pub cuda: bool,
    /// CUDA device ordinals
    pub gpu_ids: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_name: "imagenet".to_string(),
            expname: "benchmark".to_string(),
            data: DataConfig {
                train_data_path: "data/train".to_string(),
                data_with_subfolder: false,
                image_shape: [256, 256, 3],
                random_crop: true,
                subset_frac: 1.0,
                batch_size: 16,
                num_workers: 4,
            },
            mask: MaskConfig {
                mask_shape: [128, 128],
                mask_batch_same: true,
                max_delta_shape: [32, 32],
                margin: [0, 0],
                mask_type: MaskType::Hole,
                mosaic_unit_size: 12,
                discounted_mask: true,
                spatial_discounting_gamma: 0.9,
            },
            model: ModelConfig {
                gen_base_filters: 32,
                disc_base_filters: 64,
            },
            optim: OptimConfig {
                lr: 1e-4,
                beta1: 0.5,
                beta2: 0.9,
            },
            loss: LossWeights {
                coarse_l1_alpha: 1.2,
                l1_loss_alpha: 1.2,
                ae_loss_alpha: 1.2,
                global_wgan_loss_alpha: 1.0,
                gan_loss_alpha: 0.001,
                wgan_gp_lambda: 10.0,
            },
            train: ScheduleConfig {
                n_critic: 5,
                niter: 500_000,
                print_iter: 100,
                viz_iter: 1000,
                viz_max_out: 16,
                snapshot_save_iter: 5000,
                resume: None,
            },
            device: DeviceConfig {
                cuda: false,
                gpu_ids: vec![0],
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| InpaintError::Config(e.to_string()))
    }

    /// Save configuration to TOML file
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| InpaintError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| InpaintError::Config(e.to_string()))
    }

    /// Save configuration to JSON file
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load by extension: `.toml` as TOML, anything else as JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = if is_toml(path) {
            Self::from_toml(path)?
        } else {
            Self::from_json(path)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save by extension, mirroring [`Config::load`]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if is_toml(path) {
            self.save_toml(path)
        } else {
            self.save_json(path)
        }
    }

    /// Run directory: `checkpoints/<dataset>/<mask_type>_<expname>`
    pub fn run_dir(&self) -> PathBuf {
        Path::new("checkpoints")
            .join(&self.dataset_name)
            .join(format!("{}_{}", self.mask.mask_type, self.expname))
    }

    /// Devices to train on, primary first
    ///
    /// Falls back to CPU when CUDA is requested but absent. A configured
    /// GPU id that is not visible is an error.
    pub fn devices(&self) -> Result<Vec<tch::Device>> {
        let available = if self.device.cuda {
            tch::Cuda::device_count() as usize
        } else {
            0
        };
        select_devices(self.device.cuda, &self.device.gpu_ids, available)
    }

    /// Validate semantic constraints that deserialization cannot express
    pub fn validate(&self) -> Result<()> {
        let [img_h, img_w, channels] = self.data.image_shape;
        let [mask_h, mask_w] = self.mask.mask_shape;
        let [margin_h, margin_w] = self.mask.margin;

        if channels != 3 {
            return Err(config_err(format!("image_shape must have 3 channels, got {}", channels)));
        }
        if img_h % 4 != 0 || img_w % 4 != 0 {
            return Err(config_err(format!(
                "image size {}x{} must be divisible by 4",
                img_h, img_w
            )));
        }
        if self.data.batch_size == 0 {
            return Err(config_err("batch_size must be > 0"));
        }
        if !(self.data.subset_frac > 0.0 && self.data.subset_frac <= 1.0) {
            return Err(config_err("subset_frac must be in (0, 1]"));
        }
        if mask_h == 0 || mask_w == 0 {
            return Err(config_err("mask_shape must be non-empty"));
        }
        if mask_h + 2 * margin_h > img_h || mask_w + 2 * margin_w > img_w {
            return Err(config_err(format!(
                "mask {:?} with margin {:?} does not fit in image {}x{}",
                self.mask.mask_shape, self.mask.margin, img_h, img_w
            )));
        }
        if self.model.gen_base_filters < 2 || self.model.disc_base_filters < 1 {
            return Err(config_err("gen_base_filters must be >= 2 and disc_base_filters >= 1"));
        }
        if self.mask.mask_type == MaskType::Mosaic && self.mask.mosaic_unit_size == 0 {
            return Err(config_err("mosaic_unit_size must be > 0"));
        }
        if !(self.mask.spatial_discounting_gamma > 0.0 && self.mask.spatial_discounting_gamma <= 1.0) {
            return Err(config_err("spatial_discounting_gamma must be in (0, 1]"));
        }
        for (name, value) in [
            ("n_critic", self.train.n_critic),
            ("niter", self.train.niter),
            ("print_iter", self.train.print_iter),
            ("viz_iter", self.train.viz_iter),
            ("viz_max_out", self.train.viz_max_out),
            ("snapshot_save_iter", self.train.snapshot_save_iter),
        ] {
            if value == 0 {
                return Err(config_err(format!("{} must be > 0", name)));
            }
        }
        if self.device.cuda {
            if self.device.gpu_ids.is_empty() {
                return Err(config_err("gpu_ids must not be empty when cuda is enabled"));
            }
            if self.data.batch_size % self.device.gpu_ids.len() != 0 {
                return Err(InpaintError::UnevenShards {
                    batch_size: self.data.batch_size,
                    devices: self.device.gpu_ids.len(),
                });
            }
        }
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|e| e == "toml").unwrap_or(false)
}

/// Map `gpu_ids` onto the `available` CUDA devices
fn select_devices(cuda: bool, gpu_ids: &[usize], available: usize) -> Result<Vec<tch::Device>> {
    if !cuda {
        return Ok(vec![tch::Device::Cpu]);
    }
    if available == 0 {
        tracing::warn!("CUDA requested but not available, falling back to CPU");
        return Ok(vec![tch::Device::Cpu]);
    }
    if let Some(&missing) = gpu_ids.iter().find(|&&id| id >= available) {
        return Err(config_err(format!(
            "GPU {} is not visible ({} available)",
            missing, available
        )));
    }
    Ok(gpu_ids.iter().map(|&id| tch::Device::Cuda(id)).collect())
}

fn config_err(msg: impl Into<String>) -> InpaintError {
    InpaintError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.train.n_critic, 5);
        assert_eq!(config.mask.mask_type, MaskType::Hole);
    }

    #[test]
    fn test_device_selection() {
        assert_eq!(select_devices(false, &[0, 1], 2).unwrap(), vec![tch::Device::Cpu]);
        assert_eq!(select_devices(true, &[0, 1], 0).unwrap(), vec![tch::Device::Cpu]);
        assert_eq!(
            select_devices(true, &[1, 0], 2).unwrap(),
            vec![tch::Device::Cuda(1), tch::Device::Cuda(0)]
        );
        // One visible GPU cannot host a two-GPU run
        assert!(matches!(select_devices(true, &[0, 1], 1), Err(InpaintError::Config(_))));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config.dataset_name, loaded.dataset_name);
        assert_eq!(config.data.image_shape, loaded.data.image_shape);
    }

    #[test]
    fn test_config_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        Config::default().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.train.snapshot_save_iter, 5000);
        assert!(loaded.train.resume.is_none());
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value["train"].as_object_mut().unwrap().remove("n_critic");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, value.to_string()).unwrap();

        assert!(matches!(Config::load(&path), Err(InpaintError::Config(_))));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.mask.mask_shape = [300, 128];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.train.print_iter = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.device.cuda = true;
        config.device.gpu_ids = vec![0, 1, 2];
        assert!(matches!(
            config.validate(),
            Err(InpaintError::UnevenShards { batch_size: 16, devices: 3 })
        ));
    }

    #[test]
    fn test_run_dir() {
        let config = Config::default();
        assert_eq!(
            config.run_dir(),
            PathBuf::from("checkpoints/imagenet/hole_benchmark")
        );
    }
}
