//! Image folder dataset
//!
//! Images are decoded with the `image` crate, brought to the configured
//! shape by random crop or resize, and returned as `[3, H, W]` arrays
//! scaled to `[-1, 1]`.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use rand::Rng;
use std::path::{Path, PathBuf};

use crate::error::{InpaintError, Result};
use crate::utils::DataConfig;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Training images found under a root directory
#[derive(Debug, Clone)]
pub struct ImageDataset {
    root: PathBuf,
    paths: Vec<PathBuf>,
    height: u32,
    width: u32,
    random_crop: bool,
}

impl ImageDataset {
    /// Scan `train_data_path` (one level deeper with `data_with_subfolder`)
    pub fn new(config: &DataConfig) -> Result<Self> {
        let root = PathBuf::from(&config.train_data_path);
        let mut paths = if config.data_with_subfolder {
            let mut subdirs: Vec<PathBuf> = std::fs::read_dir(&root)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            subdirs.sort();

            let mut paths = Vec::new();
            for dir in subdirs {
                paths.extend(image_files(&dir)?);
            }
            paths
        } else {
            image_files(&root)?
        };
        paths.sort();

        if config.subset_frac < 1.0 {
            let keep = ((paths.len() as f64 * config.subset_frac).round() as usize).max(1);
            paths.truncate(keep);
        }

        let [height, width, _] = config.image_shape;
        Self::from_paths(root, paths, height as u32, width as u32, config.random_crop)
    }

    /// Build from an explicit file list
    pub fn from_paths(
        root: PathBuf,
        paths: Vec<PathBuf>,
        height: u32,
        width: u32,
        random_crop: bool,
    ) -> Result<Self> {
        if paths.is_empty() {
            return Err(InpaintError::EmptyDataset(root));
        }
        Ok(Self {
            root,
            paths,
            height,
            width,
            random_crop,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Output shape `[3, H, W]`
    pub fn sample_shape(&self) -> [usize; 3] {
        [3, self.height as usize, self.width as usize]
    }

    /// Decode sample `index`; `rng` picks the crop window
    pub fn load<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Array3<f32>> {
        let image = image::open(&self.paths[index])?.to_rgb8();
        let image = self.fit(image, rng);
        Ok(to_chw(&image))
    }

    fn fit<R: Rng + ?Sized>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        let (w, h) = image.dimensions();
        if !self.random_crop {
            if (w, h) == (self.width, self.height) {
                return image;
            }
            return imageops::resize(&image, self.width, self.height, FilterType::Triangle);
        }

        // Upscale first if the image is smaller than the crop window
        let image = if w < self.width || h < self.height {
            let scale = (self.width as f64 / w as f64).max(self.height as f64 / h as f64);
            let new_w = ((w as f64 * scale).ceil() as u32).max(self.width);
            let new_h = ((h as f64 * scale).ceil() as u32).max(self.height);
            imageops::resize(&image, new_w, new_h, FilterType::Triangle)
        } else {
            image
        };

        let (w, h) = image.dimensions();
        let left = rng.gen_range(0..=w - self.width);
        let top = rng.gen_range(0..=h - self.height);
        imageops::crop_imm(&image, left, top, self.width, self.height).to_image()
    }
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let files = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    Ok(files)
}

/// `[H, W, 3]` u8 pixels to `[3, H, W]` floats in `[-1, 1]`
fn to_chw(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    let mut out = Array3::<f32>::zeros((3, h as usize, w as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            out[[c, y as usize, x as usize]] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    out
}
