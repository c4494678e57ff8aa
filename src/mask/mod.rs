//! Occlusion generator
//!
//! This module provides:
//! - Random boxes, one per sample
//! - Binary masks built from boxes
//! - Masked inputs (hole or mosaic fill)
//! - Local patch cropping and the spatial discounting mask used by the L1 loss
//!
//! Everything here is a pure function of its arguments and the rng it is
//! handed; nothing keeps state between calls.

mod bbox;

pub use bbox::{random_bbox, BBox};

use rand::Rng;
use tch::{Device, Kind, Tensor};

use crate::error::{InpaintError, Result};
use crate::utils::{Config, MaskType};

/// Build a `[B, 1, H, W]` mask with ones inside each box
///
/// Each side of the filled area is pulled in by a random amount in
/// `0..=max_delta / 2`, so the mask never leaves its box.
pub fn bbox_to_mask<R: Rng + ?Sized>(
    boxes: &[BBox],
    height: usize,
    width: usize,
    max_delta: [usize; 2],
    rng: &mut R,
) -> Tensor {
    let plane = height * width;
    let mut values = vec![0f32; boxes.len() * plane];

    for (i, bbox) in boxes.iter().enumerate() {
        let delta_h = rng.gen_range(0..=max_delta[0] / 2) as i64;
        let delta_w = rng.gen_range(0..=max_delta[1] / 2) as i64;

        let row_start = (bbox.top + delta_h).max(0) as usize;
        let row_end = (bbox.top + bbox.height - delta_h).min(height as i64).max(0) as usize;
        let col_start = (bbox.left + delta_w).max(0) as usize;
        let col_end = (bbox.left + bbox.width - delta_w).min(width as i64).max(0) as usize;

        let sample = &mut values[i * plane..(i + 1) * plane];
        for row in row_start..row_end {
            for col in col_start..col_end {
                sample[row * width + col] = 1.0;
            }
        }
    }

    Tensor::from_slice(&values).view([boxes.len() as i64, 1, height as i64, width as i64])
}

/// Occlude a batch of ground-truth images
///
/// Returns `(masked_input, mask)`; the mask lives on the device of `x`.
pub fn mask_image<R: Rng + ?Sized>(
    x: &Tensor,
    boxes: &[BBox],
    config: &Config,
    rng: &mut R,
) -> Result<(Tensor, Tensor)> {
    let [height, width, _] = config.data.image_shape;
    let size = x.size();
    if size.len() != 4 || size[2] != height as i64 || size[3] != width as i64 {
        return Err(InpaintError::Shape(format!(
            "expected images of {}x{}, got {:?}",
            height, width, size
        )));
    }
    if size[0] != boxes.len() as i64 {
        return Err(InpaintError::Shape(format!(
            "{} boxes for a batch of {}",
            boxes.len(),
            size[0]
        )));
    }

    let mask = bbox_to_mask(boxes, height, width, config.mask.max_delta_shape, rng)
        .to_device(x.device());
    let keep = Tensor::ones_like(&mask) - &mask;

    let masked = match config.mask.mask_type {
        MaskType::Hole => x * &keep,
        MaskType::Mosaic => {
            let unit = config.mask.mosaic_unit_size as i64;
            let small_h = (height as i64 / unit).max(1);
            let small_w = (width as i64 / unit).max(1);
            let downsampled = x.upsample_nearest2d([small_h, small_w], None::<f64>, None::<f64>);
            let mosaic = downsampled.upsample_nearest2d([height as i64, width as i64], None::<f64>, None::<f64>);
            mosaic * &mask + x * &keep
        }
    };

    Ok((masked, mask))
}

/// Crop each sample's box out of a `[B, C, H, W]` batch
pub fn local_patch(x: &Tensor, boxes: &[BBox]) -> Tensor {
    let patches: Vec<Tensor> = boxes
        .iter()
        .enumerate()
        .map(|(i, bbox)| {
            x.get(i as i64)
                .narrow(1, bbox.top, bbox.height)
                .narrow(2, bbox.left, bbox.width)
        })
        .collect();
    Tensor::stack(&patches, 0)
}

/// `[1, 1, h, w]` weights that decay towards the centre of the hole
///
/// Pixel `(i, j)` gets `max(gamma^min(i, h - i), gamma^min(j, w - j))`.
/// With `discounted_mask` off the weights are all ones.
pub fn spatial_discounting_mask(config: &Config, device: Device) -> Tensor {
    let [height, width] = config.mask.mask_shape;
    let shape = [1, 1, height as i64, width as i64];

    if !config.mask.discounted_mask {
        return Tensor::ones(shape, (Kind::Float, device));
    }

    let gamma = config.mask.spatial_discounting_gamma;
    let mut values = Vec::with_capacity(height * width);
    for i in 0..height {
        for j in 0..width {
            let di = i.min(height - i) as i32;
            let dj = j.min(width - j) as i32;
            values.push(gamma.powi(di).max(gamma.powi(dj)) as f32);
        }
    }

    Tensor::from_slice(&values).view(shape).to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.data.image_shape = [16, 16, 3];
        config.mask.mask_shape = [8, 8];
        config.mask.max_delta_shape = [4, 4];
        config
    }

    #[test]
    fn test_mask_inside_box() {
        let mut rng = StdRng::seed_from_u64(11);
        let boxes = vec![BBox::new(2, 4, 8, 8), BBox::new(8, 0, 8, 8)];
        let mask = bbox_to_mask(&boxes, 16, 16, [4, 4], &mut rng);

        assert_eq!(mask.size(), vec![2, 1, 16, 16]);
        for (i, bbox) in boxes.iter().enumerate() {
            let sample = mask.get(i as i64);
            let inside = sample
                .narrow(1, bbox.top, bbox.height)
                .narrow(2, bbox.left, bbox.width)
                .sum(Kind::Float)
                .double_value(&[]);
            let total = sample.sum(Kind::Float).double_value(&[]);
            // Shrink is at most 2 per side, so at least a 4x4 core remains
            assert!(inside >= 16.0);
            assert_eq!(inside, total);
        }
    }

    #[test]
    fn test_no_delta_fills_box() {
        let mut rng = StdRng::seed_from_u64(0);
        let mask = bbox_to_mask(&[BBox::new(1, 1, 3, 5)], 8, 8, [0, 0], &mut rng);
        assert_eq!(mask.sum(Kind::Float).double_value(&[]), 15.0);
    }

    #[test]
    fn test_hole_zeroes_masked_pixels() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(5);
        let x = Tensor::ones([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let boxes = random_bbox(&config, 2, &mut rng);

        let (masked, mask) = mask_image(&x, &boxes, &config, &mut rng).unwrap();
        let overlap = (&masked * &mask).abs().sum(Kind::Float).double_value(&[]);
        let visible = masked.sum(Kind::Float).double_value(&[]);
        let unmasked = (Tensor::ones_like(&mask) - &mask).sum(Kind::Float).double_value(&[]) * 3.0;

        assert_eq!(overlap, 0.0);
        assert_eq!(visible, unmasked);
    }

    #[test]
    fn test_mosaic_keeps_shape() {
        let mut config = small_config();
        config.mask.mask_type = MaskType::Mosaic;
        config.mask.mosaic_unit_size = 4;
        let mut rng = StdRng::seed_from_u64(5);
        let x = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let boxes = random_bbox(&config, 2, &mut rng);

        let (masked, _) = mask_image(&x, &boxes, &config, &mut rng).unwrap();
        assert_eq!(masked.size(), vec![2, 3, 16, 16]);
    }

    #[test]
    fn test_mask_image_rejects_wrong_shape() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(5);
        let x = Tensor::ones([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let boxes = random_bbox(&config, 2, &mut rng);

        assert!(mask_image(&x, &boxes, &config, &mut rng).is_err());
    }

    #[test]
    fn test_local_patch() {
        let x = Tensor::arange(2 * 3 * 16 * 16, (Kind::Float, Device::Cpu)).view([2, 3, 16, 16]);
        let boxes = vec![BBox::new(0, 0, 8, 8), BBox::new(4, 6, 8, 8)];
        let patches = local_patch(&x, &boxes);

        assert_eq!(patches.size(), vec![2, 3, 8, 8]);
        let expected = x.double_value(&[1, 0, 4, 6]);
        assert_eq!(patches.double_value(&[1, 0, 0, 0]), expected);
    }

    #[test]
    fn test_spatial_discounting() {
        let config = small_config();
        let sd = spatial_discounting_mask(&config, Device::Cpu);

        assert_eq!(sd.size(), vec![1, 1, 8, 8]);
        assert_eq!(sd.double_value(&[0, 0, 0, 0]), 1.0);
        assert!(sd.double_value(&[0, 0, 4, 4]) < 1.0);

        let mut flat = config.clone();
        flat.mask.discounted_mask = false;
        let ones = spatial_discounting_mask(&flat, Device::Cpu);
        assert_eq!(ones.sum(Kind::Float).double_value(&[]), 64.0);
    }
}
