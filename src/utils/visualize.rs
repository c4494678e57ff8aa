//! Image grid writer for training snapshots

use std::path::Path;
use tch::{Device, Kind, Tensor};

use crate::error::{InpaintError, Result};

/// Padding between grid cells, in pixels
const GRID_PADDING: i64 = 2;

/// Tile a `[N, 3, H, W]` batch into one image, `nrow` cells per row
///
/// With `normalize` the batch is min-max scaled to `[0, 1]` first;
/// otherwise values are expected to already be in `[0, 1]`.
pub fn make_grid(images: &Tensor, nrow: usize, normalize: bool) -> Result<Tensor> {
    let size = images.size();
    if size.len() != 4 || size[1] != 3 {
        return Err(InpaintError::Shape(format!(
            "image grid expects [N, 3, H, W], got {:?}",
            size
        )));
    }
    let (n, height, width) = (size[0], size[2], size[3]);
    if n == 0 {
        return Err(InpaintError::Shape("image grid of an empty batch".to_string()));
    }

    let images = images.detach().to_device(Device::Cpu).to_kind(Kind::Float);
    let images = if normalize {
        let low = images.min().double_value(&[]);
        let high = images.max().double_value(&[]);
        (images - low) / (high - low).max(1e-5)
    } else {
        images
    };

    let cols = (nrow as i64).min(n).max(1);
    let rows = (n + cols - 1) / cols;
    let cell_h = height + GRID_PADDING;
    let cell_w = width + GRID_PADDING;
    let grid = Tensor::zeros(
        [3, rows * cell_h + GRID_PADDING, cols * cell_w + GRID_PADDING],
        (Kind::Float, Device::Cpu),
    );

    for k in 0..n {
        let (row, col) = (k / cols, k % cols);
        let mut cell = grid
            .narrow(1, row * cell_h + GRID_PADDING, height)
            .narrow(2, col * cell_w + GRID_PADDING, width);
        cell.copy_(&images.get(k));
    }

    Ok(grid)
}

/// Write a batch as a single PNG grid
pub fn save_image_grid<P: AsRef<Path>>(
    images: &Tensor,
    path: P,
    nrow: usize,
    normalize: bool,
) -> Result<()> {
    let grid = make_grid(images, nrow, normalize)?;
    let size = grid.size();
    let (height, width) = (size[1] as u32, size[2] as u32);

    let pixels = (grid * 255.0 + 0.5)
        .clamp(0.0, 255.0)
        .permute([1, 2, 0])
        .to_kind(Kind::Uint8)
        .contiguous()
        .flatten(0, -1);
    let buffer = Vec::<u8>::try_from(&pixels)?;

    let image = image::RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
        InpaintError::Shape(format!("pixel buffer does not fit {}x{}", width, height))
    })?;
    image.save(path)?;
    Ok(())
}
