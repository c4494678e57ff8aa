//! Random occlusion boxes

use rand::Rng;

use crate::utils::Config;

/// Occluded rectangle of one sample, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub top: i64,
    pub left: i64,
    pub height: i64,
    pub width: i64,
}

impl BBox {
    pub fn new(top: i64, left: i64, height: i64, width: i64) -> Self {
        Self {
            top,
            left,
            height,
            width,
        }
    }

    /// Whether the box lies inside an image of the given size
    pub fn fits(&self, image_height: i64, image_width: i64) -> bool {
        self.top >= 0
            && self.left >= 0
            && self.height > 0
            && self.width > 0
            && self.top + self.height <= image_height
            && self.left + self.width <= image_width
    }
}

/// Draw one box per sample
///
/// Boxes have the configured `mask_shape` and keep at least `margin` pixels
/// from every border. With `mask_batch_same` a single box is shared by the
/// whole batch.
pub fn random_bbox<R: Rng + ?Sized>(config: &Config, batch_size: usize, rng: &mut R) -> Vec<BBox> {
    let [img_h, img_w, _] = config.data.image_shape;
    let [h, w] = config.mask.mask_shape;
    let [margin_h, margin_w] = config.mask.margin;

    // Config::validate guarantees max_top >= margin_h and max_left >= margin_w
    let max_top = img_h - margin_h - h;
    let max_left = img_w - margin_w - w;

    let draw = |rng: &mut R| {
        let top = rng.gen_range(margin_h..=max_top);
        let left = rng.gen_range(margin_w..=max_left);
        BBox::new(top as i64, left as i64, h as i64, w as i64)
    };

    if config.mask.mask_batch_same {
        let bbox = draw(rng);
        vec![bbox; batch_size]
    } else {
        (0..batch_size).map(|_| draw(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.data.image_shape = [32, 40, 3];
        config.mask.mask_shape = [12, 16];
        config.mask.margin = [2, 3];
        config
    }

    #[test]
    fn test_boxes_respect_margins() {
        let mut config = small_config();
        config.mask.mask_batch_same = false;
        let mut rng = StdRng::seed_from_u64(7);

        for bbox in random_bbox(&config, 200, &mut rng) {
            assert!(bbox.fits(32, 40));
            assert!(bbox.top >= 2 && bbox.top + bbox.height <= 30);
            assert!(bbox.left >= 3 && bbox.left + bbox.width <= 37);
            assert_eq!((bbox.height, bbox.width), (12, 16));
        }
    }

    #[test]
    fn test_batch_same() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(1);

        let boxes = random_bbox(&config, 6, &mut rng);
        assert_eq!(boxes.len(), 6);
        assert!(boxes.iter().all(|b| *b == boxes[0]));
    }

    #[test]
    fn test_mask_fills_image() {
        let mut config = small_config();
        config.mask.mask_shape = [32, 40];
        config.mask.margin = [0, 0];
        let mut rng = StdRng::seed_from_u64(3);

        let boxes = random_bbox(&config, 2, &mut rng);
        assert_eq!(boxes[0], BBox::new(0, 0, 32, 40));
    }
}
