//! Critic networks for WGAN-GP
//!
//! The same convolutional critic is used twice: once on the hole-sized
//! local patch and once on the whole image. Outputs are unbounded scores,
//! not probabilities.

use tch::{nn, nn::Module, Tensor};

/// Critic configuration
#[derive(Debug, Clone)]
pub struct DiscriminatorConfig {
    /// Input height
    pub height: i64,
    /// Input width
    pub width: i64,
    /// Number of input channels
    pub channels: i64,
    /// Base number of filters
    pub base_filters: i64,
}

/// Critic network
///
/// Architecture:
/// 1. Four 5x5 stride-2 convolutions with LeakyReLU(0.2)
/// 2. Flatten and a dense layer to one score
#[derive(Debug)]
pub struct Discriminator {
    config: DiscriminatorConfig,
    /// Convolution layers
    convs: Vec<nn::Conv2D>,
    /// Final scoring layer
    fc: nn::Linear,
}

/// Output side of a 5x5 stride-2 pad-2 convolution
fn down(n: i64) -> i64 {
    (n + 1) / 2
}

impl Discriminator {
    /// Create a new critic
    pub fn new(vs: &nn::Path, config: DiscriminatorConfig) -> Self {
        let base = config.base_filters;

        let conv_config = nn::ConvConfig {
            stride: 2,
            padding: 2,
            ..Default::default()
        };

        let channels = [config.channels, base, base * 2, base * 4, base * 4];
        let convs = channels
            .windows(2)
            .enumerate()
            .map(|(i, c)| nn::conv2d(vs / format!("conv{}", i + 1), c[0], c[1], 5, conv_config))
            .collect();

        let h = (0..4).fold(config.height, |n, _| down(n));
        let w = (0..4).fold(config.width, |n, _| down(n));
        let flat_size = base * 4 * h * w;

        let fc = nn::linear(vs / "fc", flat_size, 1, Default::default());

        Self { config, convs, fc }
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}

impl Module for Discriminator {
    /// `[B, C, H, W]` to `[B, 1]` scores
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut x = input.shallow_clone();
        for conv in &self.convs {
            let h = conv.forward(&x);
            x = h.maximum(&(&h * 0.2));
        }

        let batch_size = x.size()[0];
        self.fc.forward(&x.view([batch_size, -1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_discriminator_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            height: 20,
            width: 12,
            channels: 3,
            base_filters: 4,
        };
        let critic = Discriminator::new(&vs.root(), config);

        let x = Tensor::randn([3, 3, 20, 12], (Kind::Float, Device::Cpu));
        assert_eq!(critic.forward(&x).size(), vec![3, 1]);
    }

    #[test]
    fn test_down() {
        assert_eq!(down(16), 8);
        assert_eq!(down(5), 3);
        assert_eq!(down(1), 1);
    }
}
