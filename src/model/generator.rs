//! Two-stage inpainting generator
//!
//! A coarse network fills the hole from the masked image; a refinement
//! network of the same shape takes the coarse result pasted into the known
//! pixels and produces the final image. Both stages see the input as
//! `[image, ones, mask]` along the channel axis.

use tch::{nn, nn::Module, Tensor};

/// Generator network configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Image channels
    pub channels: i64,
    /// Base number of filters
    pub base_filters: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            base_filters: 32,
        }
    }
}

/// `k x k` convolution with "same" padding for the given dilation
fn gen_conv(vs: nn::Path, c_in: i64, c_out: i64, k: i64, stride: i64, rate: i64) -> nn::Conv2D {
    let conv_config = nn::ConvConfig {
        stride,
        padding: rate * (k - 1) / 2,
        dilation: rate,
        ..Default::default()
    };
    nn::conv2d(vs, c_in, c_out, k, conv_config)
}

/// One encoder / dilated bottleneck / decoder stage
///
/// Spatial size is divided by 4 in the encoder and restored by two nearest
/// upsamplings, so inputs must have sides divisible by 4.
#[derive(Debug)]
struct Stage {
    encoder: Vec<nn::Conv2D>,
    bottleneck: Vec<nn::Conv2D>,
    decoder_a: nn::Conv2D,
    decoder_b: nn::Conv2D,
    head: Vec<nn::Conv2D>,
    out: nn::Conv2D,
}

impl Stage {
    fn new(vs: &nn::Path, c_in: i64, c_out: i64, cnum: i64) -> Self {
        let encoder = vec![
            gen_conv(vs / "conv1", c_in, cnum, 5, 1, 1),
            gen_conv(vs / "conv2_down", cnum, cnum * 2, 3, 2, 1),
            gen_conv(vs / "conv3", cnum * 2, cnum * 2, 3, 1, 1),
            gen_conv(vs / "conv4_down", cnum * 2, cnum * 4, 3, 2, 1),
            gen_conv(vs / "conv5", cnum * 4, cnum * 4, 3, 1, 1),
        ];
        let bottleneck = vec![
            gen_conv(vs / "atrous1", cnum * 4, cnum * 4, 3, 1, 2),
            gen_conv(vs / "atrous2", cnum * 4, cnum * 4, 3, 1, 4),
            gen_conv(vs / "atrous3", cnum * 4, cnum * 4, 3, 1, 8),
            gen_conv(vs / "conv6", cnum * 4, cnum * 4, 3, 1, 1),
        ];
        let decoder_a = gen_conv(vs / "conv7", cnum * 4, cnum * 2, 3, 1, 1);
        let decoder_b = gen_conv(vs / "conv8", cnum * 2, cnum, 3, 1, 1);
        let head = vec![gen_conv(vs / "conv9", cnum, cnum / 2, 3, 1, 1)];
        let out = gen_conv(vs / "conv10", cnum / 2, c_out, 3, 1, 1);

        Self {
            encoder,
            bottleneck,
            decoder_a,
            decoder_b,
            head,
            out,
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let mut h = x.shallow_clone();
        for conv in self.encoder.iter().chain(self.bottleneck.iter()) {
            h = conv.forward(&h).elu();
        }

        h = upsample2x(&h);
        h = self.decoder_a.forward(&h).elu();
        h = upsample2x(&h);
        h = self.decoder_b.forward(&h).elu();

        for conv in &self.head {
            h = conv.forward(&h).elu();
        }
        self.out.forward(&h).clamp(-1.0, 1.0)
    }
}

fn upsample2x(x: &Tensor) -> Tensor {
    let size = x.size();
    x.upsample_nearest2d([size[2] * 2, size[3] * 2], None::<f64>, None::<f64>)
}

/// Coarse-to-fine generator
#[derive(Debug)]
pub struct Generator {
    config: GeneratorConfig,
    coarse: Stage,
    fine: Stage,
}

impl Generator {
    /// Create a new Generator network
    pub fn new(vs: &nn::Path, config: GeneratorConfig) -> Self {
        // image + ones + mask
        let c_in = config.channels + 2;
        let coarse = Stage::new(&(vs / "coarse"), c_in, config.channels, config.base_filters);
        let fine = Stage::new(&(vs / "fine"), c_in, config.channels, config.base_filters);

        Self {
            config,
            coarse,
            fine,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Masked images `[B, C, H, W]` in `[-1, 1]`
    /// * `mask` - `[B, 1, H, W]`, 1 inside the hole
    ///
    /// # Returns
    ///
    /// `(coarse, fine, offset_flow)`; this network has no attention branch
    /// so the flow is always `None`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> (Tensor, Tensor, Option<Tensor>) {
        let ones = Tensor::ones_like(mask);
        let keep = &ones - mask;

        let x1 = self.coarse.forward(&Tensor::cat(&[x, &ones, mask], 1));

        let x1_inpaint = &x1 * mask + x * &keep;
        let x2 = self.fine.forward(&Tensor::cat(&[&x1_inpaint, &ones, mask], 1));

        (x1, x2, None)
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_generator_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = GeneratorConfig {
            channels: 3,
            base_filters: 4,
        };
        let generator = Generator::new(&vs.root(), config);

        let x = Tensor::rand([2, 3, 16, 12], (Kind::Float, Device::Cpu));
        let mask = Tensor::zeros([2, 1, 16, 12], (Kind::Float, Device::Cpu));
        let (x1, x2, flow) = generator.forward(&x, &mask);

        assert_eq!(x1.size(), vec![2, 3, 16, 12]);
        assert_eq!(x2.size(), vec![2, 3, 16, 12]);
        assert!(flow.is_none());
        assert!(x2.max().double_value(&[]) <= 1.0);
        assert!(x2.min().double_value(&[]) >= -1.0);
    }
}
