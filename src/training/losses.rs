//! Loss functions for WGAN-GP inpainting
//!
//! Provides the critic and generator Wasserstein terms, the gradient
//! penalty, the reconstruction L1, and the per-iteration loss record with
//! its weighted combination into the two objectives.

use tch::{nn::Module, Device, Kind, Tensor};

use crate::error::{InpaintError, Result};
use crate::utils::LossWeights;

/// Keys in the order they are logged
pub const LOSS_KEYS: [&str; 7] = ["l1", "ae", "wgan_g", "wgan_d", "wgan_gp", "g", "d"];

/// Wasserstein loss for the generator: -E[D(G(z))]
pub fn generator_loss_wasserstein(fake_output: &Tensor) -> Tensor {
    -fake_output.mean(Kind::Float)
}

/// Wasserstein loss for the critic: E[D(G(z))] - E[D(x)]
pub fn discriminator_loss_wasserstein(real_output: &Tensor, fake_output: &Tensor) -> Tensor {
    fake_output.mean(Kind::Float) - real_output.mean(Kind::Float)
}

/// Mean absolute error
pub fn l1_loss(prediction: &Tensor, target: &Tensor) -> Tensor {
    (prediction - target).abs().mean(Kind::Float)
}

/// WGAN-GP penalty `E[(||grad D(x_hat)||_2 - 1)^2]`
///
/// `x_hat` is a per-sample random interpolation between `real` and `fake`.
/// The gradient graph is kept so the penalty itself is differentiable.
pub fn gradient_penalty<M: Module>(critic: &M, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
    let batch_size = real.size()[0];
    let alpha = Tensor::rand([batch_size, 1, 1, 1], (Kind::Float, real.device())).expand_as(real);
    let interpolates = (&alpha * real + (Tensor::ones_like(&alpha) - &alpha) * fake)
        .detach()
        .set_requires_grad(true);

    let scores = critic.forward(&interpolates);
    let gradients = Tensor::f_run_backward(&[scores.sum(Kind::Float)], &[&interpolates], true, true)?
        .into_iter()
        .next()
        .ok_or_else(|| InpaintError::Shape("critic produced no input gradient".to_string()))?;

    let norms = gradients
        .view([batch_size, -1])
        .norm_scalaropt_dim(2, [1], false);
    Ok((norms - 1.0).square().mean(Kind::Float))
}

/// Reduce any tensor to a 0-d scalar by its mean
pub fn scalarize(loss: &Tensor) -> Tensor {
    if loss.dim() == 0 {
        loss.shallow_clone()
    } else {
        loss.mean(Kind::Float)
    }
}

/// Mean of per-replica scalars
pub fn mean_reduce(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_on<'a>(values: impl Iterator<Item = &'a Tensor>, device: Device) -> Tensor {
    let moved: Vec<Tensor> = values.map(|t| scalarize(t).to_device(device)).collect();
    Tensor::stack(&moved, 0).mean(Kind::Float)
}

/// Losses that only exist on generator iterations
#[derive(Debug)]
pub struct GeneratorLosses {
    /// Patch reconstruction, spatially discounted
    pub l1: Tensor,
    /// Reconstruction outside the hole
    pub ae: Tensor,
    /// Adversarial term
    pub wgan_g: Tensor,
}

/// Raw losses produced by one forward pass
#[derive(Debug)]
pub struct LossRecord {
    pub wgan_d: Tensor,
    pub wgan_gp: Tensor,
    pub generator: Option<GeneratorLosses>,
}

impl LossRecord {
    /// Mean-reduce every entry to a scalar
    pub fn scalarized(&self) -> LossRecord {
        LossRecord {
            wgan_d: scalarize(&self.wgan_d),
            wgan_gp: scalarize(&self.wgan_gp),
            generator: self.generator.as_ref().map(|g| GeneratorLosses {
                l1: scalarize(&g.l1),
                ae: scalarize(&g.ae),
                wgan_g: scalarize(&g.wgan_g),
            }),
        }
    }

    /// Average records from several replicas onto `device`
    ///
    /// Generator losses survive only if every replica produced them.
    pub fn mean_of(records: &[LossRecord], device: Device) -> Result<LossRecord> {
        if records.is_empty() {
            return Err(InpaintError::Replica("no loss records to reduce".to_string()));
        }

        let generators: Option<Vec<&GeneratorLosses>> =
            records.iter().map(|r| r.generator.as_ref()).collect();
        let generator = generators.map(|gens| GeneratorLosses {
            l1: mean_on(gens.iter().map(|g| &g.l1), device),
            ae: mean_on(gens.iter().map(|g| &g.ae), device),
            wgan_g: mean_on(gens.iter().map(|g| &g.wgan_g), device),
        });

        Ok(LossRecord {
            wgan_d: mean_on(records.iter().map(|r| &r.wgan_d), device),
            wgan_gp: mean_on(records.iter().map(|r| &r.wgan_gp), device),
            generator,
        })
    }

    /// `d = wgan_d + wgan_gp * wgan_gp_lambda`
    pub fn discriminator_objective(&self, weights: &LossWeights) -> Tensor {
        &self.wgan_d + &self.wgan_gp * weights.wgan_gp_lambda
    }

    /// `g = l1 * l1_loss_alpha + ae * ae_loss_alpha + wgan_g * gan_loss_alpha`
    pub fn generator_objective(&self, weights: &LossWeights) -> Result<Tensor> {
        let g = self.generator.as_ref().ok_or(InpaintError::MissingGeneratorLoss)?;
        Ok(&g.l1 * weights.l1_loss_alpha
            + &g.ae * weights.ae_loss_alpha
            + &g.wgan_g * weights.gan_loss_alpha)
    }
}

/// Host-side values of one iteration's losses, missing keys as 0
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossSnapshot {
    pub l1: f64,
    pub ae: f64,
    pub wgan_g: f64,
    pub wgan_d: f64,
    pub wgan_gp: f64,
    pub g: f64,
    pub d: f64,
}

impl LossSnapshot {
    pub fn new(record: &LossRecord, d: &Tensor, g: Option<&Tensor>) -> Self {
        let value = |t: &Tensor| t.double_value(&[]);
        let mut snapshot = Self {
            wgan_d: value(&record.wgan_d),
            wgan_gp: value(&record.wgan_gp),
            d: value(d),
            g: g.map(value).unwrap_or(0.0),
            ..Default::default()
        };
        if let Some(gen) = &record.generator {
            snapshot.l1 = value(&gen.l1);
            snapshot.ae = value(&gen.ae);
            snapshot.wgan_g = value(&gen.wgan_g);
        }
        snapshot
    }

    /// `(key, value)` pairs in logging order
    pub fn entries(&self) -> [(&'static str, f64); 7] {
        [
            (LOSS_KEYS[0], self.l1),
            (LOSS_KEYS[1], self.ae),
            (LOSS_KEYS[2], self.wgan_g),
            (LOSS_KEYS[3], self.wgan_d),
            (LOSS_KEYS[4], self.wgan_gp),
            (LOSS_KEYS[5], self.g),
            (LOSS_KEYS[6], self.d),
        ]
    }

    /// `l1: 0.123456 ae: ...` in logging order
    pub fn format(&self) -> String {
        self.entries()
            .iter()
            .map(|(k, v)| format!("{}: {:.6}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
