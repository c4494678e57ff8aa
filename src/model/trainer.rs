//! Single-device model trainer
//!
//! Owns the generator, both critics and their optimizers, and computes the
//! full WGAN-GP inpainting loss set for one batch. Gradients are left to
//! the caller; [`InpaintModel::step`] applies them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tch::{nn, Device, Tensor};
use tracing::{debug, info};

use super::discriminator::{Discriminator, DiscriminatorConfig};
use super::generator::{Generator, GeneratorConfig};
use super::optim::Adam;
use super::{ForwardOutput, InpaintModel, MaskedBatch, Net};
use crate::error::{InpaintError, Result};
use crate::mask::{local_patch, spatial_discounting_mask};
use crate::training::losses::{
    discriminator_loss_wasserstein, generator_loss_wasserstein, gradient_penalty, l1_loss,
};
use crate::training::{GeneratorLosses, LossRecord};
use crate::utils::{find_latest_checkpoint, CheckpointMeta, CheckpointPaths, Config};

/// Networks and optimizers of one device
pub struct InpaintTrainer {
    config: Arc<Config>,
    device: Device,
    gen_vs: nn::VarStore,
    /// Holds both critics, under `local` and `global`
    dis_vs: nn::VarStore,
    generator: Generator,
    local_dis: Discriminator,
    global_dis: Discriminator,
    optimizer_g: Adam,
    optimizer_d: Adam,
    /// `[1, 1, h, w]` L1 weights over the hole
    discount: Tensor,
}

impl InpaintTrainer {
    /// Build freshly initialized networks on `device`
    pub fn new(config: Arc<Config>, device: Device) -> Result<Self> {
        config.validate()?;
        let [img_h, img_w, channels] = config.data.image_shape;
        let [mask_h, mask_w] = config.mask.mask_shape;

        let gen_vs = nn::VarStore::new(device);
        let generator = Generator::new(
            &gen_vs.root(),
            GeneratorConfig {
                channels: channels as i64,
                base_filters: config.model.gen_base_filters,
            },
        );

        let dis_vs = nn::VarStore::new(device);
        let local_dis = Discriminator::new(
            &(dis_vs.root() / "local"),
            DiscriminatorConfig {
                height: mask_h as i64,
                width: mask_w as i64,
                channels: channels as i64,
                base_filters: config.model.disc_base_filters,
            },
        );
        let global_dis = Discriminator::new(
            &(dis_vs.root() / "global"),
            DiscriminatorConfig {
                height: img_h as i64,
                width: img_w as i64,
                channels: channels as i64,
                base_filters: config.model.disc_base_filters,
            },
        );

        let optimizer_g = Adam::new(&gen_vs, &config.optim);
        let optimizer_d = Adam::new(&dis_vs, &config.optim);
        let discount = spatial_discounting_mask(&config, device);

        Ok(Self {
            config,
            device,
            gen_vs,
            dis_vs,
            generator,
            local_dis,
            global_dis,
            optimizer_g,
            optimizer_d,
            discount,
        })
    }

    /// Parameter counts per network
    pub fn parameter_counts(&self) -> Vec<(&'static str, usize)> {
        let count = |vs: &nn::VarStore, prefix: Option<&str>| -> usize {
            vs.variables()
                .iter()
                .filter(|(name, _)| prefix.map(|p| name.starts_with(p)).unwrap_or(true))
                .map(|(_, t)| t.numel())
                .sum()
        };
        vec![
            ("generator", count(&self.gen_vs, None)),
            ("local_discriminator", count(&self.dis_vs, Some("local."))),
            ("global_discriminator", count(&self.dis_vs, Some("global."))),
        ]
    }

    /// One line per network and variable, for `--print-net`
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        for (label, vs) in [("generator", &self.gen_vs), ("discriminators", &self.dis_vs)] {
            lines.push(format!("{}:", label));
            let mut vars: Vec<(String, Vec<i64>)> = vs
                .variables()
                .into_iter()
                .map(|(name, t)| (name, t.size()))
                .collect();
            vars.sort();
            for (name, size) in vars {
                lines.push(format!("  {} {:?}", name, size));
            }
        }
        for (label, n) in self.parameter_counts() {
            lines.push(format!("{} parameters: {}", label, n));
        }
        lines.join("\n")
    }

    /// Optimizer updates applied so far, `(generator, discriminator)`
    pub fn optimizer_steps(&self) -> (i64, i64) {
        (self.optimizer_g.steps(), self.optimizer_d.steps())
    }

    /// Overwrite all weights with those of `other`
    pub(crate) fn sync_from(&mut self, other: &InpaintTrainer) -> Result<()> {
        self.gen_vs.copy(&other.gen_vs)?;
        self.dis_vs.copy(&other.dis_vs)?;
        Ok(())
    }

    /// Add `other`'s gradients for `net` into this trainer's
    pub(crate) fn accumulate_grads(&mut self, other: &InpaintTrainer, net: Net) -> Result<()> {
        let (dst, src) = match net {
            Net::Generator => (&self.gen_vs, &other.gen_vs),
            Net::Discriminator => (&self.dis_vs, &other.dis_vs),
        };
        let src_vars = src.variables();

        tch::no_grad(|| -> Result<()> {
            for (name, param) in dst.variables() {
                let src_param = src_vars
                    .get(&name)
                    .ok_or_else(|| InpaintError::Replica(format!("replica has no variable {}", name)))?;
                let src_grad = src_param.grad();
                let mut grad = param.grad();
                if !src_grad.defined() || !grad.defined() {
                    continue;
                }
                grad.f_add_(&src_grad.to_device(grad.device()))?;
            }
            Ok(())
        })
    }

    /// Write the four-file checkpoint set, recording `devices` in the metadata
    ///
    /// Fails without touching anything if any file of the set exists.
    pub(crate) fn write_checkpoint(&self, dir: &Path, iteration: usize, devices: usize) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let paths = CheckpointPaths::for_iteration(dir, iteration);
        if let Some(found) = paths.existing().first() {
            return Err(InpaintError::Checkpoint(format!(
                "refusing to overwrite {} for iteration {}",
                found.display(),
                iteration
            )));
        }

        self.gen_vs.save(&paths.generator)?;
        self.dis_vs.save(&paths.discriminator)?;

        let mut state = self.optimizer_g.state("gen");
        state.extend(self.optimizer_d.state("dis"));
        Tensor::save_multi(&state, &paths.optimizer)?;

        // Metadata last: a set without it is treated as incomplete
        paths.write_meta(&CheckpointMeta::new(iteration, devices))?;
        debug!("Wrote checkpoint set {:?}", paths.meta);
        Ok(())
    }

    fn check_batch(&self, batch: &MaskedBatch) -> Result<()> {
        let [img_h, img_w, channels] = self.config.data.image_shape;
        let expected = vec![batch.batch_size() as i64, channels as i64, img_h as i64, img_w as i64];
        for (label, tensor) in [("ground truth", &batch.ground_truth), ("input", &batch.input)] {
            if tensor.size() != expected {
                return Err(InpaintError::Shape(format!(
                    "{} is {:?}, expected {:?}",
                    label,
                    tensor.size(),
                    expected
                )));
            }
        }
        let mask_size = batch.mask.size();
        if mask_size.len() != 4 || mask_size[0] != expected[0] || mask_size[2..] != expected[2..] {
            return Err(InpaintError::Shape(format!("mask is {:?}", mask_size)));
        }
        Ok(())
    }
}

/// Score `real` and `fake` in one critic pass, split back in two
fn score_pair(critic: &Discriminator, real: &Tensor, fake: &Tensor) -> Result<(Tensor, Tensor)> {
    let batch_size = real.size()[0];
    if fake.size()[0] != batch_size {
        return Err(InpaintError::Shape(format!(
            "{} real and {} fake samples",
            batch_size,
            fake.size()[0]
        )));
    }
    let scores = nn::Module::forward(critic, &Tensor::cat(&[real, fake], 0));
    let mut parts = scores.split(batch_size, 0).into_iter();
    match (parts.next(), parts.next()) {
        (Some(r), Some(f)) => Ok((r, f)),
        _ => Err(InpaintError::Shape("critic output could not be split".to_string())),
    }
}

impl InpaintModel for InpaintTrainer {
    fn forward(&mut self, batch: &MaskedBatch, compute_generator_loss: bool) -> Result<ForwardOutput> {
        self.check_batch(batch)?;
        let weights = &self.config.loss;
        let boxes = &batch.boxes;
        let gt = &batch.ground_truth;
        let mask = &batch.mask;
        let keep = Tensor::ones_like(mask) - mask;

        let (x1, x2, offset_flow) = self.generator.forward(&batch.input, mask);
        let x1_inpaint = &x1 * mask + &batch.input * &keep;
        let x2_inpaint = &x2 * mask + &batch.input * &keep;

        let gt_patch = local_patch(gt, boxes);
        let x2_patch = local_patch(&x2_inpaint, boxes);

        // Critic terms see the fakes detached
        let x2_patch_fixed = x2_patch.detach();
        let x2_inpaint_fixed = x2_inpaint.detach();
        let (local_real, local_fake) = score_pair(&self.local_dis, &gt_patch, &x2_patch_fixed)?;
        let (global_real, global_fake) = score_pair(&self.global_dis, gt, &x2_inpaint_fixed)?;
        let wgan_d = discriminator_loss_wasserstein(&local_real, &local_fake)
            + discriminator_loss_wasserstein(&global_real, &global_fake) * weights.global_wgan_loss_alpha;

        let wgan_gp = gradient_penalty(&self.local_dis, &gt_patch, &x2_patch_fixed)?
            + gradient_penalty(&self.global_dis, gt, &x2_inpaint_fixed)?;

        let generator = if compute_generator_loss {
            let x1_patch = local_patch(&x1_inpaint, boxes);
            let sd = &self.discount;
            let l1 = l1_loss(&(&x1_patch * sd), &(&gt_patch * sd)) * weights.coarse_l1_alpha
                + l1_loss(&(&x2_patch * sd), &(&gt_patch * sd));
            let ae = l1_loss(&(&x1 * &keep), &(gt * &keep)) * weights.coarse_l1_alpha
                + l1_loss(&(&x2 * &keep), &(gt * &keep));

            let local_score = nn::Module::forward(&self.local_dis, &x2_patch);
            let global_score = nn::Module::forward(&self.global_dis, &x2_inpaint);
            let wgan_g = generator_loss_wasserstein(&local_score)
                + generator_loss_wasserstein(&global_score) * weights.global_wgan_loss_alpha;

            Some(GeneratorLosses { l1, ae, wgan_g })
        } else {
            None
        };

        Ok(ForwardOutput {
            losses: LossRecord {
                wgan_d,
                wgan_gp,
                generator,
            },
            inpainted: x2_inpaint,
            offset_flow,
        })
    }

    fn zero_grad(&mut self, net: Net) {
        match net {
            Net::Generator => self.optimizer_g.zero_grad(),
            Net::Discriminator => self.optimizer_d.zero_grad(),
        }
    }

    fn step(&mut self, net: Net) -> Result<()> {
        match net {
            Net::Generator => self.optimizer_g.step(),
            Net::Discriminator => self.optimizer_d.step(),
        }
        Ok(())
    }

    fn save(&self, dir: &Path, iteration: usize) -> Result<()> {
        self.write_checkpoint(dir, iteration, 1)
    }

    fn resume(&mut self, dir: &Path) -> Result<usize> {
        let (iteration, paths) =
            find_latest_checkpoint(dir).ok_or_else(|| InpaintError::CheckpointNotFound(dir.to_path_buf()))?;
        paths.read_meta(iteration)?;

        self.gen_vs.load(&paths.generator)?;
        self.dis_vs.load(&paths.discriminator)?;

        let state: HashMap<String, Tensor> = Tensor::load_multi_with_device(&paths.optimizer, self.device)?
            .into_iter()
            .collect();
        self.optimizer_g.load_state(&state, "gen")?;
        self.optimizer_d.load_state(&state, "dis")?;

        info!("Resumed from iteration {} in {}", iteration, dir.display());
        Ok(iteration)
    }

    fn device(&self) -> Device {
        self.device
    }
}
