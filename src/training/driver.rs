//! Iteration-based training loop
//!
//! Runs iterations `start..=niter`. Every iteration the critics are
//! updated; every `n_critic`-th iteration the generator is updated as well.
//! Logging, visualization and checkpointing happen on their own cadences.
//!
//! Iteration `i` draws batch number `i - 1` of the stream and masks it with
//! an RNG seeded from `(seed, i)`, so a resumed run sees the same inputs as
//! an uninterrupted one.

use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Tensor;
use tracing::{error, info};

use super::losses::LossSnapshot;
use super::metrics::{ScalarSink, ThroughputMeter};
use crate::data::{to_tensor, BatchStream};
use crate::error::{error_chain, InpaintError, Result};
use crate::mask::{mask_image, random_bbox};
use crate::model::{ForwardOutput, InpaintModel, MaskedBatch, Net};
use crate::utils::{derive_seed, save_image_grid, Config};

/// Images per row of the visualization grid
const VIZ_NROW: usize = 9;

/// Counters of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingSummary {
    /// First iteration executed
    pub start_iteration: usize,
    /// Iteration counter at exit
    pub last_iteration: usize,
    pub generator_steps: usize,
    pub discriminator_steps: usize,
}

/// Drives an [`InpaintModel`] over a [`BatchStream`]
pub struct TrainingLoop<'a, M, B, S> {
    config: &'a Config,
    model: M,
    batches: B,
    scalars: S,
    run_dir: PathBuf,
    seed: u64,
    throughput: ThroughputMeter,
    progress: Option<ProgressBar>,
    generator_steps: usize,
    discriminator_steps: usize,
}

impl<'a, M, B, S> TrainingLoop<'a, M, B, S>
where
    M: InpaintModel,
    B: BatchStream,
    S: ScalarSink,
{
    /// `seed` drives the occlusion boxes and masks
    pub fn new(config: &'a Config, model: M, batches: B, scalars: S, run_dir: PathBuf, seed: u64) -> Self {
        Self {
            config,
            model,
            batches,
            scalars,
            run_dir,
            seed,
            throughput: ThroughputMeter::new(),
            progress: None,
            generator_steps: 0,
            discriminator_steps: 0,
        }
    }

    /// Report progress to `bar`, one tick per iteration
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// `resume + 1` when a resume directory is configured, else 1
    pub fn start_iteration(&mut self) -> Result<usize> {
        let config = self.config;
        match &config.train.resume {
            Some(dir) => {
                let saved = self.model.resume(Path::new(dir))?;
                Ok(saved + 1)
            }
            None => Ok(1),
        }
    }

    /// Resume if configured, then train to `niter`
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let start = match self.start_iteration() {
            Ok(start) => start,
            Err(e) => {
                error!("Resume failed: {}", error_chain(&e));
                return Err(e);
            }
        };
        self.run_from(start)
    }

    /// Train iterations `start..=niter`
    ///
    /// The batch stream is first positioned past the `start - 1` batches
    /// that earlier iterations consumed. The first failing iteration is
    /// logged and its error returned.
    pub fn run_from(&mut self, start: usize) -> Result<TrainingSummary> {
        let niter = self.config.train.niter;
        info!("Training iterations {}..={}", start, niter);
        if let Err(e) = self.batches.seek(start.saturating_sub(1)) {
            error!("Positioning the batch stream failed: {}", error_chain(&e));
            return Err(e);
        }
        if let Some(bar) = &self.progress {
            bar.set_position(start.saturating_sub(1) as u64);
        }

        let mut iteration = start.saturating_sub(1);
        for it in start..=niter {
            if let Err(e) = self.iterate(it) {
                error!("Iteration {} failed: {}", it, error_chain(&e));
                return Err(e);
            }
            iteration = it;
        }

        if let Some(bar) = &self.progress {
            bar.finish_with_message("done");
        }

        Ok(TrainingSummary {
            start_iteration: start,
            last_iteration: iteration,
            generator_steps: self.generator_steps,
            discriminator_steps: self.discriminator_steps,
        })
    }

    fn iterate(&mut self, iteration: usize) -> Result<()> {
        let config = self.config;
        let train = &config.train;
        let host_batch = self.batches.pull()?;
        let ground_truth = to_tensor(&host_batch, self.model.device());
        let batch_size = host_batch.shape()[0];

        let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, iteration as u64));
        let boxes = random_bbox(config, batch_size, &mut rng);
        let (input, mask) = mask_image(&ground_truth, &boxes, config, &mut rng)?;
        let batch = MaskedBatch {
            ground_truth,
            input,
            mask,
            boxes,
        };

        let compute_g = iteration % train.n_critic == 0;
        let output = self.model.forward(&batch, compute_g)?;
        let losses = output.losses.scalarized();

        self.model.zero_grad(Net::Discriminator);
        let d = losses.discriminator_objective(&config.loss);
        d.f_backward()?;

        let g = if compute_g {
            self.model.zero_grad(Net::Generator);
            let g = losses.generator_objective(&config.loss)?;
            g.f_backward()?;
            self.model.step(Net::Generator)?;
            self.generator_steps += 1;
            Some(g)
        } else {
            None
        };

        // The critic steps last: the generator loss also reaches its weights
        self.model.step(Net::Discriminator)?;
        self.discriminator_steps += 1;
        self.throughput.tick();

        if iteration % train.print_iter == 0 {
            let snapshot = LossSnapshot::new(&losses, &d, g.as_ref());
            self.report(iteration, &snapshot)?;
        }

        if iteration % train.viz_iter == 0 {
            self.visualize(iteration, &batch, &output)?;
        }

        if iteration % train.snapshot_save_iter == 0 {
            self.model.save(&self.run_dir, iteration)?;
            info!("Saved checkpoint at iteration {}", iteration);
        }

        if let Some(bar) = &self.progress {
            bar.inc(1);
        }
        Ok(())
    }

    fn report(&mut self, iteration: usize, snapshot: &LossSnapshot) -> Result<()> {
        let niter = self.config.train.niter;
        let (speed, window) = self.throughput.lap();
        if let Some(days) = self.throughput.estimate_days(niter, iteration, window) {
            info!("Estimated total training time: {:.2} days", days);
        }

        for (key, value) in snapshot.entries() {
            self.scalars.add_scalar(key, value, iteration)?;
        }

        let line = format!(
            "Iter: [{}/{}] {} speed: {:.2} batches/s",
            iteration,
            niter,
            snapshot.format(),
            speed
        );
        info!("{}", line);
        if let Some(bar) = &self.progress {
            bar.set_message(format!("d: {:.4} g: {:.4}", snapshot.d, snapshot.g));
        }
        Ok(())
    }

    fn visualize(&self, iteration: usize, batch: &MaskedBatch, output: &ForwardOutput) -> Result<()> {
        let n = batch.batch_size().min(self.config.train.viz_max_out) as i64;
        let mut columns = vec![batch.input.narrow(0, 0, n), output.inpainted.narrow(0, 0, n)];
        if let Some(flow) = &output.offset_flow {
            columns.push(flow.narrow(0, 0, n).to_device(batch.input.device()));
        }

        // Interleave per sample: masked, inpainted[, flow]
        let size = batch.input.size();
        let images = Tensor::stack(&columns, 1).view([-1, size[1], size[2], size[3]]);
        if images.size()[0] == 0 {
            return Err(InpaintError::Shape("nothing to visualize".to_string()));
        }

        let path = viz_path(&self.run_dir, iteration);
        save_image_grid(&images.detach(), &path, VIZ_NROW, true)?;
        Ok(())
    }
}

/// `<run_dir>/niter_<iteration>.png`, at least three digits
pub fn viz_path(run_dir: &Path, iteration: usize) -> PathBuf {
    run_dir.join(format!("niter_{:03}.png", iteration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viz_path() {
        let dir = Path::new("runs");
        assert_eq!(viz_path(dir, 50), PathBuf::from("runs/niter_050.png"));
        assert_eq!(viz_path(dir, 12000), PathBuf::from("runs/niter_12000.png"));
    }
}
