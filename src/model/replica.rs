//! Data-parallel execution over several devices
//!
//! The device-0 trainer is the primary and owns the authoritative weights
//! and optimizers. Every other device holds a replica that is refreshed
//! from the primary before each forward pass. A batch is cut into equal
//! contiguous shards, each shard runs on its own thread, and all threads
//! are joined before the losses are averaged on the primary device.
//! Replica gradients are summed into the primary's before it steps.

use std::path::Path;
use std::sync::Arc;

use tch::{Device, Tensor};
use tracing::info;

use super::trainer::InpaintTrainer;
use super::{ForwardOutput, InpaintModel, MaskedBatch, Net};
use crate::error::{InpaintError, Result};
use crate::training::LossRecord;
use crate::utils::Config;

/// Primary trainer plus one replica per extra device
pub struct ReplicaCoordinator {
    primary: InpaintTrainer,
    replicas: Vec<InpaintTrainer>,
    devices: Vec<Device>,
}

impl ReplicaCoordinator {
    /// One trainer per device; `devices[0]` becomes the primary
    pub fn new(config: Arc<Config>, devices: &[Device]) -> Result<Self> {
        let (&first, rest) = devices
            .split_first()
            .ok_or_else(|| InpaintError::Config("no devices to train on".to_string()))?;
        if config.data.batch_size % devices.len() != 0 {
            return Err(InpaintError::UnevenShards {
                batch_size: config.data.batch_size,
                devices: devices.len(),
            });
        }

        let primary = InpaintTrainer::new(config.clone(), first)?;
        let mut replicas = Vec::with_capacity(rest.len());
        for &device in rest {
            let mut replica = InpaintTrainer::new(config.clone(), device)?;
            replica.sync_from(&primary)?;
            replicas.push(replica);
        }

        info!(
            "Replicating over {} devices, {} samples per device",
            devices.len(),
            config.data.batch_size / devices.len()
        );

        Ok(Self {
            primary,
            replicas,
            devices: devices.to_vec(),
        })
    }

    pub fn primary(&self) -> &InpaintTrainer {
        &self.primary
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

impl InpaintModel for ReplicaCoordinator {
    fn forward(&mut self, batch: &MaskedBatch, compute_generator_loss: bool) -> Result<ForwardOutput> {
        let shards = batch.shard(&self.devices)?;

        for replica in self.replicas.iter_mut() {
            replica.sync_from(&self.primary)?;
        }

        let workers = std::iter::once(&mut self.primary).chain(self.replicas.iter_mut());
        let outputs: Vec<ForwardOutput> = std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .zip(shards)
                .map(|(trainer, shard)| scope.spawn(move || trainer.forward(&shard, compute_generator_loss)))
                .collect();

            // Join all before reporting, so no shard outlives a failure
            let joined: Vec<Result<ForwardOutput>> = handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => Err(InpaintError::Replica("shard thread panicked".to_string())),
                })
                .collect();
            joined.into_iter().collect::<Result<Vec<_>>>()
        })?;

        let target = self.primary.device();
        let mut records = Vec::with_capacity(outputs.len());
        let mut inpainted = Vec::with_capacity(outputs.len());
        let mut flows = Vec::with_capacity(outputs.len());
        for output in outputs {
            records.push(output.losses);
            inpainted.push(output.inpainted.to_device(target));
            flows.push(output.offset_flow.map(|f| f.to_device(target)));
        }

        let offset_flow = flows
            .into_iter()
            .collect::<Option<Vec<Tensor>>>()
            .map(|f| Tensor::cat(&f, 0));

        Ok(ForwardOutput {
            losses: LossRecord::mean_of(&records, target)?,
            inpainted: Tensor::cat(&inpainted, 0),
            offset_flow,
        })
    }

    fn zero_grad(&mut self, net: Net) {
        self.primary.zero_grad(net);
        for replica in self.replicas.iter_mut() {
            replica.zero_grad(net);
        }
    }

    fn step(&mut self, net: Net) -> Result<()> {
        for replica in &self.replicas {
            self.primary.accumulate_grads(replica, net)?;
        }
        self.primary.step(net)
    }

    fn save(&self, dir: &Path, iteration: usize) -> Result<()> {
        self.primary.write_checkpoint(dir, iteration, self.devices.len())
    }

    fn resume(&mut self, dir: &Path) -> Result<usize> {
        let iteration = self.primary.resume(dir)?;
        for replica in self.replicas.iter_mut() {
            replica.sync_from(&self.primary)?;
        }
        Ok(iteration)
    }

    fn device(&self) -> Device {
        self.primary.device()
    }
}

#[cfg(test)]
mod tests {
    use super::super::trainer::tests::{tiny_batch, tiny_config};
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    #[test]
    fn test_single_device_matches_trainer() {
        let config = Arc::new(tiny_config());
        let mut coordinator = ReplicaCoordinator::new(config.clone(), &[Device::Cpu]).unwrap();
        let batch = tiny_batch(&config, 5);

        let out = coordinator.forward(&batch, true).unwrap();
        assert_eq!(out.inpainted.size(), vec![2, 3, 16, 16]);
        assert!(out.losses.generator.is_some());
        assert_eq!(coordinator.num_devices(), 1);
    }

    #[test]
    fn test_two_replicas_average_losses() {
        let config = Arc::new(tiny_config());
        let mut coordinator = ReplicaCoordinator::new(config.clone(), &[Device::Cpu, Device::Cpu]).unwrap();
        let batch = tiny_batch(&config, 6);

        let out = coordinator.forward(&batch, true).unwrap();
        assert_eq!(out.inpainted.size(), vec![2, 3, 16, 16]);

        // The ae term has no randomness, so it equals the mean of the
        // per-shard values computed by the primary alone
        let shards = batch.shard(&[Device::Cpu, Device::Cpu]).unwrap();
        let per_shard: Vec<f64> = shards
            .iter()
            .map(|s| {
                let o = coordinator.primary.forward(s, true).unwrap();
                o.losses.generator.unwrap().ae.double_value(&[])
            })
            .collect();
        let ae = out.losses.generator.unwrap().ae.double_value(&[]);
        assert_relative_eq!(ae, crate::training::mean_reduce(&per_shard), epsilon = 1e-5);
    }

    #[test]
    fn test_steps_apply_to_primary_and_sync() {
        let config = Arc::new(tiny_config());
        let mut coordinator = ReplicaCoordinator::new(config.clone(), &[Device::Cpu, Device::Cpu]).unwrap();
        let batch = tiny_batch(&config, 7);

        let out = coordinator.forward(&batch, false).unwrap();
        let d = out.losses.scalarized().discriminator_objective(&config.loss);
        coordinator.zero_grad(Net::Discriminator);
        d.backward();
        coordinator.step(Net::Discriminator).unwrap();

        assert_eq!(coordinator.primary().optimizer_steps(), (0, 1));
        assert_eq!(coordinator.replicas[0].optimizer_steps(), (0, 0));

        // The next forward refreshes the replica from the stepped primary
        coordinator.forward(&batch, false).unwrap();
        let shard = &batch.shard(&[Device::Cpu, Device::Cpu]).unwrap()[0];
        let from_primary = coordinator.primary.forward(shard, false).unwrap().inpainted;
        let from_replica = coordinator.replicas[0].forward(shard, false).unwrap().inpainted;
        assert!(from_primary.allclose(&from_replica, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_uneven_batch_rejected() {
        let mut config = tiny_config();
        config.data.batch_size = 3;
        assert!(matches!(
            ReplicaCoordinator::new(Arc::new(config), &[Device::Cpu, Device::Cpu]),
            Err(InpaintError::UnevenShards { .. })
        ));
    }

    #[test]
    fn test_save_records_device_count() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(tiny_config());
        let coordinator = ReplicaCoordinator::new(config, &[Device::Cpu, Device::Cpu]).unwrap();

        coordinator.save(dir.path(), 3).unwrap();
        let meta = crate::utils::CheckpointPaths::for_iteration(dir.path(), 3)
            .read_meta(3)
            .unwrap();
        assert_eq!(meta.devices, 2);
    }
}
