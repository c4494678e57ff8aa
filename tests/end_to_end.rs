//! Short real training runs on a tiny image folder

use std::sync::Arc;

use image::RgbImage;
use tch::Device;
use tempfile::TempDir;

use rust_inpainter::data::{CyclicSource, DataLoader, ImageDataset, Prefetcher};
use rust_inpainter::model::{InpaintTrainer, ReplicaCoordinator};
use rust_inpainter::training::{CsvScalarWriter, TrainingLoop};
use rust_inpainter::utils::{list_checkpoints, Config};

fn write_images(dir: &std::path::Path, n: usize) {
    for i in 0..n {
        let image = RgbImage::from_fn(20, 20, |x, y| {
            image::Rgb([(x * 12) as u8, (y * 12) as u8, (i * 40) as u8])
        });
        image.save(dir.join(format!("img_{}.png", i))).unwrap();
    }
}

fn tiny_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.data.train_data_path = data_dir.to_string_lossy().to_string();
    config.data.image_shape = [16, 16, 3];
    config.data.batch_size = 2;
    config.data.num_workers = 0;
    config.mask.mask_shape = [8, 8];
    config.mask.max_delta_shape = [2, 2];
    config.model.gen_base_filters = 4;
    config.model.disc_base_filters = 4;
    config.train.n_critic = 2;
    config.train.niter = 4;
    config.train.print_iter = 2;
    config.train.viz_iter = 4;
    config.train.snapshot_save_iter = 2;
    config
}

#[test]
fn test_train_then_resume() {
    let data = TempDir::new().unwrap();
    let run = TempDir::new().unwrap();
    write_images(data.path(), 5);

    let config = tiny_config(data.path());
    let dataset = ImageDataset::new(&config.data).unwrap();
    let loader = DataLoader::new(dataset.clone(), 2, true, 1).unwrap();
    let trainer = InpaintTrainer::new(Arc::new(config.clone()), Device::Cpu).unwrap();
    let scalars = CsvScalarWriter::open(run.path().join("scalars.csv")).unwrap();

    let mut training = TrainingLoop::new(
        &config,
        trainer,
        CyclicSource::new(loader),
        scalars,
        run.path().to_path_buf(),
        1,
    );
    let summary = training.run().unwrap();
    assert_eq!(summary.last_iteration, 4);
    assert_eq!(summary.generator_steps, 2);
    assert_eq!(training.model().optimizer_steps(), (2, 4));

    assert_eq!(list_checkpoints(run.path()), vec![2, 4]);
    assert!(run.path().join("niter_004.png").exists());

    let csv = std::fs::read_to_string(run.path().join("scalars.csv")).unwrap();
    // Header plus seven keys at iterations 2 and 4
    assert_eq!(csv.lines().count(), 1 + 7 * 2);

    // Second run picks up at iteration 5
    let mut resumed = config.clone();
    resumed.train.niter = 6;
    resumed.train.resume = Some(run.path().to_string_lossy().to_string());
    let loader = DataLoader::new(dataset, 2, true, 2).unwrap();
    let trainer = InpaintTrainer::new(Arc::new(resumed.clone()), Device::Cpu).unwrap();
    let scalars = CsvScalarWriter::open(run.path().join("scalars.csv")).unwrap();

    let mut training = TrainingLoop::new(
        &resumed,
        trainer,
        Prefetcher::new(loader, 2),
        scalars,
        run.path().to_path_buf(),
        2,
    );
    let summary = training.run().unwrap();
    assert_eq!(summary.start_iteration, 5);
    assert_eq!(summary.last_iteration, 6);
    // Optimizer step counts carry over from the checkpoint
    assert_eq!(training.model().optimizer_steps(), (3, 6));
    assert_eq!(list_checkpoints(run.path()), vec![2, 4, 6]);
}

#[test]
fn test_replicated_training_on_two_cpu_shards() {
    let data = TempDir::new().unwrap();
    let run = TempDir::new().unwrap();
    write_images(data.path(), 4);

    let mut config = tiny_config(data.path());
    config.train.niter = 2;
    config.train.viz_iter = 100;
    let dataset = ImageDataset::new(&config.data).unwrap();
    let loader = DataLoader::new(dataset, 2, false, 0).unwrap();
    let coordinator = ReplicaCoordinator::new(Arc::new(config.clone()), &[Device::Cpu, Device::Cpu]).unwrap();
    let scalars = CsvScalarWriter::open(run.path().join("scalars.csv")).unwrap();

    let mut training = TrainingLoop::new(
        &config,
        coordinator,
        CyclicSource::new(loader),
        scalars,
        run.path().to_path_buf(),
        0,
    );
    let summary = training.run().unwrap();

    assert_eq!(summary.discriminator_steps, 2);
    assert_eq!(training.model().primary().optimizer_steps(), (1, 2));
    assert_eq!(list_checkpoints(run.path()), vec![2]);
}
