//! The shipped configuration file stays in sync with the defaults

use std::path::PathBuf;

use rust_inpainter::utils::Config;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs/default.toml")
}

#[test]
fn test_shipped_config_loads() {
    let config = Config::load(shipped_config()).unwrap();
    let defaults = Config::default();

    assert_eq!(config.data.image_shape, defaults.data.image_shape);
    assert_eq!(config.mask.mask_shape, defaults.mask.mask_shape);
    assert_eq!(config.train.n_critic, defaults.train.n_critic);
    assert_eq!(config.train.niter, defaults.train.niter);
    assert!(config.train.resume.is_none());
    assert_eq!(
        config.run_dir(),
        PathBuf::from("checkpoints/imagenet/hole_benchmark")
    );
}
