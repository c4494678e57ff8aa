//! Checkpoint layout and discovery
//!
//! A checkpoint is a set of four files in the run directory, keyed by the
//! zero-padded iteration number:
//!
//! ```text
//! gen_00005000.pt    generator weights
//! dis_00005000.pt    local + global discriminator weights
//! opt_00005000.pt    both optimizers' moment buffers and step counts
//! meta_00005000.json iteration, timestamp and device count
//! ```
//!
//! Sets are never overwritten; a set missing any file is ignored on resume.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{InpaintError, Result};

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Last completed iteration
    pub iteration: usize,
    /// Timestamp of checkpoint
    pub timestamp: String,
    /// Number of devices the run was trained on
    pub devices: usize,
}

impl CheckpointMeta {
    pub fn new(iteration: usize, devices: usize) -> Self {
        Self {
            iteration,
            timestamp: chrono::Utc::now().to_rfc3339(),
            devices,
        }
    }
}

/// File set of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub generator: PathBuf,
    pub discriminator: PathBuf,
    pub optimizer: PathBuf,
    pub meta: PathBuf,
}

impl CheckpointPaths {
    /// Paths of the set saved at `iteration` under `dir`
    pub fn for_iteration<P: AsRef<Path>>(dir: P, iteration: usize) -> Self {
        let dir = dir.as_ref();
        Self {
            generator: dir.join(format!("gen_{:08}.pt", iteration)),
            discriminator: dir.join(format!("dis_{:08}.pt", iteration)),
            optimizer: dir.join(format!("opt_{:08}.pt", iteration)),
            meta: dir.join(format!("meta_{:08}.json", iteration)),
        }
    }

    /// Whether every file of the set exists
    pub fn is_complete(&self) -> bool {
        [&self.generator, &self.discriminator, &self.optimizer, &self.meta]
            .iter()
            .all(|p| p.is_file())
    }

    /// Files of the set that already exist on disk
    pub fn existing(&self) -> Vec<&Path> {
        [&self.generator, &self.discriminator, &self.optimizer, &self.meta]
            .into_iter()
            .map(PathBuf::as_path)
            .filter(|p| p.exists())
            .collect()
    }

    /// Write metadata; called last so a complete set implies finished weights
    pub fn write_meta(&self, meta: &CheckpointMeta) -> Result<()> {
        let content = serde_json::to_string_pretty(meta)?;
        std::fs::write(&self.meta, content)?;
        Ok(())
    }

    /// Read metadata and check it agrees with the file name
    pub fn read_meta(&self, expected_iteration: usize) -> Result<CheckpointMeta> {
        let content = std::fs::read_to_string(&self.meta)?;
        let meta: CheckpointMeta = serde_json::from_str(&content)?;
        if meta.iteration != expected_iteration {
            return Err(InpaintError::Checkpoint(format!(
                "{} records iteration {} but is named for {}",
                self.meta.display(),
                meta.iteration,
                expected_iteration
            )));
        }
        Ok(meta)
    }
}

/// Iterations of all complete checkpoint sets in `dir`, ascending
pub fn list_checkpoints<P: AsRef<Path>>(dir: P) -> Vec<usize> {
    let dir = dir.as_ref();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return vec![],
    };

    let mut iterations: Vec<usize> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let name = name.to_str()?;
            name.strip_prefix("gen_")?
                .strip_suffix(".pt")?
                .parse::<usize>()
                .ok()
        })
        .filter(|&iteration| CheckpointPaths::for_iteration(dir, iteration).is_complete())
        .collect();

    iterations.sort_unstable();
    iterations
}

/// Newest complete checkpoint set in `dir`
pub fn find_latest_checkpoint<P: AsRef<Path>>(dir: P) -> Option<(usize, CheckpointPaths)> {
    let dir = dir.as_ref();
    list_checkpoints(dir)
        .last()
        .map(|&iteration| (iteration, CheckpointPaths::for_iteration(dir, iteration)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_set(dir: &Path, iteration: usize) -> CheckpointPaths {
        let paths = CheckpointPaths::for_iteration(dir, iteration);
        std::fs::write(&paths.generator, b"g").unwrap();
        std::fs::write(&paths.discriminator, b"d").unwrap();
        std::fs::write(&paths.optimizer, b"o").unwrap();
        paths.write_meta(&CheckpointMeta::new(iteration, 1)).unwrap();
        paths
    }

    #[test]
    fn test_naming() {
        let paths = CheckpointPaths::for_iteration("run", 100);
        assert_eq!(paths.generator, PathBuf::from("run/gen_00000100.pt"));
        assert_eq!(paths.meta, PathBuf::from("run/meta_00000100.json"));
    }

    #[test]
    fn test_latest_complete_set_wins() {
        let dir = TempDir::new().unwrap();
        touch_set(dir.path(), 100);
        touch_set(dir.path(), 200);
        // Incomplete set: weights but no metadata
        let partial = CheckpointPaths::for_iteration(dir.path(), 300);
        std::fs::write(&partial.generator, b"g").unwrap();

        assert_eq!(list_checkpoints(dir.path()), vec![100, 200]);
        let (iteration, paths) = find_latest_checkpoint(dir.path()).unwrap();
        assert_eq!(iteration, 200);
        assert_eq!(paths.read_meta(200).unwrap().iteration, 200);
    }

    #[test]
    fn test_missing_dir() {
        assert!(find_latest_checkpoint("/nonexistent/inpainter/run").is_none());
    }

    #[test]
    fn test_meta_mismatch() {
        let dir = TempDir::new().unwrap();
        let paths = touch_set(dir.path(), 100);
        assert!(paths.read_meta(101).is_err());
    }
}
