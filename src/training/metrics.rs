//! Training metrics for monitoring GAN progress
//!
//! Provides the scalar sink the training loop reports losses to, a CSV
//! implementation of it, and a throughput meter for the status line.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Instant;

use crate::error::Result;

/// Receiver of `(tag, value, step)` scalars
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

impl<S: ScalarSink + ?Sized> ScalarSink for &mut S {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }
}

/// Appends scalars to a CSV file with columns `tag,value,step`
pub struct CsvScalarWriter {
    writer: csv::Writer<std::fs::File>,
}

impl CsvScalarWriter {
    /// Open `path` for appending; the header is written only to a new file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_new = !path.exists() || std::fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(["tag", "value", "step"])?;
            writer.flush()?;
        }
        Ok(Self { writer })
    }
}

impl ScalarSink for CsvScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.writer
            .write_record([tag.to_string(), value.to_string(), step.to_string()])?;
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory scalar log
#[derive(Debug, Clone, Default)]
pub struct ScalarHistory {
    pub records: Vec<(String, f64, usize)>,
}

impl ScalarHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of one tag in insertion order
    pub fn series(&self, tag: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, s)| (*s, *v))
            .collect()
    }
}

impl ScalarSink for ScalarHistory {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.records.push((tag.to_string(), value, step));
        Ok(())
    }
}

/// Batches-per-second over each logging window
#[derive(Debug)]
pub struct ThroughputMeter {
    window_start: Instant,
    iterations: usize,
    estimated: bool,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            iterations: 0,
            estimated: false,
        }
    }

    /// Count one finished iteration
    pub fn tick(&mut self) {
        self.iterations += 1;
    }

    /// Close the window: `(batches_per_second, window_seconds)`
    pub fn lap(&mut self) -> (f64, f64) {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.iterations as f64 / elapsed
        } else {
            0.0
        };
        self.window_start = Instant::now();
        self.iterations = 0;
        (speed, elapsed)
    }

    /// Total run length in days, extrapolated from the first window only
    ///
    /// Returns `None` on every later call.
    pub fn estimate_days(&mut self, niter: usize, iteration: usize, window_seconds: f64) -> Option<f64> {
        if self.estimated || iteration == 0 {
            return None;
        }
        self.estimated = true;
        Some(total_days(niter, iteration, window_seconds))
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// `(niter / iteration) * window_seconds`, in days
pub fn total_days(niter: usize, iteration: usize, window_seconds: f64) -> f64 {
    (niter as f64 / iteration as f64) * window_seconds / 86400.0
}
