//! Background batch prefetching
//!
//! One worker thread owns the source and keeps a bounded queue of ready
//! batches. The consumer sees a blocking, in-order [`BatchStream`].
//! The worker starts on the first pull, so the stream can still be
//! positioned with [`BatchStream::seek`] before then.

use ndarray::Array4;
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::JoinHandle;

use super::{BatchSource, BatchStream, CyclicSource};
use crate::error::{InpaintError, Result};

type BoxedSource = Box<dyn BatchSource + Send>;

/// Prefetching wrapper around a cyclic source
pub struct Prefetcher {
    /// Source and start position, until the worker takes them
    pending: Option<(BoxedSource, usize)>,
    depth: usize,
    rx: Option<Receiver<Result<Array4<f32>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    /// Prefetcher that will keep up to `depth` batches ready
    pub fn new<S>(source: S, depth: usize) -> Self
    where
        S: BatchSource + Send + 'static,
    {
        Self {
            pending: Some((Box::new(source), 0)),
            depth: depth.max(1),
            rx: None,
            handle: None,
        }
    }

    /// Whether the worker thread is running
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    fn start(&mut self) -> Result<()> {
        let Some((source, position)) = self.pending.take() else {
            return Ok(());
        };

        let (tx, rx) = sync_channel(self.depth);
        let handle = std::thread::Builder::new()
            .name("batch-prefetch".to_string())
            .spawn(move || {
                let mut stream = CyclicSource::new(source);
                if let Err(e) = stream.seek(position) {
                    let _ = tx.send(Err(e));
                    return;
                }
                loop {
                    let item = stream.pull();
                    let failed = item.is_err();
                    // Receiver gone: the trainer is shutting down
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
            })?;

        self.rx = Some(rx);
        self.handle = Some(handle);
        Ok(())
    }
}

impl BatchStream for Prefetcher {
    fn pull(&mut self) -> Result<Array4<f32>> {
        self.start()?;
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| InpaintError::Prefetch("prefetcher already shut down".to_string()))?;
        rx.recv()
            .map_err(|_| InpaintError::Prefetch("worker exited".to_string()))?
    }

    fn seek(&mut self, position: usize) -> Result<()> {
        match self.pending.as_mut() {
            Some((_, start)) => {
                *start = position;
                Ok(())
            }
            None => Err(InpaintError::Prefetch(
                "cannot seek once batches are being prefetched".to_string(),
            )),
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Closing the channel first unblocks a worker waiting on a full queue
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Batch prefetch worker panicked");
            }
        }
    }
}
