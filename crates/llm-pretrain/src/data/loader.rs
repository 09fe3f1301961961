//! Prefetching record loader.
//!
//! - One bounded channel per worker thread, depth = prefetch factor
//! - Worker `w` produces steps `start + w`, `start + w + n`, ...
//! - The consumer reads workers round-robin, so batch order is deterministic

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use super::dataset::RecordDataset;
use super::sampler::RandomSampler;
use crate::error::{TrainError, TrainResult};

/// Raw records for one training step.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub step: usize,
    pub records: Vec<Vec<u32>>,
}

/// Loader with prefetching worker threads.
pub struct PrefetchLoader {
    receivers: Vec<Receiver<TrainResult<RawBatch>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    consumed: usize,
    total: usize,
}

impl PrefetchLoader {
    pub fn new(
        dataset: Arc<dyn RecordDataset>,
        sampler: RandomSampler,
        steps: Range<usize>,
        n_workers: usize,
        prefetch_factor: usize,
    ) -> Self {
        let n_workers = n_workers.max(1);
        let total = steps.len();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut receivers = Vec::with_capacity(n_workers);
        let mut workers = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let (tx, rx) = bounded(prefetch_factor.max(1));
            receivers.push(rx);

            let dataset = Arc::clone(&dataset);
            let sampler = sampler.clone();
            let shutdown = Arc::clone(&shutdown);
            let worker_steps = steps.clone().skip(worker_id).step_by(n_workers);

            let handle = thread::Builder::new()
                .name(format!("prefetch-{worker_id}"))
                .spawn(move || {
                    Self::worker_loop(dataset, sampler, worker_steps, tx, shutdown);
                });
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => {
                    // The consumer sees a closed queue for this worker and
                    // reports it on the first batch it owes.
                    tracing::error!(worker_id, error = %e, "Failed to spawn prefetch worker");
                }
            }
        }

        Self {
            receivers,
            workers,
            shutdown,
            consumed: 0,
            total,
        }
    }

    fn worker_loop(
        dataset: Arc<dyn RecordDataset>,
        sampler: RandomSampler,
        steps: impl Iterator<Item = usize>,
        tx: Sender<TrainResult<RawBatch>>,
        shutdown: Arc<AtomicBool>,
    ) {
        for step in steps {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let batch = sampler
                .batch_indices(step)
                .into_iter()
                .map(|idx| dataset.get_record(idx))
                .collect::<TrainResult<Vec<_>>>()
                .map(|records| RawBatch { step, records });
            let failed = batch.is_err();

            // Blocks while the queue is full; errors once the loader is dropped.
            if tx.send(batch).is_err() {
                break;
            }
            if failed {
                break;
            }
        }
    }

    /// Next batch in step order; `None` once every step has been delivered.
    pub fn next_batch(&mut self) -> Option<TrainResult<RawBatch>> {
        if self.consumed >= self.total {
            return None;
        }
        let worker = self.consumed % self.receivers.len();
        let result = match self.receivers[worker].recv() {
            Ok(batch) => batch,
            Err(_) => Err(TrainError::WorkerPanic(format!(
                "prefetch worker {} exited before delivering its batches",
                worker
            ))),
        };
        self.consumed += 1;
        Some(result)
    }
}

impl Iterator for PrefetchLoader {
    type Item = TrainResult<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Disconnecting the queues unblocks workers stuck in `send`.
        self.receivers.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
