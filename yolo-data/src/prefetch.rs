use crate::{
    batch::{Batch, BatchSource},
    common::*,
};

/// Computes the next batch on a worker thread while the current one is being
/// consumed.
///
/// The worker hands batches over a rendezvous channel, so it runs at most one
/// batch ahead. Dropping the prefetcher stops the worker at its next hand-off.
#[derive(Debug)]
pub struct Prefetcher {
    rx: flume::Receiver<Result<Batch>>,
    batch_size: usize,
    num_samples: usize,
}

impl Prefetcher {
    pub fn new<S>(mut source: S) -> Self
    where
        S: 'static + BatchSource,
    {
        let batch_size = source.batch_size();
        let num_samples = source.num_samples();
        let (tx, rx) = flume::bounded(0);

        thread::spawn(move || loop {
            let batch = source.next_batch();
            let failed = batch.is_err();
            if tx.send(batch).is_err() {
                debug!("batch consumer is gone, stop prefetching");
                break;
            }
            if failed {
                break;
            }
        });

        Self {
            rx,
            batch_size,
            num_samples,
        }
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        self.rx
            .recv()
            .map_err(|_| format_err!("the batch producer stopped unexpectedly"))?
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }
}

impl Iterator for Prefetcher {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
