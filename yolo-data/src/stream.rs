//! Restartable batch streams over annotation sequences.

use crate::{
    annotation::AnnotationRecord,
    batch::{Batch, BatchInputs, BatchSource},
    cache::BottleneckFeatures,
    common::*,
    encoder::AnchorTargetEncoder,
    producer::SampleProducer,
};

/// Wrapping position in a sequence of `len` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    index: usize,
    len: usize,
}

impl Cursor {
    pub fn new(len: usize) -> Self {
        Self { index: 0, len }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_at_start(&self) -> bool {
        self.index == 0
    }

    /// Returns the current position and moves one step forward, wrapping to
    /// the start at the end of the sequence.
    pub fn advance(&mut self) -> usize {
        let current = self.index;
        self.index = (self.index + 1) % self.len;
        current
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }
}

/// Unbounded batches of images and encoded targets.
///
/// With augmentation the visiting order is reshuffled at the start of every
/// pass over the sequence. Without it the sequence is cycled in its given
/// order.
pub struct BatchStream {
    records: Vec<Arc<AnnotationRecord>>,
    order: Vec<usize>,
    cursor: Cursor,
    batch_size: usize,
    encoder: Arc<AnchorTargetEncoder>,
    producer: Arc<dyn SampleProducer>,
    augment: bool,
    rng: StdRng,
}

impl Debug for BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("num_samples", &self.records.len())
            .field("cursor", &self.cursor)
            .field("batch_size", &self.batch_size)
            .field("augment", &self.augment)
            .finish()
    }
}

impl BatchStream {
    /// Returns `None` for an empty sequence or a zero batch size.
    pub fn new(
        records: Vec<Arc<AnnotationRecord>>,
        batch_size: usize,
        encoder: Arc<AnchorTargetEncoder>,
        producer: Arc<dyn SampleProducer>,
        augment: bool,
        seed: u64,
    ) -> Option<Self> {
        if records.is_empty() || batch_size == 0 {
            return None;
        }

        let num_samples = records.len();
        Some(Self {
            order: (0..num_samples).collect(),
            cursor: Cursor::new(num_samples),
            records,
            batch_size,
            encoder,
            producer,
            augment,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn augment(&self) -> bool {
        self.augment
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        let input_size = self.encoder.input_size();
        let mut sample_ids = Vec::with_capacity(self.batch_size);
        let mut images = Vec::with_capacity(self.batch_size);
        let mut boxes = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            if self.augment && self.cursor.is_at_start() {
                self.order.shuffle(&mut self.rng);
            }
            let sample_id = self.order[self.cursor.advance()];
            let record = &self.records[sample_id];

            let sample = self.producer.produce(
                record,
                input_size,
                self.augment,
                true,
                &mut self.rng,
            )?;
            let image = sample.image.ok_or_else(|| {
                format_err!("no image produced for '{}'", record.image.display())
            })?;

            sample_ids.push(sample_id);
            images.push(image);
            boxes.push(sample.boxes);
        }

        let targets = self.encoder.encode(&boxes)?;
        Ok(Batch {
            inputs: BatchInputs::Images(Tensor::stack(&images, 0)),
            targets,
            placeholder: Tensor::zeros(&[self.batch_size as i64], FLOAT_CPU),
            sample_ids,
        })
    }

    /// Rewinds to the start. The next batch reshuffles when augmenting.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }
}

impl BatchSource for BatchStream {
    fn next_batch(&mut self) -> Result<Batch> {
        BatchStream::next_batch(self)
    }

    fn reset(&mut self) {
        BatchStream::reset(self)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_samples(&self) -> usize {
        self.records.len()
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Unbounded batches of cached backbone features and encoded targets.
///
/// The sequence is always cycled in its given order and only the box
/// geometry is computed per step.
pub struct BottleneckBatchStream {
    records: Vec<Arc<AnnotationRecord>>,
    features: BottleneckFeatures,
    cursor: Cursor,
    batch_size: usize,
    encoder: Arc<AnchorTargetEncoder>,
    producer: Arc<dyn SampleProducer>,
    rng: StdRng,
}

impl Debug for BottleneckBatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottleneckBatchStream")
            .field("num_samples", &self.records.len())
            .field("cursor", &self.cursor)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl BottleneckBatchStream {
    /// Returns `Ok(None)` for an empty sequence or a zero batch size, and an
    /// error if the features do not pair up with the records.
    pub fn new(
        records: Vec<Arc<AnnotationRecord>>,
        features: BottleneckFeatures,
        batch_size: usize,
        encoder: Arc<AnchorTargetEncoder>,
        producer: Arc<dyn SampleProducer>,
    ) -> Result<Option<Self>> {
        if records.is_empty() || batch_size == 0 {
            return Ok(None);
        }
        ensure!(
            features.len() == records.len(),
            "the bottleneck cache holds {} samples, but there are {} records",
            features.len(),
            records.len()
        );

        Ok(Some(Self {
            cursor: Cursor::new(records.len()),
            records,
            features,
            batch_size,
            encoder,
            producer,
            rng: StdRng::seed_from_u64(0),
        }))
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        let input_size = self.encoder.input_size();
        let mut sample_ids = Vec::with_capacity(self.batch_size);
        let mut boxes = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            let sample_id = self.cursor.advance();
            let record = &self.records[sample_id];
            let sample = self
                .producer
                .produce(record, input_size, false, false, &mut self.rng)?;
            sample_ids.push(sample_id);
            boxes.push(sample.boxes);
        }

        let targets = self.encoder.encode(&boxes)?;
        Ok(Batch {
            inputs: BatchInputs::Features(self.features.select(&sample_ids)),
            targets,
            placeholder: Tensor::zeros(&[self.batch_size as i64], FLOAT_CPU),
            sample_ids,
        })
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
    }
}

impl BatchSource for BottleneckBatchStream {
    fn next_batch(&mut self) -> Result<Batch> {
        BottleneckBatchStream::next_batch(self)
    }

    fn reset(&mut self) {
        BottleneckBatchStream::reset(self)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_samples(&self) -> usize {
        self.records.len()
    }
}

impl Iterator for BottleneckBatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
