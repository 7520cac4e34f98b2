use crate::{cache::BottleneckFeatures, common::*, encoder::ScaleTargets};

/// Model inputs of a batch.
#[derive(Debug)]
pub enum BatchInputs {
    /// `[b, 3, H, W]` images.
    Images(Tensor),
    /// Cached backbone features of the batch samples.
    Features(BottleneckFeatures),
}

impl BatchInputs {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Images(images) => images.size()[0] as usize,
            Self::Features(features) => features.len(),
        }
    }

    pub fn to_device(&self, device: Device) -> Self {
        match self {
            Self::Images(images) => Self::Images(images.to_device(device)),
            Self::Features(features) => Self::Features(features.to_device(device)),
        }
    }
}

/// One training or validation batch.
#[derive(Debug)]
pub struct Batch {
    pub inputs: BatchInputs,
    pub targets: ScaleTargets,
    /// Zeros of length `b`, the dummy label the loss output is compared against.
    pub placeholder: Tensor,
    /// Positions of the samples in the sequence the stream was built from.
    pub sample_ids: Vec<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            inputs: self.inputs.to_device(device),
            targets: self.targets.to_device(device),
            placeholder: self.placeholder.to_device(device),
            sample_ids: self.sample_ids.clone(),
        }
    }
}

/// A restartable, unbounded source of batches.
pub trait BatchSource
where
    Self: Send,
{
    fn next_batch(&mut self) -> Result<Batch>;

    /// Rewinds to the start of the sequence.
    fn reset(&mut self);

    fn batch_size(&self) -> usize;

    /// The number of samples the source cycles over.
    fn num_samples(&self) -> usize;
}

impl<S> BatchSource for Box<S>
where
    S: BatchSource + ?Sized,
{
    fn next_batch(&mut self) -> Result<Batch> {
        (**self).next_batch()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }

    fn num_samples(&self) -> usize {
        (**self).num_samples()
    }
}
