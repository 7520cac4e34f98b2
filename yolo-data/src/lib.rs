//! Data side of the staged YOLO fine-tuning pipeline: annotation parsing,
//! anchor-grid target encoding, batch streams and the bottleneck cache.

mod common;

pub mod anchors;
pub mod annotation;
pub mod batch;
pub mod cache;
pub mod color;
pub mod encoder;
pub mod prefetch;
pub mod producer;
pub mod stream;

pub use anchors::{AnchorSet, Scale, ANCHORS_PER_SCALE, NUM_SCALES};
pub use annotation::{
    load_annotation_file, load_classes_file, split_records, AnnotationRecord, DatasetSplit,
};
pub use batch::{Batch, BatchInputs, BatchSource};
pub use cache::{
    BottleneckCache, BottleneckFeatures, CacheFingerprint, CacheHandle, FeatureExtractor,
    WeightsStamp,
};
pub use color::ColorJitter;
pub use encoder::{AnchorTargetEncoder, Assignment, ScaleTargets};
pub use prefetch::Prefetcher;
pub use producer::{LetterboxProducer, Sample, SampleProducer};
pub use stream::{BatchStream, BottleneckBatchStream, Cursor};
