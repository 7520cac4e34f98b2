//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, HW, TLBR};
pub use chrono::{DateTime, Local};
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt::Debug,
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT as _, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use yolo_data::{
    AnchorSet, AnchorTargetEncoder, AnnotationRecord, Batch, BatchInputs, BatchSource,
    BatchStream, BottleneckBatchStream, BottleneckCache, BottleneckFeatures, CacheFingerprint,
    DatasetSplit, FeatureExtractor, LetterboxProducer, Prefetcher, SampleProducer, Scale,
    ScaleTargets, ANCHORS_PER_SCALE,
};
